//! Mobile device support (iOS and Android FFI)
//!
//! Hosts own an opaque [`SsrAcceleratorHandle`] created by
//! [`ssr_accelerator_new`] and released with [`ssr_accelerator_free`]. Each
//! handle drives its accelerator on a private multi-thread tokio runtime, so
//! every entry point is a plain blocking call from the host's point of view.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int};

use crate::accelerator::Accelerator;
use crate::config::SessionConfig;
use crate::SsrError;

/// Returned on success by every fallible entry point
pub const SSR_OK: c_int = 0;

/// Null handle or argument; not part of the `SsrError` range
pub const SSR_NULL_ARGUMENT: c_int = -99;

/// Opaque accelerator handle for FFI
pub struct SsrAcceleratorHandle {
    runtime: tokio::runtime::Runtime,
    accelerator: Accelerator,
}

fn error_code(err: &SsrError) -> c_int {
    err.code() as c_int
}

/// Create a stopped, unconfigured accelerator
///
/// Returns null when the runtime cannot be created.
#[no_mangle]
pub extern "C" fn ssr_accelerator_new() -> *mut SsrAcceleratorHandle {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("ssr-accel")
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("[ACCEL] Failed to create runtime: {}", e);
            return std::ptr::null_mut();
        }
    };

    Box::into_raw(Box::new(SsrAcceleratorHandle {
        runtime,
        accelerator: Accelerator::new(),
    }))
}

/// Configure from a TOML document
///
/// # Safety
/// `handle` must come from `ssr_accelerator_new`; `toml` must be a valid
/// NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn ssr_accelerator_configure_toml(
    handle: *mut SsrAcceleratorHandle,
    toml: *const c_char,
) -> c_int {
    if handle.is_null() || toml.is_null() {
        return SSR_NULL_ARGUMENT;
    }
    let handle = &*handle;

    let contents = match CStr::from_ptr(toml).to_str() {
        Ok(contents) => contents,
        Err(_) => {
            return error_code(&SsrError::ConfigurationError("configuration is not UTF-8".into()))
        }
    };

    let configured =
        SessionConfig::from_toml(contents).and_then(|config| handle.accelerator.configure(config));
    match configured {
        Ok(()) => SSR_OK,
        Err(e) => {
            log::error!("[ACCEL] Configure failed: {}", e);
            error_code(&e)
        }
    }
}

/// Start the local SOCKS5 proxy
///
/// # Safety
/// `handle` must come from `ssr_accelerator_new`.
#[no_mangle]
pub unsafe extern "C" fn ssr_accelerator_start(handle: *mut SsrAcceleratorHandle) -> c_int {
    if handle.is_null() {
        return SSR_NULL_ARGUMENT;
    }
    let handle = &*handle;

    match handle.runtime.block_on(handle.accelerator.start()) {
        Ok(()) => SSR_OK,
        Err(e) => error_code(&e),
    }
}

/// Stop the proxy; a no-op when already stopped
///
/// # Safety
/// `handle` must come from `ssr_accelerator_new`.
#[no_mangle]
pub unsafe extern "C" fn ssr_accelerator_stop(handle: *mut SsrAcceleratorHandle) -> c_int {
    if handle.is_null() {
        return SSR_NULL_ARGUMENT;
    }
    let handle = &*handle;

    handle.runtime.block_on(handle.accelerator.stop());
    SSR_OK
}

/// Get connection status
/// Returns: 0=disconnected, 1=connecting, 2=connected, 3=disconnecting, -1=error
///
/// # Safety
/// `handle` must come from `ssr_accelerator_new`.
#[no_mangle]
pub unsafe extern "C" fn ssr_accelerator_status(handle: *const SsrAcceleratorHandle) -> c_int {
    if handle.is_null() {
        return SSR_NULL_ARGUMENT;
    }
    (*handle).accelerator.status().code() as c_int
}

/// Bound SOCKS5 port while running, 0 otherwise
///
/// # Safety
/// `handle` must come from `ssr_accelerator_new`.
#[no_mangle]
pub unsafe extern "C" fn ssr_accelerator_local_port(handle: *const SsrAcceleratorHandle) -> c_int {
    if handle.is_null() {
        return 0;
    }
    (*handle)
        .accelerator
        .local_addr()
        .map_or(0, |addr| addr.port() as c_int)
}

/// Copy the byte counters since the last start into the out-params
///
/// # Safety
/// `handle` must come from `ssr_accelerator_new`; out-params may be null.
#[no_mangle]
pub unsafe extern "C" fn ssr_accelerator_traffic(
    handle: *const SsrAcceleratorHandle,
    out_received: *mut u64,
    out_sent: *mut u64,
) -> c_int {
    if handle.is_null() {
        return SSR_NULL_ARGUMENT;
    }
    let snapshot = (*handle).accelerator.traffic();
    if !out_received.is_null() {
        *out_received = snapshot.received_bytes;
    }
    if !out_sent.is_null() {
        *out_sent = snapshot.sent_bytes;
    }
    SSR_OK
}

/// Stop the proxy and release the handle
///
/// # Safety
/// `handle` must come from `ssr_accelerator_new` and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn ssr_accelerator_free(handle: *mut SsrAcceleratorHandle) {
    if handle.is_null() {
        return;
    }
    let handle = Box::from_raw(handle);
    handle.runtime.block_on(handle.accelerator.stop());
    drop(handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    const CONFIG: &str = r#"
        server_address = "127.0.0.1"
        server_port = 9
        password = "secret"
        local_address = "127.0.0.1"
        local_port = 0
    "#;

    #[test]
    fn test_handle_lifecycle() {
        let handle = ssr_accelerator_new();
        assert!(!handle.is_null());

        unsafe {
            assert_eq!(ssr_accelerator_status(handle), 0);
            assert_eq!(
                ssr_accelerator_start(handle),
                SsrError::ConfigurationError(String::new()).code()
            );

            let toml = CString::new(CONFIG).unwrap();
            assert_eq!(ssr_accelerator_configure_toml(handle, toml.as_ptr()), SSR_OK);
            assert_eq!(ssr_accelerator_start(handle), SSR_OK);
            assert_eq!(ssr_accelerator_status(handle), 2);
            assert_ne!(ssr_accelerator_local_port(handle), 0);
            assert_eq!(ssr_accelerator_start(handle), SsrError::AlreadyRunning.code());

            let (mut received, mut sent) = (1u64, 1u64);
            assert_eq!(ssr_accelerator_traffic(handle, &mut received, &mut sent), SSR_OK);
            assert_eq!((received, sent), (0, 0));

            assert_eq!(ssr_accelerator_stop(handle), SSR_OK);
            assert_eq!(ssr_accelerator_stop(handle), SSR_OK);
            assert_eq!(ssr_accelerator_status(handle), 0);
            assert_eq!(ssr_accelerator_local_port(handle), 0);

            ssr_accelerator_free(handle);
        }
    }

    #[test]
    fn test_invalid_configuration() {
        let handle = ssr_accelerator_new();
        unsafe {
            let toml = CString::new("server_port = \"not a number\"").unwrap();
            assert_eq!(
                ssr_accelerator_configure_toml(handle, toml.as_ptr()),
                SsrError::ConfigurationError(String::new()).code()
            );
            assert_eq!(
                ssr_accelerator_configure_toml(handle, std::ptr::null()),
                SSR_NULL_ARGUMENT
            );
            ssr_accelerator_free(handle);
        }
    }

    #[test]
    fn test_null_handle() {
        unsafe {
            assert_eq!(ssr_accelerator_start(std::ptr::null_mut()), SSR_NULL_ARGUMENT);
            assert_eq!(ssr_accelerator_status(std::ptr::null()), SSR_NULL_ARGUMENT);
            assert_eq!(
                ssr_accelerator_traffic(
                    std::ptr::null(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut()
                ),
                SSR_NULL_ARGUMENT
            );
            ssr_accelerator_free(std::ptr::null_mut());
        }
    }
}
