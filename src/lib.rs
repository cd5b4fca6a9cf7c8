//! SSR Accelerator: embedded SOCKS5-to-SSR local proxy
//!
//! The accelerator accepts SOCKS5 CONNECT requests from local applications and
//! forwards each stream to a remote SSR relay, encrypted with a Shadowsocks
//! stream cipher and disguised by one of the SSR obfuscation modes.
//!
//! ## Features
//!
//! - **SOCKS5 front door**: no-auth greeting and CONNECT requests (IPv4, domain, IPv6)
//! - **Stream ciphers**: AES-128/192/256-CFB, ChaCha20 and ChaCha20-IETF
//! - **Obfuscation**: plain, http_simple, http_post and tls1.2_ticket_auth framing
//! - **Connection pool**: bounded per-endpoint reuse of upstream connections
//! - **Traffic accounting**: lock-free counters with periodic delta callbacks
//! - **Mobile-friendly**: C ABI over an explicit accelerator handle
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ssr_accelerator::{Accelerator, CipherMethod, ObfsMode, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ssr_accelerator::SsrError> {
//!     let config = SessionConfig::new("relay.example.com", 8388, "secret")
//!         .with_method(CipherMethod::Aes256Cfb)
//!         .with_obfs(ObfsMode::HttpSimple, Some("cdn.example.com".to_string()));
//!
//!     let accelerator = Accelerator::new();
//!     accelerator.configure(config)?;
//!     accelerator.start().await?;
//!
//!     // ... point applications at socks5://127.0.0.1:1080 ...
//!
//!     accelerator.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ SOCKS5 ┌──────────────────────────────────────┐  SSR  ┌──────────┐
//! │ Application │───────▶│ front door → header → cipher → obfs  │──────▶│  Relay   │
//! └─────────────┘        │          pooled upstream             │       └──────────┘
//!                        └──────────────────────────────────────┘
//! ```

pub mod accelerator;
pub mod config;
pub mod crypto;
pub mod header;
pub mod json_logger;
pub mod mobile;
pub mod obfs;
pub mod pool;
pub mod relay;
pub mod socks5;
pub mod stats;

pub use accelerator::{Accelerator, AcceleratorDelegate, AcceleratorStatus};
pub use config::SessionConfig;
pub use crypto::{CipherEngine, CipherMethod, StreamDecryptor, StreamEncryptor};
pub use header::{decode_header, encode_header};
pub use obfs::{ObfsContext, ObfsMode, Obfuscator};
pub use pool::{Connection, ConnectionPool, ConnectionState, DialError, Endpoint};
pub use relay::LocalServer;
pub use socks5::{AddressType, ReplyCode, TargetAddress};
pub use stats::{TrafficSnapshot, TrafficStats};

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, SsrError>;

/// SSR accelerator error types
///
/// This is a closed set: every failure in the core maps onto one of these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SsrError {
    /// Malformed or wrong-version SOCKS5 message
    #[error("Invalid SOCKS5 protocol data")]
    InvalidProtocol,

    /// SOCKS5 command other than CONNECT
    #[error("Unsupported SOCKS5 command")]
    UnsupportedCommand,

    /// Unknown ATYP value
    #[error("Invalid address type")]
    InvalidAddressType,

    /// Truncated or undecodable destination address
    #[error("Invalid address")]
    InvalidAddress,

    /// Missing or truncated destination port
    #[error("Invalid port")]
    InvalidPort,

    /// Bad key, IV, password or other argument
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Cryptographic, framing or network primitive failed
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// Cipher method not supported by this build
    #[error("Unsupported cipher method: {0}")]
    UnsupportedMethod(String),

    /// Upstream connect or handshake exceeded its deadline
    #[error("Operation timed out")]
    OperationTimeout,

    /// Lifecycle call not allowed while the accelerator is running
    #[error("Accelerator is already running")]
    AlreadyRunning,

    /// Missing or invalid configuration
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl From<std::io::Error> for SsrError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => SsrError::OperationTimeout,
            _ => SsrError::OperationFailed(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for SsrError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        SsrError::OperationTimeout
    }
}

impl SsrError {
    /// Protocol-level errors only affect the offending client leg
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SsrError::InvalidProtocol
                | SsrError::UnsupportedCommand
                | SsrError::InvalidAddressType
                | SsrError::InvalidAddress
                | SsrError::InvalidPort
        )
    }

    /// Stable numeric code, used by the C ABI
    pub fn code(&self) -> i32 {
        match self {
            SsrError::InvalidProtocol => -1,
            SsrError::UnsupportedCommand => -2,
            SsrError::InvalidAddressType => -3,
            SsrError::InvalidAddress => -4,
            SsrError::InvalidPort => -5,
            SsrError::InvalidParameter(_) => -6,
            SsrError::OperationFailed(_) => -7,
            SsrError::UnsupportedMethod(_) => -8,
            SsrError::OperationTimeout => -9,
            SsrError::AlreadyRunning => -10,
            SsrError::ConfigurationError(_) => -11,
        }
    }
}
