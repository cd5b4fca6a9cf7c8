//! Session configuration

use crate::crypto::CipherMethod;
use crate::obfs::ObfsMode;
use crate::{Result, SsrError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod defaults {
    use std::time::Duration;

    pub fn local_address() -> String {
        "127.0.0.1".to_string()
    }

    pub fn local_port() -> u16 {
        1080
    }

    pub fn connect_timeout() -> Duration {
        Duration::from_secs(8)
    }

    pub fn traffic_interval() -> Duration {
        Duration::from_secs(1)
    }

    pub fn pool_idle_capacity() -> usize {
        4
    }

    pub fn pool_idle_timeout() -> Duration {
        Duration::from_secs(60)
    }
}

/// Immutable parameters of one accelerator run
///
/// Replacing a configuration requires stopping the accelerator first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Remote SSR relay host
    pub server_address: String,

    /// Remote SSR relay port
    pub server_port: u16,

    /// Local SOCKS5 listen address
    #[serde(default = "defaults::local_address")]
    pub local_address: String,

    /// Local SOCKS5 listen port (0 picks a free port)
    #[serde(default = "defaults::local_port")]
    pub local_port: u16,

    /// Shared secret the cipher key is derived from
    pub password: String,

    /// Stream cipher
    #[serde(default)]
    pub method: CipherMethod,

    /// Obfuscation mode
    #[serde(default)]
    pub obfs: ObfsMode,

    /// Mode parameter, e.g. comma-separated fake hosts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obfs_param: Option<String>,

    /// Free-form label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remarks: Option<String>,

    /// Upstream connect deadline
    #[serde(default = "defaults::connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Per-read buffer override; the cipher's recommendation otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<usize>,

    /// How often traffic deltas are reported
    #[serde(default = "defaults::traffic_interval", with = "humantime_serde")]
    pub traffic_interval: Duration,

    /// Idle upstream connections kept per endpoint
    #[serde(default = "defaults::pool_idle_capacity")]
    pub pool_idle_capacity: usize,

    /// Idle upstream connections older than this are dropped
    #[serde(default = "defaults::pool_idle_timeout", with = "humantime_serde")]
    pub pool_idle_timeout: Duration,
}

impl SessionConfig {
    pub fn new(
        server_address: impl Into<String>,
        server_port: u16,
        password: impl Into<String>,
    ) -> Self {
        Self {
            server_address: server_address.into(),
            server_port,
            local_address: defaults::local_address(),
            local_port: defaults::local_port(),
            password: password.into(),
            method: CipherMethod::default(),
            obfs: ObfsMode::default(),
            obfs_param: None,
            remarks: None,
            connect_timeout: defaults::connect_timeout(),
            buffer_size: None,
            traffic_interval: defaults::traffic_interval(),
            pool_idle_capacity: defaults::pool_idle_capacity(),
            pool_idle_timeout: defaults::pool_idle_timeout(),
        }
    }

    pub fn with_method(mut self, method: CipherMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_obfs(mut self, obfs: ObfsMode, param: Option<String>) -> Self {
        self.obfs = obfs;
        self.obfs_param = param;
        self
    }

    pub fn with_local(mut self, address: impl Into<String>, port: u16) -> Self {
        self.local_address = address.into();
        self.local_port = port;
        self
    }

    pub fn with_remarks(mut self, remarks: impl Into<String>) -> Self {
        self.remarks = Some(remarks.into());
        self
    }

    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SsrError::ConfigurationError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| SsrError::ConfigurationError(e.to_string()))
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| SsrError::ConfigurationError(e.to_string()))?;
        std::fs::write(path, contents)
            .map_err(|e| SsrError::ConfigurationError(format!("{}: {}", path.display(), e)))
    }

    /// Check the configuration can start a session
    pub fn validate(&self) -> Result<()> {
        if self.server_address.trim().is_empty() {
            return Err(SsrError::ConfigurationError("server address must be set".into()));
        }
        if self.server_port == 0 {
            return Err(SsrError::ConfigurationError("server port must be non-zero".into()));
        }
        if self.password.is_empty() {
            return Err(SsrError::ConfigurationError("password must be set".into()));
        }
        if !self.method.is_supported() {
            return Err(SsrError::ConfigurationError(format!(
                "cipher method {} is not supported",
                self.method
            )));
        }
        if self.buffer_size == Some(0) {
            return Err(SsrError::ConfigurationError("buffer size must be non-zero".into()));
        }
        if self.traffic_interval.is_zero() {
            return Err(SsrError::ConfigurationError("traffic interval must be non-zero".into()));
        }
        Ok(())
    }

    /// Read buffer: explicit override, else the cipher's recommendation
    pub fn read_buffer_size(&self) -> usize {
        self.buffer_size.unwrap_or_else(|| self.method.params().buffer_size)
    }
}
