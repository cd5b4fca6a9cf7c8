//! Obfuscation boundary
//!
//! An [`Obfuscator`] sits between the cipher and the socket and disguises the
//! ciphertext stream as something else on the wire. One instance is built per
//! session from an [`ObfsContext`]; it keeps whatever handshake state the mode
//! needs in both directions.

pub mod http;
pub mod tls;

use crate::{Result, SsrError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Byte-level disguise applied on top of ciphertext
pub trait Obfuscator: Send {
    /// Wrap ciphertext headed for the relay
    fn obfuscate(&mut self, data: &[u8]) -> Result<Vec<u8>>;

    /// Unwrap bytes received from the relay; may return nothing while
    /// handshake framing is still incomplete
    fn deobfuscate(&mut self, data: &[u8]) -> Result<Vec<u8>>;

    fn mode(&self) -> ObfsMode;
}

/// SSR obfuscation modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ObfsMode {
    #[default]
    Plain,
    HttpSimple,
    HttpPost,
    TlsTicketAuth,
}

impl ObfsMode {
    pub const ALL: [ObfsMode; 4] = [
        ObfsMode::Plain,
        ObfsMode::HttpSimple,
        ObfsMode::HttpPost,
        ObfsMode::TlsTicketAuth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObfsMode::Plain => "plain",
            ObfsMode::HttpSimple => "http_simple",
            ObfsMode::HttpPost => "http_post",
            ObfsMode::TlsTicketAuth => "tls1.2_ticket_auth",
        }
    }

    /// Build a fresh per-session obfuscator
    pub fn build(&self, ctx: ObfsContext) -> Box<dyn Obfuscator> {
        match self {
            ObfsMode::Plain => Box::new(Plain),
            ObfsMode::HttpSimple => Box::new(http::HttpObfs::new(ctx, http::HttpMethod::Get)),
            ObfsMode::HttpPost => Box::new(http::HttpObfs::new(ctx, http::HttpMethod::Post)),
            ObfsMode::TlsTicketAuth => Box::new(tls::TlsTicketAuth::new(ctx)),
        }
    }
}

impl fmt::Display for ObfsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObfsMode {
    type Err = SsrError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        // SSR clients append "_compatible" for modes that fall back to plain server side
        let wanted = wanted.strip_suffix("_compatible").unwrap_or(&wanted);
        match wanted {
            "" | "plain" => Ok(ObfsMode::Plain),
            "http_simple" => Ok(ObfsMode::HttpSimple),
            "http_post" => Ok(ObfsMode::HttpPost),
            "tls1.2_ticket_auth" | "tls1.2_ticket_fastauth" => Ok(ObfsMode::TlsTicketAuth),
            _ => Err(SsrError::ConfigurationError(format!(
                "unknown obfs mode: {}",
                s
            ))),
        }
    }
}

impl TryFrom<String> for ObfsMode {
    type Error = SsrError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ObfsMode> for String {
    fn from(mode: ObfsMode) -> Self {
        mode.as_str().to_string()
    }
}

/// Per-session inputs every mode may draw on
#[derive(Debug, Clone, Default)]
pub struct ObfsContext {
    /// Relay host as configured
    pub host: String,
    pub port: u16,
    /// Mode parameter (`obfs_param`)
    pub param: Option<String>,
    /// Derived cipher key, used for authentication tags
    pub key: Vec<u8>,
    pub iv_len: usize,
    /// Length of the SSR destination header
    pub head_len: usize,
}

impl ObfsContext {
    /// Host list from `obfs_param` (before any `#`), else the relay host
    pub(crate) fn hosts(&self) -> Vec<String> {
        let param = self
            .param
            .as_deref()
            .map(|p| p.split('#').next().unwrap_or_default().trim())
            .filter(|p| !p.is_empty());

        match param {
            Some(list) => list
                .split(',')
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .collect(),
            None => vec![self.host.clone()],
        }
    }

    /// Custom header block after `#` in `obfs_param`, with `\n` expanded to CRLF
    pub(crate) fn custom_headers(&self) -> Option<String> {
        let param = self.param.as_deref()?;
        let (_, body) = param.split_once('#')?;
        let body = body.replace("\\n", "\n").replace("\r\n", "\n").replace('\n', "\r\n");
        (!body.is_empty()).then_some(body)
    }
}

/// Identity mode
pub struct Plain;

impl Obfuscator for Plain {
    fn obfuscate(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn deobfuscate(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn mode(&self) -> ObfsMode {
        ObfsMode::Plain
    }
}
