//! Cipher method identifiers and their parameter table

use crate::SsrError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default per-read buffer when a method does not recommend one
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Cipher family, decides which primitive runs the keystream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherFamily {
    /// No encryption / substitution table (not supported as a session cipher)
    Plain,
    /// AES block cipher in 128-bit CFB
    AesCfb,
    /// ChaCha20 with a 64-bit nonce
    ChaCha20,
    /// ChaCha20 with a 96-bit nonce (RFC 8439)
    ChaCha20Ietf,
    /// Recognised SSR identifier without an implementation in this crate
    Unimplemented,
}

/// SSR stream cipher methods
///
/// Every identifier an SSR configuration may carry parses into a variant;
/// only the AES-CFB and ChaCha20 families can build a [`CipherEngine`].
///
/// [`CipherEngine`]: super::CipherEngine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CipherMethod {
    None,
    Table,
    Rc4Md5,
    Aes128Cfb,
    Aes192Cfb,
    Aes256Cfb,
    Aes128Ctr,
    Aes192Ctr,
    Aes256Ctr,
    Camellia128Cfb,
    Camellia192Cfb,
    Camellia256Cfb,
    BfCfb,
    Cast5Cfb,
    DesCfb,
    Rc2Cfb,
    SeedCfb,
    Salsa20,
    ChaCha20,
    ChaCha20Ietf,
}

/// Parameters resolved once per method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodParams {
    pub key_len: usize,
    pub iv_len: usize,
    pub buffer_size: usize,
    pub family: CipherFamily,
}

impl CipherMethod {
    /// All identifiers, in the order SSR clients list them
    pub const ALL: [CipherMethod; 20] = [
        CipherMethod::None,
        CipherMethod::Table,
        CipherMethod::Rc4Md5,
        CipherMethod::Aes128Cfb,
        CipherMethod::Aes192Cfb,
        CipherMethod::Aes256Cfb,
        CipherMethod::Aes128Ctr,
        CipherMethod::Aes192Ctr,
        CipherMethod::Aes256Ctr,
        CipherMethod::Camellia128Cfb,
        CipherMethod::Camellia192Cfb,
        CipherMethod::Camellia256Cfb,
        CipherMethod::BfCfb,
        CipherMethod::Cast5Cfb,
        CipherMethod::DesCfb,
        CipherMethod::Rc2Cfb,
        CipherMethod::SeedCfb,
        CipherMethod::Salsa20,
        CipherMethod::ChaCha20,
        CipherMethod::ChaCha20Ietf,
    ];

    /// SSR identifier string
    pub fn as_str(&self) -> &'static str {
        match self {
            CipherMethod::None => "none",
            CipherMethod::Table => "table",
            CipherMethod::Rc4Md5 => "rc4-md5",
            CipherMethod::Aes128Cfb => "aes-128-cfb",
            CipherMethod::Aes192Cfb => "aes-192-cfb",
            CipherMethod::Aes256Cfb => "aes-256-cfb",
            CipherMethod::Aes128Ctr => "aes-128-ctr",
            CipherMethod::Aes192Ctr => "aes-192-ctr",
            CipherMethod::Aes256Ctr => "aes-256-ctr",
            CipherMethod::Camellia128Cfb => "camellia-128-cfb",
            CipherMethod::Camellia192Cfb => "camellia-192-cfb",
            CipherMethod::Camellia256Cfb => "camellia-256-cfb",
            CipherMethod::BfCfb => "bf-cfb",
            CipherMethod::Cast5Cfb => "cast5-cfb",
            CipherMethod::DesCfb => "des-cfb",
            CipherMethod::Rc2Cfb => "rc2-cfb",
            CipherMethod::SeedCfb => "seed-cfb",
            CipherMethod::Salsa20 => "salsa20",
            CipherMethod::ChaCha20 => "chacha20",
            CipherMethod::ChaCha20Ietf => "chacha20-ietf",
        }
    }

    /// Key length, IV length, recommended buffer and family
    pub fn params(&self) -> MethodParams {
        use CipherFamily::*;
        let (key_len, iv_len, family) = match self {
            CipherMethod::None | CipherMethod::Table => (0, 0, Plain),
            CipherMethod::Rc4Md5 => (16, 16, Unimplemented),
            CipherMethod::Aes128Cfb => (16, 16, AesCfb),
            CipherMethod::Aes192Cfb => (24, 16, AesCfb),
            CipherMethod::Aes256Cfb => (32, 16, AesCfb),
            CipherMethod::Aes128Ctr => (16, 16, Unimplemented),
            CipherMethod::Aes192Ctr => (24, 16, Unimplemented),
            CipherMethod::Aes256Ctr => (32, 16, Unimplemented),
            CipherMethod::Camellia128Cfb => (16, 16, Unimplemented),
            CipherMethod::Camellia192Cfb => (24, 16, Unimplemented),
            CipherMethod::Camellia256Cfb => (32, 16, Unimplemented),
            CipherMethod::BfCfb => (16, 8, Unimplemented),
            CipherMethod::Cast5Cfb => (16, 8, Unimplemented),
            CipherMethod::DesCfb => (8, 8, Unimplemented),
            CipherMethod::Rc2Cfb => (16, 8, Unimplemented),
            CipherMethod::SeedCfb => (16, 16, Unimplemented),
            CipherMethod::Salsa20 => (32, 8, Unimplemented),
            CipherMethod::ChaCha20 => (32, 8, ChaCha20),
            CipherMethod::ChaCha20Ietf => (32, 12, ChaCha20Ietf),
        };

        // Stream ciphers work on whole 64-byte blocks, keep reads block aligned
        let buffer_size = match family {
            ChaCha20 | ChaCha20Ietf => 32 * 1024,
            _ => DEFAULT_BUFFER_SIZE,
        };

        MethodParams {
            key_len,
            iv_len,
            buffer_size,
            family,
        }
    }

    pub fn key_len(&self) -> usize {
        self.params().key_len
    }

    pub fn iv_len(&self) -> usize {
        self.params().iv_len
    }

    /// Whether this build can encrypt with the method
    pub fn is_supported(&self) -> bool {
        matches!(
            self.params().family,
            CipherFamily::AesCfb | CipherFamily::ChaCha20 | CipherFamily::ChaCha20Ietf
        )
    }
}

impl Default for CipherMethod {
    fn default() -> Self {
        CipherMethod::Aes256Cfb
    }
}

impl fmt::Display for CipherMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CipherMethod {
    type Err = SsrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        CipherMethod::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == wanted)
            .ok_or(SsrError::UnsupportedMethod(s.to_string()))
    }
}

impl TryFrom<String> for CipherMethod {
    type Error = SsrError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CipherMethod> for String {
    fn from(method: CipherMethod) -> Self {
        method.as_str().to_string()
    }
}
