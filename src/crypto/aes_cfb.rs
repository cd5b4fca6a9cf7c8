//! AES in 128-bit cipher feedback mode
//!
//! Buffered CFB keeps partial-block state between calls, so chunk boundaries
//! chosen by the socket never affect the ciphertext and no padding is added.

use crate::{Result, SsrError};
use aes::{Aes128, Aes192, Aes256};
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};

pub const IV_LEN: usize = 16;

fn invalid_length(key: &[u8], iv: &[u8]) -> SsrError {
    SsrError::InvalidParameter(format!(
        "aes-cfb needs a 16/24/32 byte key and 16 byte iv, got {}/{}",
        key.len(),
        iv.len()
    ))
}

pub enum AesCfbEncryptor {
    Aes128(BufEncryptor<Aes128>),
    Aes192(BufEncryptor<Aes192>),
    Aes256(BufEncryptor<Aes256>),
}

impl AesCfbEncryptor {
    /// The key length selects the AES variant
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self> {
        if iv.len() != IV_LEN {
            return Err(invalid_length(key, iv));
        }
        let cipher = match key.len() {
            16 => BufEncryptor::<Aes128>::new_from_slices(key, iv).map(Self::Aes128),
            24 => BufEncryptor::<Aes192>::new_from_slices(key, iv).map(Self::Aes192),
            32 => BufEncryptor::<Aes256>::new_from_slices(key, iv).map(Self::Aes256),
            _ => return Err(invalid_length(key, iv)),
        };
        cipher.map_err(|_| invalid_length(key, iv))
    }

    pub fn encrypt(&mut self, data: &mut [u8]) {
        match self {
            Self::Aes128(c) => c.encrypt(data),
            Self::Aes192(c) => c.encrypt(data),
            Self::Aes256(c) => c.encrypt(data),
        }
    }
}

pub enum AesCfbDecryptor {
    Aes128(BufDecryptor<Aes128>),
    Aes192(BufDecryptor<Aes192>),
    Aes256(BufDecryptor<Aes256>),
}

impl AesCfbDecryptor {
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self> {
        if iv.len() != IV_LEN {
            return Err(invalid_length(key, iv));
        }
        let cipher = match key.len() {
            16 => BufDecryptor::<Aes128>::new_from_slices(key, iv).map(Self::Aes128),
            24 => BufDecryptor::<Aes192>::new_from_slices(key, iv).map(Self::Aes192),
            32 => BufDecryptor::<Aes256>::new_from_slices(key, iv).map(Self::Aes256),
            _ => return Err(invalid_length(key, iv)),
        };
        cipher.map_err(|_| invalid_length(key, iv))
    }

    pub fn decrypt(&mut self, data: &mut [u8]) {
        match self {
            Self::Aes128(c) => c.decrypt(data),
            Self::Aes192(c) => c.decrypt(data),
            Self::Aes256(c) => c.decrypt(data),
        }
    }
}
