//! Password-based key derivation and IV generation

use crate::{Result, SsrError};
use md5::{Digest, Md5};
use rand::RngCore;

/// Derive a cipher key from a password (OpenSSL `EVP_BytesToKey`, MD5, one round)
///
/// Each MD5 digest is fed back as the prefix of the next one until at least
/// `key_len` bytes exist; the output is then truncated.
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Result<Vec<u8>> {
    if password.is_empty() {
        return Err(SsrError::InvalidParameter("password must not be empty".into()));
    }

    let mut key = Vec::with_capacity(key_len + 16);
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password);
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }
    key.truncate(key_len);
    Ok(key)
}

/// Fresh random IV from the OS-seeded thread RNG
pub fn random_iv(iv_len: usize) -> Vec<u8> {
    let mut iv = vec![0u8; iv_len];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}
