//! Cipher engine: key derivation and streaming encrypt/decrypt
//!
//! Follows the Shadowsocks stream convention: each direction starts with the
//! sender's IV in clear, followed by the keystream-XORed payload.
//!
//! ```text
//! +-------+--------------------------------------+
//! |  IV   |  E(ATYP ADDR PORT) | E(payload) ...   |
//! +-------+--------------------------------------+
//! ```

pub mod aes_cfb;
pub mod chacha20;
pub mod kdf;
pub mod method;

pub use method::{CipherFamily, CipherMethod, MethodParams, DEFAULT_BUFFER_SIZE};

use crate::{Result, SsrError};
use aes_cfb::{AesCfbDecryptor, AesCfbEncryptor};
use chacha20::ChaCha20;

fn check_lengths(params: &MethodParams, key: &[u8], iv: &[u8]) -> Result<()> {
    if key.len() != params.key_len {
        return Err(SsrError::InvalidParameter(format!(
            "key must be {} bytes, got {}",
            params.key_len,
            key.len()
        )));
    }
    if iv.len() != params.iv_len {
        return Err(SsrError::InvalidParameter(format!(
            "iv must be {} bytes, got {}",
            params.iv_len,
            iv.len()
        )));
    }
    Ok(())
}

enum EncryptCore {
    Aes(AesCfbEncryptor),
    ChaCha(ChaCha20),
}

impl EncryptCore {
    fn new(params: &MethodParams, method: CipherMethod, key: &[u8], iv: &[u8]) -> Result<Self> {
        check_lengths(params, key, iv)?;
        match params.family {
            CipherFamily::AesCfb => Ok(Self::Aes(AesCfbEncryptor::new(key, iv)?)),
            CipherFamily::ChaCha20 | CipherFamily::ChaCha20Ietf => {
                Ok(Self::ChaCha(ChaCha20::new(key, iv, 0)?))
            }
            CipherFamily::Plain | CipherFamily::Unimplemented => {
                Err(SsrError::UnsupportedMethod(method.to_string()))
            }
        }
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            Self::Aes(c) => c.encrypt(data),
            Self::ChaCha(c) => c.apply_keystream(data),
        }
    }
}

enum DecryptCore {
    Aes(AesCfbDecryptor),
    ChaCha(ChaCha20),
}

impl DecryptCore {
    fn new(params: &MethodParams, method: CipherMethod, key: &[u8], iv: &[u8]) -> Result<Self> {
        check_lengths(params, key, iv)?;
        match params.family {
            CipherFamily::AesCfb => Ok(Self::Aes(AesCfbDecryptor::new(key, iv)?)),
            CipherFamily::ChaCha20 | CipherFamily::ChaCha20Ietf => {
                Ok(Self::ChaCha(ChaCha20::new(key, iv, 0)?))
            }
            CipherFamily::Plain | CipherFamily::Unimplemented => {
                Err(SsrError::UnsupportedMethod(method.to_string()))
            }
        }
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            Self::Aes(c) => c.decrypt(data),
            Self::ChaCha(c) => c.apply_keystream(data),
        }
    }
}

/// Outbound half: prefixes its IV to the first chunk
pub struct StreamEncryptor {
    params: MethodParams,
    key: Vec<u8>,
    iv: Vec<u8>,
    core: EncryptCore,
    iv_sent: bool,
}

impl StreamEncryptor {
    fn new(method: CipherMethod, key: Vec<u8>, iv: Vec<u8>) -> Result<Self> {
        let params = method.params();
        let core = EncryptCore::new(&params, method, &key, &iv)?;
        Ok(Self {
            params,
            key,
            iv,
            core,
            iv_sent: false,
        })
    }

    /// Encrypt one chunk; the first call also emits the IV
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        check_lengths(&self.params, &self.key, &self.iv)?;

        let prefix = if self.iv_sent { 0 } else { self.iv.len() };
        let mut out = Vec::with_capacity(prefix + plaintext.len());
        if !self.iv_sent {
            out.extend_from_slice(&self.iv);
            self.iv_sent = true;
        }
        out.extend_from_slice(plaintext);
        self.core.apply(&mut out[prefix..]);
        Ok(out)
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }
}

/// Inbound half: learns the peer IV from the first `iv_len` bytes
pub struct StreamDecryptor {
    method: CipherMethod,
    params: MethodParams,
    key: Vec<u8>,
    pending_iv: Vec<u8>,
    core: Option<DecryptCore>,
}

impl StreamDecryptor {
    fn new(method: CipherMethod, key: Vec<u8>) -> Result<Self> {
        let params = method.params();
        if !method.is_supported() {
            return Err(SsrError::UnsupportedMethod(method.to_string()));
        }
        Ok(Self {
            method,
            params,
            key,
            pending_iv: Vec::with_capacity(params.iv_len),
            core: None,
        })
    }

    /// Decrypt one chunk; returns nothing until the peer IV is complete
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut input = ciphertext;

        if self.core.is_none() {
            let need = self.params.iv_len - self.pending_iv.len();
            let take = need.min(input.len());
            self.pending_iv.extend_from_slice(&input[..take]);
            input = &input[take..];

            if self.pending_iv.len() < self.params.iv_len {
                return Ok(Vec::new());
            }
            self.core = Some(DecryptCore::new(
                &self.params,
                self.method,
                &self.key,
                &self.pending_iv,
            )?);
        }

        check_lengths(&self.params, &self.key, &self.pending_iv)?;
        let mut out = input.to_vec();
        if let Some(core) = self.core.as_mut() {
            core.apply(&mut out);
        }
        Ok(out)
    }

    /// Peer IV, once fully received
    pub fn remote_iv(&self) -> Option<&[u8]> {
        self.core.as_ref().map(|_| self.pending_iv.as_slice())
    }
}

/// Per-session cipher: derived key, fresh IV, one encryptor and one decryptor
pub struct CipherEngine {
    method: CipherMethod,
    key: Vec<u8>,
    encryptor: StreamEncryptor,
    decryptor: StreamDecryptor,
}

impl CipherEngine {
    /// Derive the key from `password` and draw a random IV
    pub fn new(method: CipherMethod, password: &str) -> Result<Self> {
        let iv = kdf::random_iv(method.iv_len());
        Self::with_iv(method, password, iv)
    }

    /// Build with an explicit IV
    pub fn with_iv(method: CipherMethod, password: &str, iv: Vec<u8>) -> Result<Self> {
        if !method.is_supported() {
            return Err(SsrError::UnsupportedMethod(method.to_string()));
        }
        let key = kdf::evp_bytes_to_key(password.as_bytes(), method.key_len())?;
        Self::with_key(method, key, iv)
    }

    /// Build from raw key material
    pub fn with_key(method: CipherMethod, key: Vec<u8>, iv: Vec<u8>) -> Result<Self> {
        let encryptor = StreamEncryptor::new(method, key.clone(), iv)?;
        let decryptor = StreamDecryptor::new(method, key.clone())?;
        Ok(Self {
            method,
            key,
            encryptor,
            decryptor,
        })
    }

    pub fn method(&self) -> CipherMethod {
        self.method
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn iv(&self) -> &[u8] {
        self.encryptor.iv()
    }

    /// Per-read buffer size suggested by the method
    pub fn recommended_buffer_size(&self) -> usize {
        self.method.params().buffer_size
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.encryptor.encrypt(plaintext)
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.decryptor.decrypt(ciphertext)
    }

    /// Hand each relay direction its own half
    pub fn split(self) -> (StreamEncryptor, StreamDecryptor) {
        (self.encryptor, self.decryptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    const SUPPORTED: [CipherMethod; 5] = [
        CipherMethod::Aes128Cfb,
        CipherMethod::Aes192Cfb,
        CipherMethod::Aes256Cfb,
        CipherMethod::ChaCha20,
        CipherMethod::ChaCha20Ietf,
    ];

    fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen()).collect()
    }

    #[test]
    fn test_round_trip_all_methods_and_lengths() {
        for method in SUPPORTED {
            for len in [0usize, 1, 16, 1023, 65536] {
                let mut engine = CipherEngine::new(method, "round-trip").unwrap();
                let plaintext = pseudo_random(len, len as u64);

                let ciphertext = engine.encrypt(&plaintext).unwrap();
                assert_eq!(ciphertext.len(), method.iv_len() + len);

                let decrypted = engine.decrypt(&ciphertext).unwrap();
                assert_eq!(decrypted, plaintext, "{} len {}", method, len);
            }
        }
    }

    #[test]
    fn test_aes_256_cfb_ten_thousand_bytes() {
        let mut engine = CipherEngine::new(CipherMethod::Aes256Cfb, "scenario-c").unwrap();
        let plaintext = pseudo_random(10_000, 42);
        let ciphertext = engine.encrypt(&plaintext).unwrap();
        assert_ne!(&ciphertext[16..], &plaintext[..]);
        assert_eq!(engine.decrypt(&ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn test_iv_only_sent_once() {
        let mut engine = CipherEngine::new(CipherMethod::ChaCha20Ietf, "pw").unwrap();
        let first = engine.encrypt(b"hello").unwrap();
        let second = engine.encrypt(b"world").unwrap();
        assert_eq!(first.len(), 12 + 5);
        assert_eq!(&first[..12], engine.iv());
        assert_eq!(second.len(), 5);
    }

    #[test]
    fn test_split_halves_interoperate() {
        let mut local = CipherEngine::new(CipherMethod::Aes128Cfb, "pw").unwrap();
        let remote = CipherEngine::new(CipherMethod::Aes128Cfb, "pw").unwrap();
        let (mut remote_enc, mut remote_dec) = remote.split();

        let upstream = local.encrypt(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(remote_dec.decrypt(&upstream).unwrap(), b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(remote_dec.remote_iv(), Some(local.iv()));

        let downstream = remote_enc.encrypt(b"HTTP/1.1 200 OK").unwrap();
        assert_eq!(local.decrypt(&downstream).unwrap(), b"HTTP/1.1 200 OK");
    }

    #[test]
    fn test_decrypt_buffers_partial_iv() {
        let mut sender = CipherEngine::new(CipherMethod::Aes256Cfb, "pw").unwrap();
        let mut receiver = CipherEngine::new(CipherMethod::Aes256Cfb, "pw").unwrap();
        let wire = sender.encrypt(b"partial iv delivery").unwrap();

        let mut out = Vec::new();
        for chunk in wire.chunks(5) {
            out.extend(receiver.decrypt(chunk).unwrap());
        }
        assert_eq!(out, b"partial iv delivery");
    }

    #[test]
    fn test_wrong_password_garbles() {
        let mut a = CipherEngine::new(CipherMethod::ChaCha20, "right").unwrap();
        let mut b = CipherEngine::new(CipherMethod::ChaCha20, "wrong").unwrap();
        let wire = a.encrypt(b"attack at dawn").unwrap();
        assert_ne!(b.decrypt(&wire).unwrap(), b"attack at dawn");
    }

    #[test]
    fn test_unsupported_methods() {
        for method in [CipherMethod::None, CipherMethod::Table, CipherMethod::Salsa20] {
            assert!(matches!(
                CipherEngine::new(method, "pw"),
                Err(SsrError::UnsupportedMethod(_))
            ));
        }
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(matches!(
            CipherEngine::new(CipherMethod::Aes256Cfb, ""),
            Err(SsrError::InvalidParameter(_))
        ));
        assert!(matches!(
            CipherEngine::with_key(CipherMethod::Aes256Cfb, vec![0u8; 16], vec![0u8; 16]),
            Err(SsrError::InvalidParameter(_))
        ));
        assert!(matches!(
            CipherEngine::with_iv(CipherMethod::ChaCha20, "pw", vec![0u8; 4]),
            Err(SsrError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_key_derivation_deterministic_per_method() {
        let a = CipherEngine::new(CipherMethod::Aes192Cfb, "pw").unwrap();
        let b = CipherEngine::new(CipherMethod::Aes192Cfb, "pw").unwrap();
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().len(), 24);
        assert_ne!(a.iv(), b.iv());
    }
}
