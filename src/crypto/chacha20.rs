//! ChaCha20 keystream generator
//!
//! State layout (16 little-endian words):
//!
//! ```text
//! cccccccc  cccccccc  cccccccc  cccccccc     c = "expand 32-byte k"
//! kkkkkkkk  kkkkkkkk  kkkkkkkk  kkkkkkkk     k = key
//! kkkkkkkk  kkkkkkkk  kkkkkkkk  kkkkkkkk
//! bbbbbbbb  nnnnnnnn  nnnnnnnn  nnnnnnnn     b = block counter, n = nonce (IETF)
//! bbbbbbbb  bbbbbbbb  nnnnnnnn  nnnnnnnn     64-bit counter, 8-byte nonce (classic)
//! ```

use crate::{Result, SsrError};

const CONSTANTS: [u32; 4] = [0x6170_7865, 0x3320_646e, 0x7962_2d32, 0x6b20_6574];

pub const KEY_LEN: usize = 32;
pub const BLOCK_LEN: usize = 64;
pub const NONCE_LEN: usize = 8;
pub const IETF_NONCE_LEN: usize = 12;

#[inline(always)]
fn quarter_round(s: &mut [u32; 16], a: usize, b: usize, c: usize, d: usize) {
    s[a] = s[a].wrapping_add(s[b]);
    s[d] = (s[d] ^ s[a]).rotate_left(16);
    s[c] = s[c].wrapping_add(s[d]);
    s[b] = (s[b] ^ s[c]).rotate_left(12);
    s[a] = s[a].wrapping_add(s[b]);
    s[d] = (s[d] ^ s[a]).rotate_left(8);
    s[c] = s[c].wrapping_add(s[d]);
    s[b] = (s[b] ^ s[c]).rotate_left(7);
}

/// Run the 20-round block function over `input` and serialize it
pub fn block(input: &[u32; 16]) -> [u8; BLOCK_LEN] {
    let mut working = *input;
    for _ in 0..10 {
        // columns
        quarter_round(&mut working, 0, 4, 8, 12);
        quarter_round(&mut working, 1, 5, 9, 13);
        quarter_round(&mut working, 2, 6, 10, 14);
        quarter_round(&mut working, 3, 7, 11, 15);
        // diagonals
        quarter_round(&mut working, 0, 5, 10, 15);
        quarter_round(&mut working, 1, 6, 11, 12);
        quarter_round(&mut working, 2, 7, 8, 13);
        quarter_round(&mut working, 3, 4, 9, 14);
    }

    let mut out = [0u8; BLOCK_LEN];
    for (i, chunk) in out.chunks_exact_mut(4).enumerate() {
        chunk.copy_from_slice(&working[i].wrapping_add(input[i]).to_le_bytes());
    }
    out
}

/// Streaming ChaCha20 cipher; keystream carries over between calls
pub struct ChaCha20 {
    state: [u32; 16],
    ietf: bool,
    keystream: [u8; BLOCK_LEN],
    /// Next unused byte of `keystream`; `BLOCK_LEN` means exhausted
    offset: usize,
}

impl ChaCha20 {
    /// Create a cipher; an 8-byte nonce selects the classic variant, 12 bytes IETF
    pub fn new(key: &[u8], nonce: &[u8], counter: u32) -> Result<Self> {
        if key.len() < KEY_LEN {
            return Err(SsrError::InvalidParameter(format!(
                "chacha20 key must be {} bytes, got {}",
                KEY_LEN,
                key.len()
            )));
        }
        let ietf = match nonce.len() {
            NONCE_LEN => false,
            IETF_NONCE_LEN => true,
            n => {
                return Err(SsrError::InvalidParameter(format!(
                    "chacha20 nonce must be 8 or 12 bytes, got {}",
                    n
                )))
            }
        };

        let mut state = [0u32; 16];
        state[..4].copy_from_slice(&CONSTANTS);
        for (i, chunk) in key[..KEY_LEN].chunks_exact(4).enumerate() {
            state[4 + i] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        state[12] = counter;

        let nonce_start = if ietf { 13 } else { 14 };
        for (i, chunk) in nonce.chunks_exact(4).enumerate() {
            state[nonce_start + i] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }

        Ok(Self {
            state,
            ietf,
            keystream: [0u8; BLOCK_LEN],
            offset: BLOCK_LEN,
        })
    }

    /// Counter of the next block to be generated
    pub fn counter(&self) -> u64 {
        if self.ietf {
            self.state[12] as u64
        } else {
            (self.state[13] as u64) << 32 | self.state[12] as u64
        }
    }

    fn refill(&mut self) {
        self.keystream = block(&self.state);
        self.offset = 0;
        let (low, carry) = self.state[12].overflowing_add(1);
        self.state[12] = low;
        if carry && !self.ietf {
            self.state[13] = self.state[13].wrapping_add(1);
        }
    }

    /// XOR the keystream into `data` in place
    pub fn apply_keystream(&mut self, data: &mut [u8]) {
        let mut pos = 0;
        while pos < data.len() {
            if self.offset == BLOCK_LEN {
                self.refill();
            }
            let take = (BLOCK_LEN - self.offset).min(data.len() - pos);
            for (byte, k) in data[pos..pos + take]
                .iter_mut()
                .zip(&self.keystream[self.offset..self.offset + take])
            {
                *byte ^= k;
            }
            self.offset += take;
            pos += take;
        }
    }
}
