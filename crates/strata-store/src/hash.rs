//! Block hash encoding.
//!
//! Blocks are named by the lowercase hex encoding of the BLAKE3 digest of
//! their raw chunk bytes, so every encoded hash has the same length and is
//! safe to use as a file name.

use crossbeam::queue::ArrayQueue;

/// Length of an encoded block hash (hex of a 256-bit digest)
pub const ENCODED_HASH_LEN: usize = blake3::OUT_LEN * 2;

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Hasher with a built-in encode buffer.
///
/// Reusing one encoder across chunks avoids re-initialising the hasher state
/// and the scratch buffer for every block.
pub struct HashEncoder {
    hasher: blake3::Hasher,
    ebuf: [u8; ENCODED_HASH_LEN],
}

impl HashEncoder {
    pub fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
            ebuf: [0u8; ENCODED_HASH_LEN],
        }
    }

    /// Hash `data` and return its encoded sum.
    pub fn encode_sum(&mut self, data: &[u8]) -> String {
        self.hasher.reset();
        self.hasher.update(data);
        let digest = self.hasher.finalize();

        for (pair, byte) in self.ebuf.chunks_exact_mut(2).zip(digest.as_bytes()) {
            pair[0] = HEX_DIGITS[usize::from(byte >> 4)];
            pair[1] = HEX_DIGITS[usize::from(byte & 0x0f)];
        }
        self.ebuf.iter().map(|&b| char::from(b)).collect()
    }
}

impl Default for HashEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Free list of [`HashEncoder`]s owned by one store instance.
pub struct HashEncoderPool {
    free: ArrayQueue<HashEncoder>,
}

impl HashEncoderPool {
    /// Create a pool retaining at most `capacity` idle encoders.
    pub fn new(capacity: usize) -> Self {
        Self {
            free: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Check out an encoder, creating one if the pool is empty.
    pub fn acquire(&self) -> HashEncoder {
        self.free.pop().unwrap_or_default()
    }

    /// Return an encoder. Dropped if the pool is already full.
    pub fn release(&self, encoder: HashEncoder) {
        let _ = self.free.push(encoder);
    }

    /// One-shot helper: check out, hash, check back in.
    pub fn encode_sum(&self, data: &[u8]) -> String {
        let mut encoder = self.acquire();
        let sum = encoder.encode_sum(data);
        self.release(encoder);
        sum
    }

    /// Number of idle encoders currently held.
    pub fn idle(&self) -> usize {
        self.free.len()
    }
}

/// Check whether `s` is a well-formed encoded block hash.
pub fn is_encoded_hash(s: &str) -> bool {
    let mut digest = [0u8; blake3::OUT_LEN];
    s.len() == ENCODED_HASH_LEN
        && !s.bytes().any(|b| b.is_ascii_uppercase())
        && hex::decode_to_slice(s, &mut digest).is_ok()
}
