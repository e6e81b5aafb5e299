//! SHA-256 midstate of a work header.
//!
//! Old getwork miners resume hashing from the compression state left after
//! the first 64 header bytes, so the admin interface hands that state out
//! alongside the padded header.

use sha2::compress256;
use sha2::digest::crypto_common::generic_array::GenericArray;

const SHA256_INIT: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

/// Compute the SHA-256 state after compressing the given 64-byte block,
/// serialized as eight little-endian words per the getwork convention.
pub fn midstate(block: &[u8; 64]) -> [u8; 32] {
    let mut state = SHA256_INIT;
    compress256(&mut state, &[GenericArray::clone_from_slice(block)]);

    let mut out = [0u8; 32];
    for (i, word) in state.iter().enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    /// Resuming from the midstate over the standard padding block must give
    /// the same digest as hashing the 64-byte message directly.
    #[test]
    fn test_midstate_resumes_to_full_digest() {
        let message = [0x42u8; 64];
        let mid = midstate(&message);

        let mut state = [0u32; 8];
        for i in 0..8 {
            let mut word = [0u8; 4];
            word.copy_from_slice(&mid[i * 4..i * 4 + 4]);
            state[i] = u32::from_le_bytes(word);
        }

        // Padding for a 64-byte message: 0x80, zeros, 512-bit length.
        let mut padding = [0u8; 64];
        padding[0] = 0x80;
        padding[56..].copy_from_slice(&512u64.to_be_bytes());
        compress256(&mut state, &[GenericArray::clone_from_slice(&padding)]);

        let mut resumed = [0u8; 32];
        for (i, word) in state.iter().enumerate() {
            resumed[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }

        let direct: [u8; 32] = Sha256::digest(message).into();
        assert_eq!(resumed, direct);
    }

    #[test]
    fn test_midstate_differs_per_block() {
        assert_ne!(midstate(&[0u8; 64]), midstate(&[1u8; 64]));
    }
}
