//! Target type for the solution difficulty threshold.

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;

/// A 256-bit difficulty target, stored as 32 little-endian bytes.
///
/// A solution hash is acceptable when it is numerically less than or equal
/// to the target, comparing both as little-endian 256-bit integers.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Target(pub [u8; 32]);

impl Target {
    /// Create a Target from its 32 little-endian bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create a Target from a byte slice.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != 32 {
            return Err(Error::work(format!(
                "invalid target length: expected 32 bytes, got {}",
                slice.len()
            )));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Create a Target from a hex string.
    pub fn from_hex(hex: &str) -> Result<Self> {
        let bytes =
            hex::decode(hex).map_err(|e| Error::work(format!("invalid target hex: {}", e)))?;
        Self::from_slice(&bytes)
    }

    /// Get the target bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex representation in storage (little-endian) order.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The easiest possible target; every hash meets it.
    pub fn max() -> Self {
        Self([0xff; 32])
    }

    /// Order a 32-byte hash against this target as little-endian integers.
    ///
    /// The high-index byte is the most significant, so the scan runs from
    /// byte 31 downward; the first differing byte decides.
    pub fn compare_hash(&self, hash: &[u8; 32]) -> Ordering {
        for i in (0..32).rev() {
            match hash[i].cmp(&self.0[i]) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }

    /// Check whether a hash meets this target (ties accept).
    pub fn meets(&self, hash: &[u8; 32]) -> bool {
        self.compare_hash(hash) != Ordering::Greater
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Target").field(&self.to_hex()).finish()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_slice_length() {
        assert!(Target::from_slice(&[0u8; 32]).is_ok());
        assert!(Target::from_slice(&[0u8; 31]).is_err());
        assert!(Target::from_slice(&[0u8; 33]).is_err());
    }

    #[test]
    fn test_hex_round_trip() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        bytes[31] = 0x01;
        let target = Target::from_bytes(bytes);
        let parsed = Target::from_hex(&target.to_hex()).unwrap();
        assert_eq!(target, parsed);
    }

    #[test]
    fn test_meets_high_byte_decides() {
        // Target with the most significant byte set: any hash whose byte 31
        // is smaller meets it regardless of the low bytes.
        let mut target = [0u8; 32];
        target[31] = 0x10;
        let target = Target::from_bytes(target);

        let mut hash = [0xff; 32];
        hash[31] = 0x0f;
        assert!(target.meets(&hash));

        hash[31] = 0x11;
        assert!(!target.meets(&hash));
    }

    #[test]
    fn test_meets_tie_accepts() {
        let bytes = [0x42u8; 32];
        let target = Target::from_bytes(bytes);
        assert!(target.meets(&bytes));
    }

    #[test]
    fn test_meets_low_byte_breaks_tie() {
        let mut target = [0x42u8; 32];
        target[0] = 0x10;
        let target = Target::from_bytes(target);

        let mut hash = [0x42u8; 32];
        hash[0] = 0x0f;
        assert!(target.meets(&hash));
        hash[0] = 0x11;
        assert!(!target.meets(&hash));
    }

    #[test]
    fn test_max_meets_everything() {
        assert!(Target::max().meets(&[0xff; 32]));
        assert!(Target::max().meets(&[0x00; 32]));
    }
}
