//! Core value types for work distribution.

mod midstate;
mod target;
mod work;

pub use midstate::midstate;
pub use target::Target;
pub use work::{sha256d, WorkUnit};

/// Constants of the 80-byte block header layout.
pub mod constants {
    use std::ops::Range;

    /// Size of a work header in bytes
    pub const WORK_SIZE: usize = 80;

    /// Offset of the 32-bit little-endian nonce
    pub const NONCE_OFFSET: usize = 76;

    /// Previous block hash field; two units sharing it are "similar"
    pub const PREV_HASH_RANGE: Range<usize> = 4..36;

    /// Timestamp field (big-endian in the stored order)
    pub const TIMESTAMP_RANGE: Range<usize> = 68..72;

    /// Size of the target in bytes
    pub const TARGET_SIZE: usize = 32;

    /// The full nonce space, covered by a single original unit
    pub const FULL_MASK: u8 = 32;
}

#[cfg(test)]
mod tests {
    use super::constants::*;

    #[test]
    fn test_constants() {
        assert_eq!(WORK_SIZE, 80);
        assert_eq!(NONCE_OFFSET, 76);
        assert_eq!(PREV_HASH_RANGE, 4..36);
        assert_eq!(TIMESTAMP_RANGE, 68..72);
        assert_eq!(TARGET_SIZE, 32);
        assert_eq!(FULL_MASK, 32);
    }
}
