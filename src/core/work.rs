//! WorkUnit: a block header candidate plus a reserved nonce sub-range.

use crate::core::constants::{NONCE_OFFSET, PREV_HASH_RANGE, TIMESTAMP_RANGE, WORK_SIZE};
use crate::core::Target;
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fmt;

/// An actual unit of work to be done by miners: an 80-byte block header
/// candidate together with the range of nonces a miner may try.
///
/// The mask is the number of low nonce bits the miner may vary, so the unit
/// covers `2^mask` nonces. The nonce is treated as little-endian, unlike the
/// other multi-byte header fields, so that miners can load it as a native
/// 32-bit word and simply increment it `2^mask` times.
#[derive(Clone, PartialEq, Eq)]
pub struct WorkUnit {
    data: [u8; WORK_SIZE],
    target: Target,
    mask: u8,
    original: bool,
}

fn mask_bits(mask: u8) -> u32 {
    ((1u64 << mask) - 1) as u32
}

fn read_le_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

/// Double SHA-256 of a byte buffer.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

impl WorkUnit {
    /// Create a WorkUnit from header bytes, a target and a mask.
    ///
    /// The incoming base nonce may have mask bits already set; those are
    /// cleared so the stored nonce is the true lower bound of the range.
    pub fn new(data: &[u8], target: Target, mask: u8) -> Result<Self> {
        if data.len() != WORK_SIZE {
            return Err(Error::work(format!(
                "invalid work length: expected {} bytes, got {}",
                WORK_SIZE,
                data.len()
            )));
        }
        if mask > 32 {
            return Err(Error::work(format!("invalid mask: {}", mask)));
        }

        let mut bytes = [0u8; WORK_SIZE];
        bytes.copy_from_slice(data);
        let nonce = read_le_u32(&bytes, NONCE_OFFSET) & !mask_bits(mask);
        bytes[NONCE_OFFSET..].copy_from_slice(&nonce.to_le_bytes());

        Ok(Self {
            data: bytes,
            target,
            mask,
            original: true,
        })
    }

    /// The raw header bytes.
    pub fn data(&self) -> &[u8; WORK_SIZE] {
        &self.data
    }

    /// The solution target for this unit.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Number of low nonce bits the miner may vary.
    pub fn mask(&self) -> u8 {
        self.mask
    }

    /// Whether this unit came straight from the backend rather than a split.
    pub fn is_original(&self) -> bool {
        self.original
    }

    /// Number of nonces covered by this unit.
    pub fn hashes(&self) -> u64 {
        1u64 << self.mask
    }

    /// The UNIX timestamp in the header (stored big-endian).
    pub fn timestamp(&self) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.data[TIMESTAMP_RANGE]);
        u32::from_be_bytes(bytes)
    }

    /// The base nonce of this unit's range (stored little-endian).
    pub fn nonce(&self) -> u32 {
        read_le_u32(&self.data, NONCE_OFFSET)
    }

    /// Do this unit and the other share the same previous block hash?
    pub fn is_similar_to(&self, other: &WorkUnit) -> bool {
        self.data[PREV_HASH_RANGE] == other.data[PREV_HASH_RANGE]
    }

    /// Subdivide this unit in half, yielding two units at `mask - 1` whose
    /// ranges partition this unit's range. Returns `None` when the unit is
    /// a single nonce and cannot be split.
    pub fn split(&self) -> Option<(WorkUnit, WorkUnit)> {
        if self.mask == 0 {
            return None;
        }

        let child_mask = self.mask - 1;
        let mut left = self.clone();
        left.mask = child_mask;
        left.original = false;

        let mut right = left.clone();
        let nonce = self.nonce() | (1u32 << child_mask);
        right.data[NONCE_OFFSET..].copy_from_slice(&nonce.to_le_bytes());

        Some((left, right))
    }

    /// Check a submitted result against this unit and its own target.
    pub fn check_result(&self, result: &[u8]) -> bool {
        self.check_result_with(result, &self.target)
    }

    /// Check a submitted result against this unit and an explicit target.
    ///
    /// The result must be a full header whose first 76 bytes match this
    /// unit's and whose nonce falls inside the reserved sub-range; only then
    /// is the hash computed. The header words are byte-swapped before
    /// hashing because miners store them in SHA-256's native load order.
    pub fn check_result_with(&self, result: &[u8], target: &Target) -> bool {
        if result.len() != WORK_SIZE {
            return false;
        }
        if result[..NONCE_OFFSET] != self.data[..NONCE_OFFSET] {
            return false;
        }

        let bits = mask_bits(self.mask);
        let result_nonce = read_le_u32(result, NONCE_OFFSET);
        if (self.nonce() | bits) != (result_nonce | bits) {
            return false;
        }

        let mut swapped = [0u8; WORK_SIZE];
        for i in 0..WORK_SIZE {
            swapped[i] = result[i ^ 3];
        }

        target.meets(&sha256d(&swapped))
    }

    /// Sort key for the work buffer: newest first (oldest first in FIFO
    /// mode), ties broken by the smallest mask.
    pub fn sort_key(&self, fifo: bool) -> (i64, u8) {
        let ts = self.timestamp() as i64;
        if fifo {
            (ts, self.mask)
        } else {
            (-ts, self.mask)
        }
    }

    /// Hex encoding of the header bytes.
    pub fn to_hex(&self) -> String {
        hex::encode(self.data)
    }
}

impl fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkUnit")
            .field("nonce", &self.nonce())
            .field("mask", &self.mask)
            .field("timestamp", &self.timestamp())
            .field("original", &self.original)
            .finish()
    }
}
