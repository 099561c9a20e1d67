//! Chunk manifest lines kept in the staging area.

use crate::errors::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};

/// Chunking metadata for one file of an asset.
///
/// Serialized as one JSON object per line in the asset's manifest log.
/// Lives only on the staging filesystem and is deleted after reassembly.
///
/// Every part but the last is exactly `chunk_size` bytes; the last one holds
/// the remainder up to `total_size`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ManifestEntry {
    pub identifier: String,
    pub relative_path: String,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub total_size: u64,
}

impl ManifestEntry {
    /// Byte offset at which chunk `chunk_number` (1-based) starts, `None` on
    /// overflow.
    pub fn offset_of(&self, chunk_number: u32) -> Option<u64> {
        self.chunk_size
            .checked_mul(u64::from(chunk_number.saturating_sub(1)))
    }

    /// Exact length part `chunk_number` must have.
    pub fn part_len(&self, chunk_number: u32) -> Option<u64> {
        if chunk_number < self.total_chunks {
            Some(self.chunk_size)
        } else {
            self.total_size.checked_sub(self.offset_of(chunk_number)?)
        }
    }

    /// Reject layouts whose parts cannot tile `total_size`.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.total_chunks == 0 {
            return Err(invalid("total chunks must be positive"));
        }
        if self.chunk_size == 0 {
            return Err(invalid("chunk size must be positive"));
        }
        let last_offset = self
            .offset_of(self.total_chunks)
            .ok_or_else(|| invalid("chunk layout overflows"))?;
        let fits = if self.total_size == 0 {
            self.total_chunks == 1
        } else {
            last_offset < self.total_size
        };
        if !fits {
            return Err(invalid(format!(
                "{} chunks of {} bytes do not fit a {} byte file",
                self.total_chunks, self.chunk_size, self.total_size
            )));
        }
        Ok(())
    }

    /// Check that a part carries exactly the bytes its position requires.
    pub fn check_part(&self, chunk_number: u32, len: u64) -> GatewayResult<()> {
        if chunk_number == 0 || chunk_number > self.total_chunks {
            return Err(invalid(format!(
                "chunk {} out of range 1..={}",
                chunk_number, self.total_chunks
            )));
        }
        match self.part_len(chunk_number) {
            Some(expected) if expected == len => Ok(()),
            Some(expected) => Err(invalid(format!(
                "chunk {} of `{}` has {} bytes, expected {}",
                chunk_number, self.identifier, len, expected
            ))),
            None => Err(invalid("chunk layout overflows")),
        }
    }
}

fn invalid(msg: impl Into<String>) -> GatewayError {
    GatewayError::InvalidInput(msg.into())
}
