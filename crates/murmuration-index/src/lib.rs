//! Spatial cell hashing and shard assignment for flock aggregation.

use glam::Vec3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted by grid construction.
#[derive(Debug, Error)]
pub enum GridError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell radius).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Hash identifying one spatial grid cell for the duration of a tick.
///
/// Distinct cells may collide within the 32-bit space; consumers must only
/// rely on equal positions producing equal hashes, never on uniqueness.
pub type CellHash = i32;

/// Mix three integer cell coordinates into a single cell hash.
///
/// Multiplicative/XOR folds per axis followed by a shift-xor finalizer, in
/// wrapping 32-bit arithmetic so the result is identical on every platform.
#[inline]
#[must_use]
pub fn hash_cell(x: i32, y: i32, z: i32) -> CellHash {
    let mut h = x;
    h = h.wrapping_mul(397) ^ y;
    h = h.wrapping_mul(397) ^ z;
    h = h.wrapping_add(h << 3);
    h ^= h >> 11;
    h.wrapping_add(h << 15)
}

/// Shard owning a cell hash, given a fixed shard count.
///
/// Reduces the sign-extended unsigned value so negative hashes map to a
/// stable shard below `shard_count`. Equal hashes always land on the same
/// shard; that stability is the only contract.
#[inline]
#[must_use]
pub fn shard_for(hash: CellHash, shard_count: usize) -> usize {
    debug_assert!(shard_count > 0);
    (hash as u64 % shard_count as u64) as usize
}

/// Uniform grid that buckets positions into cells of a fixed radius.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CellGrid {
    /// Edge length of each grid cell in world units.
    pub cell_radius: f32,
}

impl CellGrid {
    /// Create a grid with the provided cell radius.
    pub fn new(cell_radius: f32) -> Result<Self, GridError> {
        if !cell_radius.is_finite() || cell_radius <= 0.0 {
            return Err(GridError::InvalidConfig(
                "cell_radius must be finite and positive",
            ));
        }
        Ok(Self { cell_radius })
    }

    /// Hash of the cell containing `position`.
    ///
    /// Pure function of the position and the cell radius: identical inputs
    /// always yield the identical hash.
    #[inline]
    #[must_use]
    pub fn hash_position(&self, position: Vec3) -> CellHash {
        let cell = (position / self.cell_radius).floor();
        hash_cell(cell.x as i32, cell.y as i32, cell.z as i32)
    }
}

impl Default for CellGrid {
    fn default() -> Self {
        Self { cell_radius: 1.0 }
    }
}
