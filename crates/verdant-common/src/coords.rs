//! Coordinate grids used by the smoothing engine.
//!
//! Three nested grids, all addressed by `(x, z)` columns:
//!
//! - **Block** grid: the fine integer grid the host queries in.
//! - **Biome cell** grid: 4×4 blocks per cell; flood fills run here.
//! - **Chunk** grid: 16×16 blocks; unit of heightmap storage.
//! - **Region** grid: 512×512 blocks; unit of cache organization and
//!   eviction.
//!
//! Conversions use arithmetic shifts so negative coordinates floor the way
//! the rest of the engine expects.

use serde::{Deserialize, Serialize};

/// Blocks per biome cell along one axis (shift by 2).
pub const BIOME_CELL_BLOCKS: i32 = 4;

/// Blocks per chunk along one axis (shift by 4).
pub const CHUNK_BLOCKS: i32 = 16;

/// Blocks per region along one axis (shift by 9).
pub const REGION_BLOCKS: i32 = 512;

const BIOME_SHIFT: i32 = 2;
const CHUNK_SHIFT: i32 = 4;
const REGION_SHIFT: i32 = 9;
const REGION_MASK: i32 = REGION_BLOCKS - 1;

/// A block column: fixed `(x, z)` in block coordinates, any `y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnPos {
    /// Block X coordinate
    pub x: i32,
    /// Block Z coordinate
    pub z: i32,
}

impl ColumnPos {
    /// Creates a new block column position.
    #[must_use]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Converts to the biome cell containing this column.
    #[must_use]
    pub const fn cell(self) -> CellPos {
        CellPos {
            x: self.x >> BIOME_SHIFT,
            z: self.z >> BIOME_SHIFT,
        }
    }

    /// Converts to the chunk containing this column.
    #[must_use]
    pub const fn chunk(self) -> ChunkCoord {
        ChunkCoord {
            x: self.x >> CHUNK_SHIFT,
            z: self.z >> CHUNK_SHIFT,
        }
    }

    /// Converts to the region containing this column.
    #[must_use]
    pub const fn region(self) -> RegionCoord {
        RegionCoord {
            x: self.x >> REGION_SHIFT,
            z: self.z >> REGION_SHIFT,
        }
    }

    /// Packs the column's position within its region into a single key:
    /// `((x & 511) << 9) | (z & 511)`.
    #[must_use]
    pub const fn column_key(self) -> u32 {
        (((self.x & REGION_MASK) << REGION_SHIFT) | (self.z & REGION_MASK)) as u32
    }

    /// Snaps the column to the origin of its `grid`-aligned cell.
    ///
    /// `grid` must be positive. Used to key spatial-reuse entries.
    #[must_use]
    pub fn grid_aligned(self, grid: i32) -> Self {
        Self {
            x: self.x.div_euclid(grid) * grid,
            z: self.z.div_euclid(grid) * grid,
        }
    }

    /// Chebyshev (chessboard) distance to another column.
    #[must_use]
    pub fn chebyshev(self, other: Self) -> u32 {
        let dx = (self.x - other.x).unsigned_abs();
        let dz = (self.z - other.z).unsigned_abs();
        dx.max(dz)
    }
}

/// A biome cell: the coarse 4×4-block grid flood fills run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellPos {
    /// Cell X coordinate
    pub x: i32,
    /// Cell Z coordinate
    pub z: i32,
}

impl CellPos {
    /// Creates a new biome cell position.
    #[must_use]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// The block column at this cell's origin corner.
    #[must_use]
    pub const fn block(self) -> ColumnPos {
        ColumnPos {
            x: self.x << BIOME_SHIFT,
            z: self.z << BIOME_SHIFT,
        }
    }

    /// The four cardinal neighbors, always in `+x, -x, +z, -z` order.
    ///
    /// Fill determinism depends on this order staying fixed.
    #[must_use]
    pub const fn neighbors(self) -> [Self; 4] {
        [
            Self::new(self.x + 1, self.z),
            Self::new(self.x - 1, self.z),
            Self::new(self.x, self.z + 1),
            Self::new(self.x, self.z - 1),
        ]
    }
}

/// A chunk coordinate: 16×16-block tiles, the unit of heightmap storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkCoord {
    /// Chunk X coordinate
    pub x: i32,
    /// Chunk Z coordinate
    pub z: i32,
}

impl ChunkCoord {
    /// Creates a new chunk coordinate.
    #[must_use]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// The block column at this chunk's origin corner.
    #[must_use]
    pub const fn origin(self) -> ColumnPos {
        ColumnPos {
            x: self.x << CHUNK_SHIFT,
            z: self.z << CHUNK_SHIFT,
        }
    }
}

/// A region coordinate: 512×512-block tiles, the unit of cache eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionCoord {
    /// Region X coordinate
    pub x: i32,
    /// Region Z coordinate
    pub z: i32,
}

impl RegionCoord {
    /// Creates a new region coordinate.
    #[must_use]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }
}

/// Packs a block position into a sign-biased `u64` that sorts in `(x, z)`
/// lexicographic order.
///
/// Large-area anchor sets are stored sorted so coverage checks can range-scan
/// a window of X values instead of walking the whole set.
#[must_use]
pub const fn pack_center(x: i32, z: i32) -> u64 {
    let bx = (x as u32) ^ 0x8000_0000;
    let bz = (z as u32) ^ 0x8000_0000;
    ((bx as u64) << 32) | (bz as u64)
}

/// Inverse of [`pack_center`].
#[must_use]
pub const fn unpack_center(packed: u64) -> (i32, i32) {
    let bx = ((packed >> 32) as u32) ^ 0x8000_0000;
    let bz = (packed as u32) ^ 0x8000_0000;
    (bx as i32, bz as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_cell_conversion_floors_negatives() {
        assert_eq!(ColumnPos::new(7, 7).cell(), CellPos::new(1, 1));
        assert_eq!(ColumnPos::new(-1, -1).cell(), CellPos::new(-1, -1));
        assert_eq!(ColumnPos::new(-4, -5).cell(), CellPos::new(-1, -2));
        assert_eq!(ColumnPos::new(-8, 3).region(), RegionCoord::new(-1, 0));
    }

    #[test]
    fn test_column_key_is_region_local() {
        // Same local offset in different regions gives the same key.
        let a = ColumnPos::new(5, 9);
        let b = ColumnPos::new(5 + 512, 9 - 1024);
        assert_eq!(a.column_key(), b.column_key());
        assert_eq!(a.column_key(), (5 << 9 | 9) as u32);
    }

    #[test]
    fn test_grid_aligned() {
        assert_eq!(
            ColumnPos::new(37, -3).grid_aligned(32),
            ColumnPos::new(32, -32)
        );
        assert_eq!(ColumnPos::new(64, 0).grid_aligned(64), ColumnPos::new(64, 0));
    }

    #[test]
    fn test_neighbor_order_fixed() {
        let n = CellPos::new(0, 0).neighbors();
        assert_eq!(
            n,
            [
                CellPos::new(1, 0),
                CellPos::new(-1, 0),
                CellPos::new(0, 1),
                CellPos::new(0, -1),
            ]
        );
    }

    proptest! {
        #[test]
        fn test_pack_center_round_trip(x in any::<i32>(), z in any::<i32>()) {
            prop_assert_eq!(unpack_center(pack_center(x, z)), (x, z));
        }

        #[test]
        fn test_pack_center_orders_by_x_then_z(
            x1 in any::<i32>(), z1 in any::<i32>(),
            x2 in any::<i32>(), z2 in any::<i32>(),
        ) {
            let ordered = pack_center(x1, z1) <= pack_center(x2, z2);
            let expected = (x1, z1) <= (x2, z2);
            prop_assert_eq!(ordered, expected);
        }
    }
}
