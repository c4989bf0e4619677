//! Shared types for the verdant smoothing engine.
//!
//! Provides the coordinate grids the engine operates on (block columns,
//! biome cells, chunks, regions), the opaque biome identity, and the
//! internal fault taxonomy.

pub mod biome;
pub mod coords;
pub mod error;

pub use biome::BiomeId;
pub use coords::{
    pack_center, unpack_center, CellPos, ChunkCoord, ColumnPos, RegionCoord, BIOME_CELL_BLOCKS,
    CHUNK_BLOCKS, REGION_BLOCKS,
};
pub use error::{FaultKind, SmoothError, SmoothResult};
