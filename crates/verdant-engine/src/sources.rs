//! External world-data sources the engine consumes.
//!
//! The engine never generates biomes or terrain itself. It asks the host for
//! three things: the biome at a biome-grid position, the surface height of a
//! block column, and the stable identifier behind a biome id. Each contract
//! is small enough that hosts (and tests) can pass a closure.

use verdant_common::BiomeId;

/// Samples the underlying noise-based biome source.
///
/// Coordinates are in the biome grid (block coordinates shifted right by 2).
/// Implementations must be pure: the same input always yields the same
/// biome, regardless of caller or thread. A sampler signals a fault by
/// returning [`BiomeId::NULL`].
pub trait BiomeSampler: Sync {
    /// Returns the biome at biome-grid position `(nx, ny, nz)`.
    fn sample(&self, nx: i32, ny: i32, nz: i32) -> BiomeId;
}

impl<F> BiomeSampler for F
where
    F: Fn(i32, i32, i32) -> BiomeId + Sync,
{
    fn sample(&self, nx: i32, ny: i32, nz: i32) -> BiomeId {
        self(nx, ny, nz)
    }
}

/// Supplies the generated surface height of a block column.
///
/// Returns `None` when the host cannot answer (world still loading,
/// generator error); the engine then falls back to a deterministic
/// estimator.
pub trait SurfaceHeightSource: Send + Sync {
    /// Returns the surface Y of block column `(bx, bz)`, if available.
    fn surface_height(&self, bx: i32, bz: i32) -> Option<i32>;
}

impl<F> SurfaceHeightSource for F
where
    F: Fn(i32, i32) -> Option<i32> + Send + Sync,
{
    fn surface_height(&self, bx: i32, bz: i32) -> Option<i32> {
        self(bx, bz)
    }
}

/// Resolves biome ids to their stable registry identifiers.
///
/// Backs two predicates: the decoration-safe validity check (a cached result
/// is only handed back if its biome still resolves) and the optional
/// village-class preservation match on identifier substrings.
pub trait BiomeRegistry: Send + Sync {
    /// Returns the stable identifier for `biome`, or `None` if the id is
    /// unknown to the host registry.
    fn key_of(&self, biome: BiomeId) -> Option<&str>;
}

impl<F> BiomeRegistry for F
where
    F: Fn(BiomeId) -> Option<&'static str> + Send + Sync,
{
    fn key_of(&self, biome: BiomeId) -> Option<&str> {
        self(biome)
    }
}
