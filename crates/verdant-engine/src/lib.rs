//! Micro-region biome smoothing engine.
//!
//! Sits between a host world-generator and its noise-based biome source.
//! For each queried block, the engine projects the column to its surface
//! biome and, when that biome forms a connected component smaller than the
//! configured threshold, substitutes the dominant neighboring biome. The
//! same query always yields the same answer regardless of scheduling, and
//! layered caching keeps the amortized per-query cost near zero.
//!
//! The host supplies three collaborators ([`BiomeSampler`],
//! [`SurfaceHeightSource`], [`BiomeRegistry`]) plus an optional
//! [`TelemetrySink`], and calls [`BiomeSmoother::modified_biome`] from its
//! biome hook.

pub mod config;
pub mod floodfill;
pub mod heightmap;
pub mod region;
pub mod smoother;
pub mod sources;
pub mod telemetry;

pub use config::SmootherConfig;
pub use floodfill::{FillKey, FillOutcome, FillTask, FloodFiller};
pub use heightmap::HeightmapCache;
pub use region::{BiomeResult, CacheStatsSnapshot, RegionCache, SpatialResult};
pub use smoother::BiomeSmoother;
pub use sources::{BiomeRegistry, BiomeSampler, SurfaceHeightSource};
pub use telemetry::{NoopTelemetry, PerfSection, ReplacementEvent, TelemetrySink};

// Re-export the shared identity and fault types for host convenience.
pub use verdant_common::{BiomeId, FaultKind, SmoothError, SmoothResult};
