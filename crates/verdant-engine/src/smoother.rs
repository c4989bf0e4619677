//! The biome-smoothing decision pipeline.
//!
//! One query answers "which biome belongs at this block": preserved biomes
//! pass through, columns whose queried biome is not the surface biome pass
//! through (memoized), and everything else consults the layered caches
//! before a flood fill decides micro versus large. Micro components are
//! replaced by their dominant perimeter biome.
//!
//! The entry point is total: every internal fault is absorbed, logged
//! rate-limited, and answered with the vanilla biome.

use std::cell::Cell;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;
use verdant_common::{BiomeId, ColumnPos, SmoothError, SmoothResult};

use crate::config::SmootherConfig;
use crate::floodfill::{FillKey, FillOutcome, FloodFiller, FILL_WAIT, LARGE_SPATIAL_RADIUS};
use crate::heightmap::HeightmapCache;
use crate::region::{BiomeResult, CacheStatsSnapshot, RegionCache};
use crate::sources::{BiomeRegistry, BiomeSampler, SurfaceHeightSource};
use crate::telemetry::{FaultLimiter, PerfSection, ReplacementEvent, TelemetrySink};

/// Horizontal block-coordinate bound accepted by the engine.
const MAX_HORIZONTAL: u32 = 30_000_000;

/// Vertical block-coordinate bound accepted by the engine.
const MAX_VERTICAL: u32 = 4_096;

/// Step of the upward surface scan.
const SURFACE_SCAN_STEP: i32 = 8;

/// Ceiling of the upward surface scan.
const SURFACE_SCAN_TOP: i32 = 320;

/// Probe limit of the upward surface scan.
const SURFACE_SCAN_PROBES: u32 = 20;

thread_local! {
    /// Re-entry flag: set while this thread is inside the engine, so nested
    /// host hooks (triggered by our own sampler calls) bypass smoothing.
    static IN_ENGINE: Cell<bool> = const { Cell::new(false) };
}

struct ReentryGuard;

impl ReentryGuard {
    fn try_enter() -> Option<Self> {
        IN_ENGINE.with(|flag| {
            if flag.get() {
                None
            } else {
                flag.set(true);
                Some(Self)
            }
        })
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        IN_ENGINE.with(|flag| flag.set(false));
    }
}

/// The micro-biome smoothing engine.
pub struct BiomeSmoother {
    config: SmootherConfig,
    regions: RegionCache,
    heightmap: HeightmapCache,
    registry: Arc<dyn BiomeRegistry>,
    telemetry: Arc<dyn TelemetrySink>,
    faults: FaultLimiter,
}

impl BiomeSmoother {
    /// Builds an engine from its collaborators. The config is validated
    /// (range-clamped) here.
    #[must_use]
    pub fn new(
        config: SmootherConfig,
        heights: Arc<dyn SurfaceHeightSource>,
        registry: Arc<dyn BiomeRegistry>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let config = config.validated();
        let heightmap =
            HeightmapCache::new(heights, config.grid_spacing, Arc::clone(&telemetry));
        let regions = RegionCache::new(config.max_cache_memory_mb);
        Self {
            config,
            regions,
            heightmap,
            registry,
            telemetry,
            faults: FaultLimiter::default(),
        }
    }

    /// The validated configuration this engine runs with.
    #[must_use]
    pub fn config(&self) -> &SmootherConfig {
        &self.config
    }

    /// Snapshot of the cache hit/eviction counters.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.regions.stats()
    }

    /// World-unload hook: drops every cache layer and cancels in-flight
    /// fills. Subsequent queries recompute deterministically.
    pub fn clear_all(&self) {
        self.regions.clear_all();
        self.heightmap.clear_all();
    }

    /// Returns the biome the host should use at `(bx, by, bz)`.
    ///
    /// Total: never panics, never blocks longer than the fill deadline, and
    /// on any internal fault answers with `vanilla`.
    pub fn modified_biome(
        &self,
        bx: i32,
        by: i32,
        bz: i32,
        vanilla: BiomeId,
        sampler: &dyn BiomeSampler,
    ) -> BiomeId {
        if !self.config.enabled {
            return vanilla;
        }
        let Some(_guard) = ReentryGuard::try_enter() else {
            // Nested host call issued by our own sampling; answer natively.
            return vanilla;
        };
        match self.smooth(bx, by, bz, vanilla, sampler) {
            Ok(result) => result.biome,
            Err(error) => {
                self.faults.report(&error, &*self.telemetry);
                vanilla
            }
        }
    }

    fn smooth(
        &self,
        bx: i32,
        by: i32,
        bz: i32,
        vanilla: BiomeId,
        sampler: &dyn BiomeSampler,
    ) -> SmoothResult<BiomeResult> {
        if !vanilla.is_valid() {
            return Err(SmoothError::Validation("null vanilla biome".into()));
        }
        if bx.unsigned_abs() > MAX_HORIZONTAL
            || bz.unsigned_abs() > MAX_HORIZONTAL
            || by.unsigned_abs() > MAX_VERTICAL
        {
            return Err(SmoothError::Validation(format!(
                "coordinates out of range: ({bx}, {by}, {bz})"
            )));
        }
        if self.config.is_preserved(vanilla, &*self.registry) {
            return Ok(BiomeResult::unchanged(vanilla));
        }
        let pos = ColumnPos::new(bx, bz);
        self.regions
            .get_or_compute(pos, vanilla, &*self.registry, || {
                self.compute_column(pos, by, vanilla, sampler)
            })
    }

    /// The per-column computation, run at most once per column under the
    /// position lock. Populates the memo layers as it goes.
    fn compute_column(
        &self,
        pos: ColumnPos,
        by: i32,
        vanilla: BiomeId,
        sampler: &dyn BiomeSampler,
    ) -> SmoothResult<BiomeResult> {
        let registry = &*self.registry;

        // Mismatch memo first: cheapest possible answer.
        if self.regions.get_mismatch(pos, vanilla) == Some(true) {
            return Ok(BiomeResult::unchanged(vanilla));
        }

        // Surface projection.
        let projection_start = self.perf_clock();
        let surface_y = self.heightmap.height(pos.x, pos.z);
        let surface = surface_biome(sampler, &self.config, pos, surface_y);
        self.perf_emit(PerfSection::SurfaceProjection, projection_start);
        if !surface.is_valid() {
            return Err(SmoothError::Sampler {
                x: pos.x >> 2,
                y: surface_y >> 2,
                z: pos.z >> 2,
            });
        }

        // Not the surface biome at this column: memoize and pass through.
        if vanilla != surface {
            self.regions.put_mismatch(pos, vanilla, true);
            return Ok(BiomeResult::unchanged(vanilla));
        }

        // Spatial reuse, then large-area anchors.
        let probe_start = self.perf_clock();
        if let Some(spatial) = self.regions.get_spatial(pos, surface) {
            let result = match spatial.replacement {
                Some(replacement) if !spatial.is_large => BiomeResult {
                    biome: replacement,
                    was_micro: true,
                },
                _ => BiomeResult::unchanged(vanilla),
            };
            self.perf_emit(PerfSection::CacheProbe, probe_start);
            self.regions.put_surface(pos, surface, result, registry);
            return Ok(result);
        }
        if self.regions.is_known_large_area(pos, surface) {
            let result = BiomeResult::unchanged(vanilla);
            self.perf_emit(PerfSection::CacheProbe, probe_start);
            self.regions.put_surface(pos, surface, result, registry);
            return Ok(result);
        }
        self.perf_emit(PerfSection::CacheProbe, probe_start);

        // Flood fill decides micro versus large.
        let outcome = self.run_or_join_fill(pos, surface, sampler)?;
        let result = if outcome.is_large {
            self.regions.mark_large_area(pos, surface);
            self.regions
                .put_spatial(pos, surface, true, None, LARGE_SPATIAL_RADIUS);
            BiomeResult::unchanged(vanilla)
        } else if let Some(replacement) = outcome.replacement {
            let cells = outcome.cells.len();
            self.regions
                .put_spatial(pos, surface, false, Some(replacement), component_radius(cells));
            if self.config.debug {
                self.telemetry.replacement(&ReplacementEvent {
                    x: pos.x,
                    y: by,
                    z: pos.z,
                    from: vanilla,
                    to: replacement,
                    region_cells: cells,
                });
            }
            debug!(
                x = pos.x,
                z = pos.z,
                from = vanilla.raw(),
                to = replacement.raw(),
                cells,
                "replaced micro biome"
            );
            BiomeResult {
                biome: replacement,
                was_micro: true,
            }
        } else {
            BiomeResult::unchanged(vanilla)
        };

        self.regions.put_surface(pos, surface, result, registry);
        Ok(result)
    }

    /// Dispatches or joins the fill for `(pos, surface)`.
    ///
    /// The inserting thread produces; everyone else awaits the completion
    /// barrier with a deadline. Completed tasks stay behind as an O(1)
    /// result cache.
    fn run_or_join_fill(
        &self,
        pos: ColumnPos,
        surface: BiomeId,
        sampler: &dyn BiomeSampler,
    ) -> SmoothResult<Arc<FillOutcome>> {
        let key = FillKey {
            x: pos.x,
            z: pos.z,
            biome: surface,
        };
        let (task, is_producer) = self.regions.try_start_fill(key);
        if let Some(done) = task.result() {
            return Ok(done);
        }
        if is_producer {
            let fill_start = self.perf_clock();
            let filler =
                FloodFiller::new(sampler, &self.heightmap, &self.config, &*self.registry);
            let outcome = Arc::new(filler.run(pos, surface));
            task.complete(Arc::clone(&outcome));
            self.perf_emit(PerfSection::FloodFill, fill_start);
            Ok(outcome)
        } else {
            task.wait(FILL_WAIT)
                .ok_or(SmoothError::FillTimeout(FILL_WAIT))
        }
    }

    fn perf_clock(&self) -> Option<Instant> {
        self.config.performance_logging.then(Instant::now)
    }

    fn perf_emit(&self, section: PerfSection, start: Option<Instant>) {
        if let Some(start) = start {
            self.telemetry.timing(section, start.elapsed());
        }
    }
}

/// Projects a column to its surface biome: sample upward from `surface_y`
/// in 8-block steps, skipping configured cave biomes, bounded by the scan
/// ceiling and probe limit. Falls back to the first sampled biome.
pub(crate) fn surface_biome(
    sampler: &dyn BiomeSampler,
    config: &SmootherConfig,
    pos: ColumnPos,
    surface_y: i32,
) -> BiomeId {
    let nx = pos.x >> 2;
    let nz = pos.z >> 2;
    let mut fallback = BiomeId::NULL;
    let mut y = surface_y;
    for probe in 0..SURFACE_SCAN_PROBES {
        let biome = sampler.sample(nx, y >> 2, nz);
        if probe == 0 {
            fallback = biome;
        }
        if biome.is_valid() && !config.is_cave(biome) {
            return biome;
        }
        y += SURFACE_SCAN_STEP;
        if y > SURFACE_SCAN_TOP {
            break;
        }
    }
    fallback
}

/// Covered radius recorded for a micro component: `⌊√cells⌋`.
fn component_radius(cells: usize) -> u32 {
    (cells as f64).sqrt() as u32
}
