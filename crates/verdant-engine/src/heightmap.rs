//! Sparse surface heightmap with bilinear interpolation.
//!
//! Heights are sampled on a configurable grid (`grid_spacing` blocks apart,
//! default 16) and stored per 16-block chunk as `(n+1)²` lock-free slots,
//! `n = 16 / grid_spacing`. Queries bilinearly interpolate the four
//! surrounding grid corners. A per-thread batch cache absorbs the bursts of
//! nearby lookups a flood fill produces.

use std::cell::RefCell;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;
use verdant_common::{ChunkCoord, ColumnPos, SmoothError, CHUNK_BLOCKS};

use crate::sources::SurfaceHeightSource;
use crate::telemetry::{FaultLimiter, TelemetrySink};

/// Upper bound on live height samples across all chunks.
const MAX_LIVE_SAMPLES: usize = 100_000;

/// Sentinel marking a slot that has not been calculated yet.
const UNCALCULATED: i64 = i64::MIN;

/// Sentinel marking a slot a thread has claimed and is computing.
const CLAIMED: i64 = i64::MIN + 1;

/// Yield iterations a loser waits on a claimed slot before computing
/// directly (uncached).
const CLAIM_SPIN_LIMIT: u32 = 1_000;

/// Per-thread batch cache size.
const BATCH_CAPACITY: usize = 8;

/// Per-thread batch cache entry freshness.
const BATCH_TTL: Duration = Duration::from_millis(100);

/// Instance counter so batch-cache entries never leak between caches.
static CACHE_IDS: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy)]
struct BatchEntry {
    cache_id: u64,
    generation: u64,
    bx: i32,
    bz: i32,
    height: i32,
    at: Instant,
}

thread_local! {
    static BATCH: RefCell<([Option<BatchEntry>; BATCH_CAPACITY], usize)> =
        const { RefCell::new(([None; BATCH_CAPACITY], 0)) };
}

/// Height samples for one 16-block chunk.
struct ChunkHeightGrid {
    /// `(n+1)²` slots, row-major by local Z; [`UNCALCULATED`] until published.
    slots: Box<[AtomicI64]>,
    /// Number of published slots, for eviction accounting.
    published: AtomicUsize,
    /// Logical access clock tick of the last touch.
    last_access: AtomicU64,
}

impl ChunkHeightGrid {
    fn new(cells_per_axis: i32) -> Self {
        let side = (cells_per_axis + 1) as usize;
        let slots = (0..side * side)
            .map(|_| AtomicI64::new(UNCALCULATED))
            .collect();
        Self {
            slots,
            published: AtomicUsize::new(0),
            last_access: AtomicU64::new(0),
        }
    }
}

/// Chunk-aligned sparse heightmap over an external height source.
pub struct HeightmapCache {
    source: Arc<dyn SurfaceHeightSource>,
    chunks: DashMap<ChunkCoord, Arc<ChunkHeightGrid>>,
    telemetry: Arc<dyn TelemetrySink>,
    faults: FaultLimiter,
    /// Grid spacing in blocks; divides 16.
    spacing: i32,
    /// Grid cells per chunk axis (`16 / spacing`).
    cells_per_axis: i32,
    live_samples: AtomicUsize,
    max_samples: usize,
    access_clock: AtomicU64,
    cache_id: u64,
    generation: AtomicU64,
}

impl HeightmapCache {
    /// Creates a cache over `source` with the given (already validated)
    /// grid spacing.
    #[must_use]
    pub fn new(
        source: Arc<dyn SurfaceHeightSource>,
        grid_spacing: u32,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let spacing = (grid_spacing as i32).clamp(1, CHUNK_BLOCKS);
        Self {
            source,
            chunks: DashMap::new(),
            telemetry,
            faults: FaultLimiter::default(),
            spacing,
            cells_per_axis: CHUNK_BLOCKS / spacing,
            live_samples: AtomicUsize::new(0),
            max_samples: MAX_LIVE_SAMPLES,
            access_clock: AtomicU64::new(0),
            cache_id: CACHE_IDS.fetch_add(1, Ordering::Relaxed),
            generation: AtomicU64::new(0),
        }
    }

    #[cfg(test)]
    fn with_sample_cap(mut self, cap: usize) -> Self {
        self.max_samples = cap;
        self
    }

    /// Returns the interpolated surface height of block column `(bx, bz)`.
    ///
    /// Total: source failures fall back to a deterministic estimator.
    pub fn height(&self, bx: i32, bz: i32) -> i32 {
        let generation = self.generation.load(Ordering::Acquire);
        if let Some(h) = self.batch_probe(bx, bz, generation) {
            return h;
        }

        let s = self.spacing;
        let gx0 = bx.div_euclid(s);
        let gz0 = bz.div_euclid(s);
        let chunk = ColumnPos::new(bx, bz).chunk();

        let h00 = self.grid_height(gx0, gz0, chunk);
        let h10 = self.grid_height(gx0 + 1, gz0, chunk);
        let h01 = self.grid_height(gx0, gz0 + 1, chunk);
        let h11 = self.grid_height(gx0 + 1, gz0 + 1, chunk);

        let fx = f64::from(bx - gx0 * s) / f64::from(s);
        let fz = f64::from(bz - gz0 * s) / f64::from(s);
        let top = f64::from(h00) * (1.0 - fx) + f64::from(h10) * fx;
        let bottom = f64::from(h01) * (1.0 - fx) + f64::from(h11) * fx;
        let height = (top * (1.0 - fz) + bottom * fz).round() as i32;

        self.batch_store(bx, bz, height, generation);
        height
    }

    /// Number of published height samples across all chunks.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.live_samples.load(Ordering::Relaxed)
    }

    /// Drops every cached chunk and invalidates per-thread batch entries.
    pub fn clear_all(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.chunks.clear();
        self.live_samples.store(0, Ordering::Relaxed);
    }

    /// Height at grid corner `(gx, gz)`, cached in the chunk owning the
    /// original query column.
    fn grid_height(&self, gx: i32, gz: i32, chunk: ChunkCoord) -> i32 {
        let n = self.cells_per_axis;
        let local_x = gx - chunk.x * n;
        let local_z = gz - chunk.z * n;
        if local_x < 0 || local_x > n || local_z < 0 || local_z > n {
            // Corner falls outside the owning chunk's grid; compute directly
            // without caching.
            return self.compute_raw(gx * self.spacing, gz * self.spacing);
        }

        let grid = self
            .chunks
            .entry(chunk)
            .or_insert_with(|| Arc::new(ChunkHeightGrid::new(n)))
            .clone();
        let tick = self.access_clock.fetch_add(1, Ordering::Relaxed) + 1;
        grid.last_access.store(tick, Ordering::Relaxed);

        let idx = (local_z * (n + 1) + local_x) as usize;
        let slot = &grid.slots[idx];
        let current = slot.load(Ordering::Acquire);
        if current != UNCALCULATED && current != CLAIMED {
            return current as i32;
        }

        match slot.compare_exchange(UNCALCULATED, CLAIMED, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                let computed = self.compute_raw(gx * self.spacing, gz * self.spacing);
                slot.store(i64::from(computed), Ordering::Release);
                grid.published.fetch_add(1, Ordering::Relaxed);
                let live = self.live_samples.fetch_add(1, Ordering::Relaxed) + 1;
                if live > self.max_samples {
                    self.evict_lru_chunks();
                }
                computed
            }
            Err(CLAIMED) => {
                // Another thread is computing this corner; adopt its value.
                for _ in 0..CLAIM_SPIN_LIMIT {
                    std::thread::yield_now();
                    let value = slot.load(Ordering::Acquire);
                    if value != CLAIMED {
                        return value as i32;
                    }
                }
                // Winner is stalled; the source is pure, so answering
                // directly stays consistent with whatever it publishes.
                self.compute_raw(gx * self.spacing, gz * self.spacing)
            }
            Err(winner) => winner as i32,
        }
    }

    /// Uncached height from the external source, falling back to the
    /// deterministic estimator when it cannot answer.
    fn compute_raw(&self, bx: i32, bz: i32) -> i32 {
        match self.source.surface_height(bx, bz) {
            Some(h) => h,
            None => {
                self.faults
                    .report(&SmoothError::Height { x: bx, z: bz }, &*self.telemetry);
                fallback_height(bx, bz)
            }
        }
    }

    /// Removes least-recently-touched chunks until back under the sample cap.
    fn evict_lru_chunks(&self) {
        while self.live_samples.load(Ordering::Relaxed) > self.max_samples && self.chunks.len() > 1
        {
            let lru = self
                .chunks
                .iter()
                .min_by_key(|entry| entry.value().last_access.load(Ordering::Relaxed))
                .map(|entry| *entry.key());
            let Some(coord) = lru else { break };
            if let Some((_, grid)) = self.chunks.remove(&coord) {
                let freed = grid.published.load(Ordering::Relaxed);
                self.live_samples.fetch_sub(freed, Ordering::Relaxed);
                debug!(chunk = ?coord, freed, "evicted heightmap chunk");
            }
        }
    }

    fn batch_probe(&self, bx: i32, bz: i32, generation: u64) -> Option<i32> {
        BATCH.with(|cell| {
            let (entries, _) = &*cell.borrow();
            entries.iter().flatten().find_map(|e| {
                (e.cache_id == self.cache_id
                    && e.generation == generation
                    && e.bx == bx
                    && e.bz == bz
                    && e.at.elapsed() <= BATCH_TTL)
                    .then_some(e.height)
            })
        })
    }

    fn batch_store(&self, bx: i32, bz: i32, height: i32, generation: u64) {
        BATCH.with(|cell| {
            let (entries, cursor) = &mut *cell.borrow_mut();
            entries[*cursor] = Some(BatchEntry {
                cache_id: self.cache_id,
                generation,
                bx,
                bz,
                height,
                at: Instant::now(),
            });
            *cursor = (*cursor + 1) % BATCH_CAPACITY;
        });
    }
}

/// Deterministic height estimate used when the external source fails.
#[must_use]
pub fn fallback_height(bx: i32, bz: i32) -> i32 {
    let x = f64::from(bx) * 0.01;
    let z = f64::from(bz) * 0.01;
    (64.0 + 10.0 * x.sin() + 10.0 * z.cos()).round() as i32
}
