//! Layered per-region memo cache and the flood-fill dispatcher.
//!
//! Space is partitioned into 512×512-block regions, each holding four memo
//! layers for the smoothing pipeline:
//!
//! - **surface**: the final decision per column,
//! - **mismatch**: columns whose queried biome is not the surface biome,
//! - **anchors**: centers of known-large components per biome,
//! - **spatial**: grid-aligned fill outcomes reusable within a radius.
//!
//! Per-column computation is serialized by 4096 striped locks so each memo
//! is populated at most once per column. Regions are evicted least recently
//! used when the aggregate estimate exceeds the configured budget, shedding
//! layers in a fixed order (spatial, surface, anchors, mismatch) before the
//! region itself is dropped.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;
use verdant_common::{pack_center, unpack_center, BiomeId, ColumnPos, RegionCoord, SmoothResult};

use crate::floodfill::{FillKey, FillTask};
use crate::sources::BiomeRegistry;

/// Striped column locks; must be a power of two.
const COLUMN_LOCK_STRIPES: usize = 4096;

/// Grid alignments probed for spatial reuse, finest first.
const SPATIAL_GRIDS: [i32; 3] = [32, 64, 128];

/// Wall-clock validity of a spatial-reuse entry.
const SPATIAL_TTL: Duration = Duration::from_secs(30);

/// Chebyshev radius covered by one large-area anchor.
pub(crate) const ANCHOR_RADIUS: u32 = 32;

/// How often (in region touches) the memory budget is re-checked.
const BUDGET_CHECK_MASK: u64 = 0xFF;

// Structural cost estimates, in bytes per entry.
const REGION_BASE_BYTES: usize = 512;
const SURFACE_ENTRY_BYTES: usize = 48;
const MISMATCH_ENTRY_BYTES: usize = 48;
const ANCHOR_SET_BYTES: usize = 64;
const ANCHOR_ENTRY_BYTES: usize = 24;
const SPATIAL_ENTRY_BYTES: usize = 80;

/// Final decision for one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BiomeResult {
    /// The biome to hand back to the host.
    pub biome: BiomeId,
    /// Whether the column sat in a micro component that was replaced.
    pub was_micro: bool,
}

impl BiomeResult {
    /// A pass-through result: the queried biome, unmodified.
    #[must_use]
    pub const fn unchanged(biome: BiomeId) -> Self {
        Self {
            biome,
            was_micro: false,
        }
    }
}

/// One column's memoized decision, together with the surface biome it was
/// computed for.
///
/// Recording the surface biome lets a single computation answer every later
/// query at the column: matching queries read the decision, mismatching
/// ones become mismatch memos without re-projecting the surface.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SurfaceEntry {
    /// Surface biome of the column at computation time.
    pub surface: BiomeId,
    /// The decision computed for that surface biome.
    pub result: BiomeResult,
}

/// A fill outcome pinned to a grid-aligned center, reusable for nearby
/// queries with the same surface biome.
#[derive(Debug, Clone, Copy)]
pub struct SpatialResult {
    /// Whether the component was large.
    pub is_large: bool,
    /// Replacement biome for micro components.
    pub replacement: Option<BiomeId>,
    /// Chebyshev radius around the center this entry covers.
    pub radius: u32,
    stored_at: Instant,
}

impl SpatialResult {
    fn is_fresh(&self) -> bool {
        self.stored_at.elapsed() <= SPATIAL_TTL
    }
}

/// Relaxed counters for host debug surfaces.
#[derive(Debug, Default)]
pub struct CacheStats {
    surface_hits: AtomicU64,
    mismatch_hits: AtomicU64,
    spatial_hits: AtomicU64,
    anchor_hits: AtomicU64,
    fills_started: AtomicU64,
    fills_joined: AtomicU64,
    validity_evictions: AtomicU64,
    layers_evicted: AtomicU64,
    regions_evicted: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct CacheStatsSnapshot {
    pub surface_hits: u64,
    pub mismatch_hits: u64,
    pub spatial_hits: u64,
    pub anchor_hits: u64,
    pub fills_started: u64,
    pub fills_joined: u64,
    pub validity_evictions: u64,
    pub layers_evicted: u64,
    pub regions_evicted: u64,
}

impl CacheStats {
    fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            surface_hits: self.surface_hits.load(Ordering::Relaxed),
            mismatch_hits: self.mismatch_hits.load(Ordering::Relaxed),
            spatial_hits: self.spatial_hits.load(Ordering::Relaxed),
            anchor_hits: self.anchor_hits.load(Ordering::Relaxed),
            fills_started: self.fills_started.load(Ordering::Relaxed),
            fills_joined: self.fills_joined.load(Ordering::Relaxed),
            validity_evictions: self.validity_evictions.load(Ordering::Relaxed),
            layers_evicted: self.layers_evicted.load(Ordering::Relaxed),
            regions_evicted: self.regions_evicted.load(Ordering::Relaxed),
        }
    }
}

/// One 512×512-block cache partition.
struct Region {
    /// Column key → final decision for the column's surface biome.
    surface: DashMap<u32, SurfaceEntry>,
    /// (Column key, queried biome) → "not the surface biome here".
    mismatch: DashMap<(u32, BiomeId), bool>,
    /// Biome → sorted packed centers of known-large components.
    anchors: DashMap<BiomeId, BTreeSet<u64>>,
    /// (Grid-aligned center, surface biome) → reusable outcome.
    spatial: DashMap<(ColumnPos, BiomeId), SpatialResult>,
    /// Logical clock tick of the last touch.
    last_access: AtomicU64,
}

impl Region {
    fn new() -> Self {
        Self {
            surface: DashMap::new(),
            mismatch: DashMap::new(),
            anchors: DashMap::new(),
            spatial: DashMap::new(),
            last_access: AtomicU64::new(0),
        }
    }

    fn estimated_bytes(&self) -> usize {
        let anchor_bytes: usize = self
            .anchors
            .iter()
            .map(|e| ANCHOR_SET_BYTES + e.value().len() * ANCHOR_ENTRY_BYTES)
            .sum();
        REGION_BASE_BYTES
            + self.surface.len() * SURFACE_ENTRY_BYTES
            + self.mismatch.len() * MISMATCH_ENTRY_BYTES
            + self.spatial.len() * SPATIAL_ENTRY_BYTES
            + anchor_bytes
    }
}

/// The layered memo cache plus the flood-fill dispatcher.
pub struct RegionCache {
    regions: DashMap<RegionCoord, Arc<Region>>,
    column_locks: Vec<Mutex<()>>,
    /// Dispatcher map; completed tasks are kept as a result cache.
    fills: DashMap<FillKey, Arc<FillTask>>,
    access_clock: AtomicU64,
    max_memory_bytes: usize,
    stats: CacheStats,
}

impl RegionCache {
    /// Creates a cache with the given memory budget in MiB.
    #[must_use]
    pub fn new(max_cache_memory_mb: u32) -> Self {
        Self {
            regions: DashMap::new(),
            column_locks: (0..COLUMN_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            fills: DashMap::new(),
            access_clock: AtomicU64::new(0),
            max_memory_bytes: max_cache_memory_mb as usize * 1024 * 1024,
            stats: CacheStats::default(),
        }
    }

    /// Returns the memoized decision for `(pos, vanilla)`, or runs `compute`
    /// with this column's stripe lock held.
    ///
    /// The stripe lock is the engine's determinism point: per column, at
    /// most one computation populates the memo layers; every later reader
    /// observes its output.
    pub fn get_or_compute<F>(
        &self,
        pos: ColumnPos,
        vanilla: BiomeId,
        registry: &dyn BiomeRegistry,
        compute: F,
    ) -> SmoothResult<BiomeResult>
    where
        F: FnOnce() -> SmoothResult<BiomeResult>,
    {
        let region = self.region(pos);
        if let Some(hit) = self.probe_memos(&region, pos, vanilla, registry) {
            return Ok(hit);
        }
        let _guard = self.column_locks[Self::column_stripe(pos)].lock();
        if let Some(hit) = self.probe_memos(&region, pos, vanilla, registry) {
            return Ok(hit);
        }
        compute()
    }

    /// Lock-free probe of the mismatch memo and the surface cache.
    ///
    /// A surface entry answers *every* query at its column: queries for the
    /// recorded surface biome read the decision, any other biome is a
    /// mismatch (memoized on the spot, per the mismatch invariant).
    fn probe_memos(
        &self,
        region: &Region,
        pos: ColumnPos,
        vanilla: BiomeId,
        registry: &dyn BiomeRegistry,
    ) -> Option<BiomeResult> {
        let key = pos.column_key();
        if region.mismatch.get(&(key, vanilla)).is_some_and(|e| *e) {
            self.stats.mismatch_hits.fetch_add(1, Ordering::Relaxed);
            return Some(BiomeResult::unchanged(vanilla));
        }
        let entry = region.surface.get(&key).map(|e| *e)?;
        if !entry.result.biome.is_valid() || registry.key_of(entry.result.biome).is_none() {
            // Decoration-safe read: drop entries whose biome no longer
            // resolves and treat as a miss.
            region.surface.remove(&key);
            self.stats.validity_evictions.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        if entry.surface == vanilla {
            self.stats.surface_hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.result);
        }
        // The column's surface biome is known and it is not `vanilla`.
        region.mismatch.insert((key, vanilla), true);
        self.stats.mismatch_hits.fetch_add(1, Ordering::Relaxed);
        Some(BiomeResult::unchanged(vanilla))
    }

    /// Stores the final decision for a column and the surface biome it was
    /// computed for. Results that fail the validity predicate are never
    /// cached.
    pub fn put_surface(
        &self,
        pos: ColumnPos,
        surface: BiomeId,
        result: BiomeResult,
        registry: &dyn BiomeRegistry,
    ) {
        if !surface.is_valid()
            || !result.biome.is_valid()
            || registry.key_of(result.biome).is_none()
        {
            return;
        }
        self.region(pos)
            .surface
            .insert(pos.column_key(), SurfaceEntry { surface, result });
    }

    /// Whether `(pos, biome)` is memoized as a surface mismatch.
    pub fn get_mismatch(&self, pos: ColumnPos, biome: BiomeId) -> Option<bool> {
        let hit = self
            .region(pos)
            .mismatch
            .get(&(pos.column_key(), biome))
            .map(|e| *e);
        if hit == Some(true) {
            self.stats.mismatch_hits.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// Memoizes whether `biome` mismatches the surface at `pos`.
    pub fn put_mismatch(&self, pos: ColumnPos, biome: BiomeId, value: bool) {
        self.region(pos)
            .mismatch
            .insert((pos.column_key(), biome), value);
    }

    /// Records `pos` as the center of a known-large component of `biome`.
    pub fn mark_large_area(&self, pos: ColumnPos, biome: BiomeId) {
        self.region(pos)
            .anchors
            .entry(biome)
            .or_default()
            .insert(pack_center(pos.x, pos.z));
    }

    /// Whether a large-area anchor for `biome` covers `pos` (Chebyshev
    /// radius 32, within the position's own region).
    pub fn is_known_large_area(&self, pos: ColumnPos, biome: BiomeId) -> bool {
        let region = self.region(pos);
        let Some(set) = region.anchors.get(&biome) else {
            return false;
        };
        let radius = ANCHOR_RADIUS as i32;
        let lo = pack_center(pos.x.saturating_sub(radius), i32::MIN);
        let hi = pack_center(pos.x.saturating_add(radius), i32::MAX);
        for &packed in set.range(lo..=hi) {
            let (_, cz) = unpack_center(packed);
            if (pos.z.wrapping_sub(cz)).unsigned_abs() <= ANCHOR_RADIUS {
                self.stats.anchor_hits.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        }
        false
    }

    /// Probes the spatial-reuse layer at all three grid alignments, finest
    /// first. Stale entries are removed on the way.
    pub fn get_spatial(&self, pos: ColumnPos, biome: BiomeId) -> Option<SpatialResult> {
        for grid in SPATIAL_GRIDS {
            let center = pos.grid_aligned(grid);
            let region = self.region(center);
            let key = (center, biome);
            let Some(entry) = region.spatial.get(&key).map(|e| *e) else {
                continue;
            };
            if !entry.is_fresh() {
                region.spatial.remove(&key);
                continue;
            }
            if pos.chebyshev(center) <= entry.radius {
                self.stats.spatial_hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry);
            }
        }
        None
    }

    /// Stores a fill outcome for spatial reuse, picking the smallest grid
    /// alignment whose cell still contains the covered radius.
    pub fn put_spatial(
        &self,
        pos: ColumnPos,
        biome: BiomeId,
        is_large: bool,
        replacement: Option<BiomeId>,
        radius: u32,
    ) {
        let grid = SPATIAL_GRIDS
            .into_iter()
            .find(|&g| radius < (g as u32) / 2)
            .unwrap_or(SPATIAL_GRIDS[SPATIAL_GRIDS.len() - 1]);
        let center = pos.grid_aligned(grid);
        self.region(center).spatial.insert(
            (center, biome),
            SpatialResult {
                is_large,
                replacement,
                radius,
                stored_at: Instant::now(),
            },
        );
    }

    /// Dispatcher entry point: returns the task for `key` and whether the
    /// caller became its producer.
    pub fn try_start_fill(&self, key: FillKey) -> (Arc<FillTask>, bool) {
        match self.fills.entry(key) {
            Entry::Occupied(entry) => {
                self.stats.fills_joined.fetch_add(1, Ordering::Relaxed);
                (Arc::clone(entry.get()), false)
            }
            Entry::Vacant(entry) => {
                self.stats.fills_started.fetch_add(1, Ordering::Relaxed);
                let task = Arc::new(FillTask::new());
                entry.insert(Arc::clone(&task));
                (task, true)
            }
        }
    }

    /// Read-only dispatcher lookup.
    pub fn existing_fill(&self, key: FillKey) -> Option<Arc<FillTask>> {
        self.fills.get(&key).map(|e| Arc::clone(e.value()))
    }

    /// Snapshot of the hit/eviction counters.
    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Aggregate structural memory estimate across regions.
    #[must_use]
    pub fn estimated_memory_bytes(&self) -> usize {
        self.regions
            .iter()
            .map(|e| e.value().estimated_bytes())
            .sum()
    }

    /// Drops every region and cancels incomplete fills. Completed fill
    /// results are dropped too; later queries re-dispatch.
    pub fn clear_all(&self) {
        for entry in &self.fills {
            entry.value().cancel();
        }
        self.fills.clear();
        self.regions.clear();
    }

    /// Fetches (creating if needed) the region owning `pos` and touches its
    /// access clock. Occasionally re-checks the memory budget.
    fn region(&self, pos: ColumnPos) -> Arc<Region> {
        let region = self
            .regions
            .entry(pos.region())
            .or_insert_with(|| Arc::new(Region::new()))
            .clone();
        let tick = self.access_clock.fetch_add(1, Ordering::Relaxed) + 1;
        region.last_access.store(tick, Ordering::Relaxed);
        if tick & BUDGET_CHECK_MASK == 0 {
            self.enforce_memory_budget();
        }
        region
    }

    fn column_stripe(pos: ColumnPos) -> usize {
        let mut h = (pos.x as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        h ^= (pos.z as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
        (h >> 16) as usize & (COLUMN_LOCK_STRIPES - 1)
    }

    /// Sheds cache layers, then regions, until back under the budget.
    ///
    /// The LRU region is trimmed layer by layer in a fixed order (spatial,
    /// surface, anchors, mismatch); only if that is not enough is the region
    /// removed. The last region is trimmed but never removed.
    fn enforce_memory_budget(&self) {
        loop {
            let total = self.estimated_memory_bytes();
            if total <= self.max_memory_bytes {
                return;
            }
            let lru = self
                .regions
                .iter()
                .min_by_key(|e| e.value().last_access.load(Ordering::Relaxed))
                .map(|e| (*e.key(), Arc::clone(e.value())));
            let Some((coord, region)) = lru else { return };

            let mut trimmed_enough = false;
            for layer in 0..4u8 {
                match layer {
                    0 => region.spatial.clear(),
                    1 => region.surface.clear(),
                    2 => region.anchors.clear(),
                    _ => region.mismatch.clear(),
                }
                self.stats.layers_evicted.fetch_add(1, Ordering::Relaxed);
                if self.estimated_memory_bytes() <= self.max_memory_bytes {
                    trimmed_enough = true;
                    break;
                }
            }
            if trimmed_enough {
                debug!(region = ?coord, "trimmed region layers to fit memory budget");
                return;
            }
            if self.regions.len() <= 1 {
                // Never evict the last region outright.
                return;
            }
            self.regions.remove(&coord);
            self.stats.regions_evicted.fetch_add(1, Ordering::Relaxed);
            debug!(region = ?coord, "evicted region");
        }
    }
}
