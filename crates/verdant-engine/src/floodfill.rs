//! Collaborative flood fill over the surface-biome graph.
//!
//! Fills run in biome-cell coordinates from a seed column, bounded by the
//! configured micro threshold. Concurrent queries for the same
//! `(x, z, biome)` fingerprint share a single [`FillTask`]: one producer
//! runs the BFS, everyone else awaits its completion barrier.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashSet;
use parking_lot::{Condvar, Mutex};
use tracing::debug;
use verdant_common::{BiomeId, CellPos, ColumnPos};

use crate::config::SmootherConfig;
use crate::heightmap::HeightmapCache;
use crate::smoother::surface_biome;
use crate::sources::{BiomeRegistry, BiomeSampler};

/// Deadline for non-producer waiters.
pub const FILL_WAIT: Duration = Duration::from_secs(5);

/// Spatial-reuse radius recorded for large components.
pub(crate) const LARGE_SPATIAL_RADIUS: u32 = 128;

/// Fingerprint coalescing concurrent fills: the seed column plus the target
/// surface biome. The biome is part of the key because one column can seed
/// fills for distinct biomes over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FillKey {
    /// Seed block X
    pub x: i32,
    /// Seed block Z
    pub z: i32,
    /// Target surface biome
    pub biome: BiomeId,
}

/// Immutable result of one completed fill.
#[derive(Debug, Clone)]
pub struct FillOutcome {
    /// Cells of the micro component, in discovery order. Empty for large
    /// components (the fill bails out before enumerating them).
    pub cells: Vec<CellPos>,
    /// Whether the component exceeded the micro threshold.
    pub is_large: bool,
    /// Dominant perimeter biome for micro components.
    pub replacement: Option<BiomeId>,
}

impl FillOutcome {
    fn large() -> Self {
        Self {
            cells: Vec::new(),
            is_large: true,
            replacement: None,
        }
    }
}

enum TaskState {
    Pending,
    Cancelled,
    Done(Arc<FillOutcome>),
}

/// Shared completion barrier for one dispatched fill.
///
/// Exactly one thread (the producer) calls [`FillTask::complete`]; any
/// number of waiters block on [`FillTask::wait`] with a deadline. Completed
/// tasks stay in the dispatcher map so later queries read the result
/// without re-running the fill.
pub struct FillTask {
    state: Mutex<TaskState>,
    done: Condvar,
}

impl FillTask {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TaskState::Pending),
            done: Condvar::new(),
        }
    }

    /// Publishes the outcome and wakes every waiter. Later calls (or calls
    /// after cancellation) are ignored.
    pub fn complete(&self, outcome: Arc<FillOutcome>) {
        let mut state = self.state.lock();
        if matches!(*state, TaskState::Pending) {
            *state = TaskState::Done(outcome);
            self.done.notify_all();
        }
    }

    /// Cancels a pending task; waiters return `None`.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        if matches!(*state, TaskState::Pending) {
            *state = TaskState::Cancelled;
            self.done.notify_all();
        }
    }

    /// Blocks until the task completes, is cancelled, or `timeout` elapses.
    /// Timing out does not cancel the producer.
    pub fn wait(&self, timeout: Duration) -> Option<Arc<FillOutcome>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            match &*state {
                TaskState::Done(outcome) => return Some(Arc::clone(outcome)),
                TaskState::Cancelled => return None,
                TaskState::Pending => {
                    if self.done.wait_until(&mut state, deadline).timed_out() {
                        return match &*state {
                            TaskState::Done(outcome) => Some(Arc::clone(outcome)),
                            _ => None,
                        };
                    }
                }
            }
        }
    }

    /// Non-blocking result peek.
    #[must_use]
    pub fn result(&self) -> Option<Arc<FillOutcome>> {
        match &*self.state.lock() {
            TaskState::Done(outcome) => Some(Arc::clone(outcome)),
            _ => None,
        }
    }
}

/// Bounded BFS over same-biome surface cells.
pub struct FloodFiller<'a> {
    sampler: &'a dyn BiomeSampler,
    heightmap: &'a HeightmapCache,
    config: &'a SmootherConfig,
    registry: &'a dyn BiomeRegistry,
}

impl<'a> FloodFiller<'a> {
    /// Creates a filler borrowing the engine's collaborators.
    #[must_use]
    pub fn new(
        sampler: &'a dyn BiomeSampler,
        heightmap: &'a HeightmapCache,
        config: &'a SmootherConfig,
        registry: &'a dyn BiomeRegistry,
    ) -> Self {
        Self {
            sampler,
            heightmap,
            config,
            registry,
        }
    }

    /// Runs the fill from `seed` for `target`.
    ///
    /// Deterministic: neighbor order is fixed and the bailout heuristics
    /// depend only on `(|V|, |Q|, T)`, so the same sampler, threshold, and
    /// seed always produce the same outcome.
    pub fn run(&self, seed: ColumnPos, target: BiomeId) -> FillOutcome {
        let threshold = self.config.cell_threshold();
        let seed_cell = seed.cell();

        let mut visited: AHashSet<CellPos> = AHashSet::new();
        let mut order: Vec<CellPos> = Vec::new();
        let mut queue: VecDeque<CellPos> = VecDeque::new();
        visited.insert(seed_cell);
        order.push(seed_cell);
        queue.push_back(seed_cell);

        while let Some(cell) = queue.pop_front() {
            for neighbor in cell.neighbors() {
                if visited.contains(&neighbor) {
                    continue;
                }
                if self.cell_surface_biome(neighbor) != target {
                    continue;
                }
                visited.insert(neighbor);
                order.push(neighbor);
                queue.push_back(neighbor);

                if bails_out(visited.len(), queue.len(), threshold) {
                    return FillOutcome::large();
                }
            }
        }

        let replacement = self.dominant_neighbor(&order, &visited, target);
        match replacement {
            Some(biome) => FillOutcome {
                cells: order,
                is_large: false,
                replacement: Some(biome),
            },
            None => {
                // No eligible perimeter biome at all. Returning the target
                // would be a self-replacement, so keep the component as-is.
                debug!(
                    seed = ?seed,
                    cells = order.len(),
                    "degenerate micro component has no replacement candidate"
                );
                FillOutcome::large()
            }
        }
    }

    /// Surface biome at a cell's origin column.
    fn cell_surface_biome(&self, cell: CellPos) -> BiomeId {
        let block = cell.block();
        let surface_y = self.heightmap.height(block.x, block.z);
        surface_biome(self.sampler, self.config, block, surface_y)
    }

    /// Picks the dominant biome on the component's 4-cardinal perimeter.
    ///
    /// Votes are tallied in discovery order; ties keep the first-encountered
    /// biome. Replacement-excluded biomes only win if no eligible candidate
    /// got a vote. The target itself never wins.
    fn dominant_neighbor(
        &self,
        order: &[CellPos],
        visited: &AHashSet<CellPos>,
        target: BiomeId,
    ) -> Option<BiomeId> {
        let first = order.first()?;
        let anchor = first.block();
        // One shared height estimate for the whole perimeter; the
        // perturbation is a pure function of the anchor column, so repeated
        // votes stay stable while degenerate plateaus still break ties.
        let perturbation =
            (anchor.x.rem_euclid(8) - 4).abs() + (anchor.z.rem_euclid(8) - 4).abs();
        let estimate_y = self.heightmap.height(anchor.x, anchor.z) + perturbation;

        let mut seen: AHashSet<CellPos> = AHashSet::new();
        let mut all_votes: Vec<(BiomeId, u32)> = Vec::new();
        let mut eligible_votes: Vec<(BiomeId, u32)> = Vec::new();

        for cell in order {
            for neighbor in cell.neighbors() {
                if visited.contains(&neighbor) || !seen.insert(neighbor) {
                    continue;
                }
                let biome =
                    surface_biome(self.sampler, self.config, neighbor.block(), estimate_y);
                if biome == target || !self.config.is_wellformed(biome, self.registry) {
                    continue;
                }
                bump_vote(&mut all_votes, biome);
                if self.config.is_replacement_candidate(biome, self.registry) {
                    bump_vote(&mut eligible_votes, biome);
                }
            }
        }

        leading_vote(&eligible_votes).or_else(|| leading_vote(&all_votes))
    }
}

/// Bailout heuristics, checked after every cell insertion.
///
/// `visited > T` is the hard limit; the other two cut off fills whose
/// frontier makes exceeding it inevitable.
fn bails_out(visited: usize, queued: usize, threshold: usize) -> bool {
    if visited > threshold {
        return true;
    }
    // |V| > 0.8·T and |Q| > 0.5·T: the frontier is still expanding.
    if visited * 5 > threshold * 4 && queued * 2 > threshold {
        return true;
    }
    // |V| > 0.95·T and |Q| > |V|: overflow right at the threshold.
    visited * 20 > threshold * 19 && queued > visited
}

fn bump_vote(votes: &mut Vec<(BiomeId, u32)>, biome: BiomeId) {
    if let Some(entry) = votes.iter_mut().find(|(b, _)| *b == biome) {
        entry.1 += 1;
    } else {
        votes.push((biome, 1));
    }
}

/// First-encountered maximum of a tally.
fn leading_vote(votes: &[(BiomeId, u32)]) -> Option<BiomeId> {
    let mut best: Option<(BiomeId, u32)> = None;
    for &(biome, count) in votes {
        if best.map_or(true, |(_, best_count)| count > best_count) {
            best = Some((biome, count));
        }
    }
    best.map(|(biome, _)| biome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::NoopTelemetry;
    use std::thread;

    const FOREST: BiomeId = BiomeId::from_raw(1);
    const PLAINS: BiomeId = BiomeId::from_raw(2);
    const SWAMP: BiomeId = BiomeId::from_raw(3);

    fn registry(biome: BiomeId) -> Option<&'static str> {
        match biome.raw() {
            1 => Some("test:forest"),
            2 => Some("test:plains"),
            3 => Some("test:swamp"),
            _ => None,
        }
    }

    fn flat_heightmap() -> HeightmapCache {
        HeightmapCache::new(
            Arc::new(|_: i32, _: i32| Some(64)),
            16,
            Arc::new(NoopTelemetry),
        )
    }

    fn config_with_threshold(blocks: u32) -> SmootherConfig {
        SmootherConfig {
            micro_biome_threshold: blocks,
            ..SmootherConfig::default()
        }
        .validated()
    }

    #[test]
    fn test_task_completion_wakes_waiters() {
        let task = Arc::new(FillTask::new());
        let waiter = Arc::clone(&task);
        let handle = thread::spawn(move || waiter.wait(Duration::from_secs(5)));
        task.complete(Arc::new(FillOutcome::large()));
        let outcome = handle.join().unwrap().expect("task completed");
        assert!(outcome.is_large);
        assert!(task.result().is_some());
    }

    #[test]
    fn test_task_wait_times_out() {
        let task = FillTask::new();
        assert!(task.wait(Duration::from_millis(10)).is_none());
        // A late completion still lands for future readers.
        task.complete(Arc::new(FillOutcome::large()));
        assert!(task.result().is_some());
    }

    #[test]
    fn test_task_cancel_releases_waiters() {
        let task = Arc::new(FillTask::new());
        let waiter = Arc::clone(&task);
        let handle = thread::spawn(move || waiter.wait(Duration::from_secs(5)));
        task.cancel();
        assert!(handle.join().unwrap().is_none());
        // Completion after cancel is ignored.
        task.complete(Arc::new(FillOutcome::large()));
        assert!(task.result().is_none());
    }

    #[test]
    fn test_isolated_cell_is_micro() {
        let heightmap = flat_heightmap();
        let config = config_with_threshold(50);
        let sampler = |nx: i32, _: i32, nz: i32| {
            if nx == 0 && nz == 0 {
                FOREST
            } else {
                PLAINS
            }
        };
        let filler = FloodFiller::new(&sampler, &heightmap, &config, &registry);
        let outcome = filler.run(ColumnPos::new(0, 0), FOREST);

        assert!(!outcome.is_large);
        assert_eq!(outcome.cells, vec![CellPos::new(0, 0)]);
        assert_eq!(outcome.replacement, Some(PLAINS));
    }

    #[test]
    fn test_component_at_threshold_stays_micro() {
        let heightmap = flat_heightmap();
        let config = config_with_threshold(50); // T = 3 cells
        let sampler = |nx: i32, _: i32, nz: i32| {
            if nz == 0 && (0..3).contains(&nx) {
                FOREST
            } else {
                PLAINS
            }
        };
        let filler = FloodFiller::new(&sampler, &heightmap, &config, &registry);
        let outcome = filler.run(ColumnPos::new(0, 0), FOREST);

        assert!(!outcome.is_large);
        assert_eq!(outcome.cells.len(), 3);
        assert_eq!(outcome.replacement, Some(PLAINS));
    }

    #[test]
    fn test_large_disk_bails_out() {
        let heightmap = flat_heightmap();
        let config = config_with_threshold(50);
        let sampler = |nx: i32, _: i32, nz: i32| {
            if nx * nx + nz * nz < 10_000 {
                FOREST
            } else {
                PLAINS
            }
        };
        let filler = FloodFiller::new(&sampler, &heightmap, &config, &registry);
        let outcome = filler.run(ColumnPos::new(100, 100), FOREST);

        assert!(outcome.is_large);
        assert!(outcome.cells.is_empty());
        assert_eq!(outcome.replacement, None);
    }

    #[test]
    fn test_fill_is_deterministic() {
        let heightmap = flat_heightmap();
        let config = config_with_threshold(100);
        // An L-shaped component with a mixed perimeter.
        let sampler = |nx: i32, _: i32, nz: i32| match (nx, nz) {
            (0, 0) | (1, 0) | (1, 1) => FOREST,
            (2, 0) | (2, 1) => SWAMP,
            _ => PLAINS,
        };
        let filler = FloodFiller::new(&sampler, &heightmap, &config, &registry);
        let first = filler.run(ColumnPos::new(0, 0), FOREST);
        let second = filler.run(ColumnPos::new(0, 0), FOREST);

        assert_eq!(first.cells, second.cells);
        assert_eq!(first.replacement, second.replacement);
        // Plains surrounds more of the perimeter than swamp.
        assert_eq!(first.replacement, Some(PLAINS));
    }

    #[test]
    fn test_excluded_biome_only_wins_as_fallback() {
        let heightmap = flat_heightmap();
        let mut config = config_with_threshold(50);
        config.excluded_as_replacement.insert(PLAINS);

        // Perimeter is mostly plains with one swamp cell.
        let sampler = |nx: i32, _: i32, nz: i32| match (nx, nz) {
            (0, 0) => FOREST,
            (1, 0) => SWAMP,
            _ => PLAINS,
        };
        let filler = FloodFiller::new(&sampler, &heightmap, &config, &registry);
        let outcome = filler.run(ColumnPos::new(0, 0), FOREST);
        // Swamp is the only eligible candidate despite fewer votes.
        assert_eq!(outcome.replacement, Some(SWAMP));

        // With swamp excluded too, the vote falls back to raw counts.
        config.excluded_as_replacement.insert(SWAMP);
        let filler = FloodFiller::new(&sampler, &heightmap, &config, &registry);
        let outcome = filler.run(ColumnPos::new(0, 0), FOREST);
        assert_eq!(outcome.replacement, Some(PLAINS));
    }

    #[test]
    fn test_component_without_candidates_is_degenerate() {
        let heightmap = flat_heightmap();
        let config = config_with_threshold(50);
        // The BFS (scanning from the real surface, biome-y 16) sees plains
        // around the island, but the vote's perturbed height estimate lands
        // on layers where the sampler cannot answer. No vote survives.
        let sampler = |nx: i32, ny: i32, nz: i32| {
            if nx == 0 && nz == 0 {
                FOREST
            } else if ny == 16 {
                PLAINS
            } else {
                BiomeId::NULL
            }
        };
        let filler = FloodFiller::new(&sampler, &heightmap, &config, &registry);
        let outcome = filler.run(ColumnPos::new(0, 0), FOREST);

        // Never replace a biome with itself (or with nothing); the
        // component is kept as-is.
        assert!(outcome.is_large);
        assert_eq!(outcome.replacement, None);
    }

    #[test]
    fn test_bailout_heuristics() {
        // Hard limit.
        assert!(bails_out(4, 0, 3));
        assert!(!bails_out(3, 0, 3));
        // Expanding frontier: |V| > 0.8T and |Q| > 0.5T.
        assert!(bails_out(17, 11, 20));
        assert!(!bails_out(16, 11, 20));
        assert!(!bails_out(17, 10, 20));
        // At the threshold with a drained queue the fill is allowed to
        // finish as micro.
        assert!(!bails_out(20, 1, 20));
    }
}
