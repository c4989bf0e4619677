//! Telemetry hooks and rate-limited fault logging.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::warn;
use verdant_common::{BiomeId, FaultKind, SmoothError};

/// Emitted when a micro biome is replaced (only with `debug` enabled).
#[derive(Debug, Clone, Copy)]
pub struct ReplacementEvent {
    /// Query block X
    pub x: i32,
    /// Query block Y
    pub y: i32,
    /// Query block Z
    pub z: i32,
    /// The biome that was replaced
    pub from: BiomeId,
    /// The dominant neighbor chosen instead
    pub to: BiomeId,
    /// Size of the micro component in biome cells
    pub region_cells: usize,
}

/// Pipeline sections reported to the performance sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerfSection {
    /// Surface height lookup plus the upward biome scan
    SurfaceProjection,
    /// Layered cache probes for one query
    CacheProbe,
    /// A full flood fill run by a producer
    FloodFill,
}

/// Host-provided observer. All methods default to no-ops so sinks implement
/// only what they consume.
pub trait TelemetrySink: Send + Sync {
    /// A micro biome was substituted.
    fn replacement(&self, event: &ReplacementEvent) {
        let _ = event;
    }

    /// A pipeline section completed (only with `performance_logging`).
    fn timing(&self, section: PerfSection, elapsed: Duration) {
        let _ = (section, elapsed);
    }

    /// A recoverable fault was absorbed.
    fn fault(&self, kind: FaultKind) {
        let _ = kind;
    }
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {}

/// Rate limiter for fault logging: at most one `warn!` per fault class per
/// interval. Faults are always forwarded to the sink; only the log line is
/// limited.
pub struct FaultLimiter {
    /// Nanoseconds (since `epoch`) of the last log per fault class; 0 means
    /// never logged.
    last_logged: [AtomicU64; FaultKind::COUNT],
    interval: Duration,
    epoch: Instant,
}

impl FaultLimiter {
    /// Default spacing between log lines of the same class.
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

    /// Creates a limiter with the given per-class interval.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: Default::default(),
            interval,
            epoch: Instant::now(),
        }
    }

    /// Records an absorbed fault: forwards it to `sink` and emits at most
    /// one rate-limited `warn!` per class per interval.
    pub fn report(&self, error: &SmoothError, sink: &dyn TelemetrySink) {
        let kind = error.kind();
        sink.fault(kind);
        if self.should_log(kind) {
            warn!(fault = kind.label(), "absorbed smoothing fault: {error}");
        }
    }

    fn should_log(&self, kind: FaultKind) -> bool {
        // +1 so the very first fault (slot value 0) always logs.
        let now = self.epoch.elapsed().as_nanos() as u64 + 1;
        let interval = self.interval.as_nanos() as u64;
        let slot = &self.last_logged[kind as usize];
        let prev = slot.load(Ordering::Relaxed);
        if prev != 0 && now.saturating_sub(prev) < interval {
            return false;
        }
        slot.compare_exchange(prev, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

impl Default for FaultLimiter {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingSink {
        faults: AtomicUsize,
    }

    impl TelemetrySink for CountingSink {
        fn fault(&self, _kind: FaultKind) {
            self.faults.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_faults_always_reach_sink() {
        let limiter = FaultLimiter::default();
        let sink = CountingSink::default();
        for _ in 0..5 {
            limiter.report(&SmoothError::CacheValidity, &sink);
        }
        assert_eq!(sink.faults.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_log_rate_limited_per_class() {
        let limiter = FaultLimiter::new(Duration::from_secs(60));
        assert!(limiter.should_log(FaultKind::Sampler));
        assert!(!limiter.should_log(FaultKind::Sampler));
        // Other classes have their own slots.
        assert!(limiter.should_log(FaultKind::Height));
    }

    #[test]
    fn test_log_allowed_after_interval() {
        let limiter = FaultLimiter::new(Duration::ZERO);
        assert!(limiter.should_log(FaultKind::Validation));
        assert!(limiter.should_log(FaultKind::Validation));
    }
}
