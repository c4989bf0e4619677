//! Fault taxonomy for the smoothing engine.
//!
//! The public entry point never surfaces these: every fault is absorbed and
//! the vanilla biome returned. The taxonomy exists so internal plumbing can
//! propagate with `?` and so telemetry/rate-limited logging can classify
//! what went wrong.

use thiserror::Error;

/// Internal fault raised somewhere in the smoothing pipeline.
#[derive(Debug, Error)]
pub enum SmoothError {
    /// Inputs out of range or a missing collaborator.
    #[error("invalid input: {0}")]
    Validation(String),

    /// The biome sampler returned an unresolvable id.
    #[error("sampler returned an invalid biome at cell ({x}, {y}, {z})")]
    Sampler {
        /// Biome-grid X
        x: i32,
        /// Biome-grid Y
        y: i32,
        /// Biome-grid Z
        z: i32,
    },

    /// The surface height source failed for a column.
    #[error("surface height unavailable at ({x}, {z})")]
    Height {
        /// Block X
        x: i32,
        /// Block Z
        z: i32,
    },

    /// A flood-fill waiter exceeded its deadline.
    #[error("flood fill timed out after {0:?}")]
    FillTimeout(std::time::Duration),

    /// A cached result failed the validity predicate on read.
    #[error("cached biome result failed validation")]
    CacheValidity,
}

impl SmoothError {
    /// Classifies the fault for rate-limited logging and telemetry.
    #[must_use]
    pub const fn kind(&self) -> FaultKind {
        match self {
            Self::Validation(_) => FaultKind::Validation,
            Self::Sampler { .. } => FaultKind::Sampler,
            Self::Height { .. } => FaultKind::Height,
            Self::FillTimeout(_) => FaultKind::FillTimeout,
            Self::CacheValidity => FaultKind::CacheValidity,
        }
    }
}

/// Fault class, used as an index into rate-limiter slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum FaultKind {
    /// Out-of-range input or missing collaborator
    Validation = 0,
    /// Sampler returned an invalid biome
    Sampler = 1,
    /// Height source failed
    Height = 2,
    /// Flood-fill waiter deadline exceeded
    FillTimeout = 3,
    /// Cached entry failed validation
    CacheValidity = 4,
}

impl FaultKind {
    /// Number of fault classes.
    pub const COUNT: usize = 5;

    /// Short label for log lines.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Sampler => "sampler",
            Self::Height => "height",
            Self::FillTimeout => "fill-timeout",
            Self::CacheValidity => "cache-validity",
        }
    }
}

/// Result type alias for internal engine operations.
pub type SmoothResult<T> = Result<T, SmoothError>;
