//! Opaque biome identity.

use serde::{Deserialize, Serialize};

/// Opaque identifier for a biome.
///
/// The engine only ever compares these for equality, hashes them, and asks
/// the host's registry whether they resolve to a stable key. It never
/// interprets the raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BiomeId(u32);

impl BiomeId {
    /// Null/invalid biome. Samplers return this to signal a fault.
    pub const NULL: Self = Self(0);

    /// Creates a biome ID from a raw registry value.
    #[must_use]
    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw registry value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Checks this is a non-null biome ID.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}
