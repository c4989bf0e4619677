//! Engine configuration and the biome predicates derived from it.

use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use verdant_common::BiomeId;

use crate::sources::BiomeRegistry;

/// Identifier substrings matched by the village-class preservation policy.
const VILLAGE_CLASS_KEYWORDS: [&str; 5] = ["plains", "desert", "savanna", "taiga", "snowy"];

/// Smoothing engine configuration.
///
/// Hosts embed this in their own config files (all fields serde-friendly);
/// the engine clamps out-of-range values through [`SmootherConfig::validated`]
/// at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmootherConfig {
    /// Master switch; when false every query returns the vanilla biome.
    pub enabled: bool,
    /// Connected components at or below this many blocks are micro biomes.
    /// Divided by 16 for the biome-cell fills. Range 10–1000.
    pub micro_biome_threshold: u32,
    /// Aggregate region-cache memory budget in MiB.
    pub max_cache_memory_mb: u32,
    /// Heightmap sample spacing in blocks; must divide 16.
    pub grid_spacing: u32,
    /// Biomes never replaced, regardless of component size.
    pub preserved_biomes: AHashSet<BiomeId>,
    /// Biomes never chosen as a replacement (first-pass vote exclusion).
    pub excluded_as_replacement: AHashSet<BiomeId>,
    /// Underground biomes skipped by surface projection.
    pub cave_biomes: AHashSet<BiomeId>,
    /// Also preserve biomes whose identifier contains a village-class
    /// keyword (`plains`, `desert`, `savanna`, `taiga`, `snowy`).
    pub preserve_village_class: bool,
    /// Emit a replacement event for every substituted micro biome.
    pub debug: bool,
    /// Emit per-section timings to the telemetry sink.
    pub performance_logging: bool,
}

impl Default for SmootherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            micro_biome_threshold: 50,
            max_cache_memory_mb: 512,
            grid_spacing: 16,
            preserved_biomes: AHashSet::new(),
            excluded_as_replacement: AHashSet::new(),
            cave_biomes: AHashSet::new(),
            preserve_village_class: false,
            debug: false,
            performance_logging: false,
        }
    }
}

impl SmootherConfig {
    /// Returns a copy with every numeric field clamped to its valid range.
    ///
    /// `micro_biome_threshold` is clamped to 10–1000, `grid_spacing` to the
    /// nearest divisor of 16 at or below the configured value, and the
    /// memory budget to at least 1 MiB.
    #[must_use]
    pub fn validated(mut self) -> Self {
        self.micro_biome_threshold = self.micro_biome_threshold.clamp(10, 1000);
        self.max_cache_memory_mb = self.max_cache_memory_mb.max(1);
        self.grid_spacing = match self.grid_spacing {
            0..=1 => 1,
            2..=3 => 2,
            4..=7 => 4,
            8..=15 => 8,
            _ => 16,
        };
        self
    }

    /// Micro cutoff in biome cells: `micro_biome_threshold / 16`, at least 1.
    #[must_use]
    pub fn cell_threshold(&self) -> usize {
        ((self.micro_biome_threshold / 16) as usize).max(1)
    }

    /// Whether `biome` must pass through unmodified.
    pub fn is_preserved(&self, biome: BiomeId, registry: &dyn BiomeRegistry) -> bool {
        if self.preserved_biomes.contains(&biome) {
            return true;
        }
        if self.preserve_village_class {
            if let Some(key) = registry.key_of(biome) {
                return VILLAGE_CLASS_KEYWORDS.iter().any(|kw| key.contains(kw));
            }
        }
        false
    }

    /// Whether `biome` is configured as underground (skipped by surface
    /// projection).
    #[must_use]
    pub fn is_cave(&self, biome: BiomeId) -> bool {
        self.cave_biomes.contains(&biome)
    }

    /// Whether `biome` may be handed back to the host at all: non-null and
    /// still bound to a registry identifier.
    pub fn is_wellformed(&self, biome: BiomeId, registry: &dyn BiomeRegistry) -> bool {
        biome.is_valid() && registry.key_of(biome).is_some()
    }

    /// Whether `biome` is eligible as a replacement in the first voting
    /// pass: well-formed and not excluded.
    pub fn is_replacement_candidate(&self, biome: BiomeId, registry: &dyn BiomeRegistry) -> bool {
        self.is_wellformed(biome, registry) && !self.excluded_as_replacement.contains(&biome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(biome: BiomeId) -> Option<&'static str> {
        match biome.raw() {
            1 => Some("verdant:sunflower_plains"),
            2 => Some("verdant:dark_forest"),
            3 => Some("verdant:snowy_slopes"),
            _ => None,
        }
    }

    #[test]
    fn test_defaults() {
        let config = SmootherConfig::default();
        assert!(config.enabled);
        assert_eq!(config.micro_biome_threshold, 50);
        assert_eq!(config.cell_threshold(), 3);
    }

    #[test]
    fn test_validated_clamps_ranges() {
        let config = SmootherConfig {
            micro_biome_threshold: 4,
            grid_spacing: 12,
            max_cache_memory_mb: 0,
            ..SmootherConfig::default()
        }
        .validated();
        assert_eq!(config.micro_biome_threshold, 10);
        assert_eq!(config.grid_spacing, 8);
        assert_eq!(config.max_cache_memory_mb, 1);

        let config = SmootherConfig {
            micro_biome_threshold: 5000,
            grid_spacing: 64,
            ..SmootherConfig::default()
        }
        .validated();
        assert_eq!(config.micro_biome_threshold, 1000);
        assert_eq!(config.grid_spacing, 16);
    }

    #[test]
    fn test_cell_threshold_floor_is_one() {
        let config = SmootherConfig {
            micro_biome_threshold: 10,
            ..SmootherConfig::default()
        };
        assert_eq!(config.cell_threshold(), 1);
    }

    #[test]
    fn test_village_class_preservation() {
        let mut config = SmootherConfig::default();
        let plains = BiomeId::from_raw(1);
        let forest = BiomeId::from_raw(2);
        let snowy = BiomeId::from_raw(3);

        assert!(!config.is_preserved(plains, &registry));
        config.preserve_village_class = true;
        assert!(config.is_preserved(plains, &registry));
        assert!(config.is_preserved(snowy, &registry));
        assert!(!config.is_preserved(forest, &registry));
    }

    #[test]
    fn test_replacement_candidate_excludes_configured_and_unbound() {
        let mut config = SmootherConfig::default();
        let forest = BiomeId::from_raw(2);
        let unbound = BiomeId::from_raw(99);

        assert!(config.is_replacement_candidate(forest, &registry));
        assert!(!config.is_replacement_candidate(unbound, &registry));
        assert!(!config.is_replacement_candidate(BiomeId::NULL, &registry));

        config.excluded_as_replacement.insert(forest);
        assert!(!config.is_replacement_candidate(forest, &registry));
        // Exclusion is first-pass only; the biome itself is still well-formed.
        assert!(config.is_wellformed(forest, &registry));
    }
}
