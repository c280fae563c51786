//! Static configuration shapes (spec §6). Loading these from YAML/JSON is
//! an explicit Non-goal (spec §1) owned by an external collaborator; this
//! module only defines what a loaded config looks like, so the rest of the
//! crate can depend on `StaticConfig` without caring how one was produced
//! (mirrors the teacher's `comms` crate depending on `log_types::DataMsg`'s
//! shape without owning its construction).

use std::collections::HashMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::color::ColorPresetConfig;
use crate::error::ConfigError;
use crate::ids::{AnimationId, ParameterId, StripId, ZoneId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub id: ZoneId,
    pub display_name: String,
    pub pixel_count: usize,
    pub gpio_pin: u8,
    pub strip: StripId,
    pub pixel_index_range: Range<usize>,
    pub layout: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    Float,
    Int,
    Bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub id: ParameterId,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub min: f64,
    pub max: f64,
    pub default: f64,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnimationConfigEntry {
    pub id: AnimationId,
    pub display_name: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub fps_target: u32,
    pub hardware_min_frame_ms: f64,
    pub state_debounce_ms: u64,
    pub shutdown_global_timeout_ms: u64,
    pub shutdown_per_handler_timeout_ms: u64,
    pub api_port: u16,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            fps_target: 60,
            hardware_min_frame_ms: 2.75,
            state_debounce_ms: 200,
            shutdown_global_timeout_ms: 15_000,
            shutdown_per_handler_timeout_ms: 5_000,
            api_port: 8787,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticConfig {
    pub zones: Vec<ZoneConfig>,
    pub presets: Vec<ColorPresetConfig>,
    pub animations: Vec<AnimationConfigEntry>,
    pub system: SystemConfig,
}

impl StaticConfig {
    /// Validates the zone-range invariants from spec §3: per strip, zone
    /// pixel ranges are mutually disjoint and their union is a prefix of
    /// the strip's buffer.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut by_strip: HashMap<StripId, Vec<&ZoneConfig>> = HashMap::new();
        for zone in &self.zones {
            if zone.pixel_count == 0 {
                return Err(ConfigError::EmptyZone(zone.id.clone()));
            }
            by_strip.entry(zone.strip.clone()).or_default().push(zone);
        }

        for (strip, mut zones) in by_strip {
            zones.sort_by_key(|z| z.pixel_index_range.start);
            let mut expected_start = 0usize;
            for zone in &zones {
                if zone.pixel_index_range.start != expected_start {
                    if zone.pixel_index_range.start < expected_start {
                        return Err(ConfigError::OverlappingZoneRange {
                            zone: zone.id.clone(),
                            strip: strip.to_string(),
                            range: zone.pixel_index_range.clone(),
                        });
                    }
                    return Err(ConfigError::NonPrefixCoverage {
                        strip: strip.to_string(),
                    });
                }
                expected_start = zone.pixel_index_range.end;
            }
        }
        Ok(())
    }

    pub fn zone(&self, id: &ZoneId) -> Option<&ZoneConfig> {
        self.zones.iter().find(|z| &z.id == id)
    }

    pub fn animation(&self, id: &AnimationId) -> Option<&AnimationConfigEntry> {
        self.animations.iter().find(|a| &a.id == id)
    }

    pub fn strip_len(&self, strip: &StripId) -> usize {
        self.zones
            .iter()
            .filter(|z| &z.strip == strip)
            .map(|z| z.pixel_index_range.end)
            .max()
            .unwrap_or(0)
    }

    pub fn strips(&self) -> Vec<StripId> {
        let mut out = Vec::new();
        for z in &self.zones {
            if !out.contains(&z.strip) {
                out.push(z.strip.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(id: &str, strip: &str, range: Range<usize>) -> ZoneConfig {
        ZoneConfig {
            id: id.into(),
            display_name: id.to_string(),
            pixel_count: range.len(),
            gpio_pin: 18,
            strip: strip.into(),
            pixel_index_range: range,
            layout: None,
        }
    }

    #[test]
    fn disjoint_prefix_ranges_validate() {
        let cfg = StaticConfig {
            zones: vec![zone("z1", "s1", 0..10), zone("z2", "s1", 10..20)],
            presets: vec![],
            animations: vec![],
            system: SystemConfig::default(),
        };
        cfg.validate().unwrap();
    }

    #[test]
    fn gap_is_rejected() {
        let cfg = StaticConfig {
            zones: vec![zone("z1", "s1", 0..10), zone("z2", "s1", 15..20)],
            presets: vec![],
            animations: vec![],
            system: SystemConfig::default(),
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::NonPrefixCoverage { .. })
        ));
    }

    #[test]
    fn overlap_is_rejected() {
        let cfg = StaticConfig {
            zones: vec![zone("z1", "s1", 0..10), zone("z2", "s1", 5..20)],
            presets: vec![],
            animations: vec![],
            system: SystemConfig::default(),
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::OverlappingZoneRange { .. })
        ));
    }
}
