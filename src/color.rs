//! Color model (spec §3).
//!
//! `Color` is a tagged variant; converting it to an `(r, g, b)` triple is
//! total for `Hue`/`Rgb` and fallible only for `Preset`, which requires a
//! lookup table supplied by config (spec §6's named preset list).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ColorError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Color {
    /// Hue in degrees, `0..360`. Full saturation and value.
    Hue { h: u16 },
    Rgb { r: u8, g: u8, b: u8 },
    Preset { name: String },
}

impl Color {
    pub fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self::Rgb { r, g, b }
    }

    pub fn hue(h: u16) -> Self {
        Self::Hue { h: h % 360 }
    }

    /// Resolves this color to an `(r, g, b)` triple. `Preset` variants are
    /// looked up in `presets`; everything else is a total conversion.
    pub fn to_rgb(&self, presets: &PresetTable) -> Result<(u8, u8, u8), ColorError> {
        match self {
            Self::Rgb { r, g, b } => Ok((*r, *g, *b)),
            Self::Hue { h } => Ok(hue_to_rgb(*h)),
            Self::Preset { name } => presets
                .get(name)
                .copied()
                .ok_or_else(|| ColorError::UnknownPreset(name.clone())),
        }
    }
}

/// `HSV(h, 1.0, 1.0) -> RGB`, hue taken mod 360.
fn hue_to_rgb(h: u16) -> (u8, u8, u8) {
    let h = f64::from(h % 360);
    let c = 255.0;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let (r, g, b) = match h as u32 {
        0..=59 => (c, x, 0.0),
        60..=119 => (x, c, 0.0),
        120..=179 => (0.0, c, x),
        180..=239 => (0.0, x, c),
        240..=299 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    (r.round() as u8, g.round() as u8, b.round() as u8)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresetCategory {
    Basic,
    Warm,
    Cool,
    White,
    Natural,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColorPresetConfig {
    pub name: String,
    pub rgb: (u8, u8, u8),
    pub category: PresetCategory,
}

/// Lookup table built from `StaticConfig`'s preset list (spec §6). The only
/// component allowed to resolve `Color::Preset` names is whoever holds one of
/// these; nothing in this crate builds one except from `StaticConfig`.
#[derive(Debug, Clone, Default)]
pub struct PresetTable(HashMap<String, (u8, u8, u8)>);

impl PresetTable {
    pub fn from_configs(presets: &[ColorPresetConfig]) -> Self {
        Self(
            presets
                .iter()
                .map(|p| (p.name.clone(), p.rgb))
                .collect(),
        )
    }

    pub fn get(&self, name: &str) -> Option<(u8, u8, u8)> {
        self.0.get(name).copied()
    }
}

/// Applies per-zone brightness (`0..100`) to a pixel. Spec §4.5.3 step 6:
/// "integer multiply then shift; gamma is out of scope".
pub fn scale_brightness(pixel: (u8, u8, u8), brightness: u8) -> (u8, u8, u8) {
    let b = u16::from(brightness.min(100));
    let scale = |c: u8| -> u8 { ((u16::from(c) * b) / 100) as u8 };
    (scale(pixel.0), scale(pixel.1), scale(pixel.2))
}
