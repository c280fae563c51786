//! Zone state (spec §3). `ZoneConfig` (immutable, from `StaticConfig`) and
//! `ZoneState` (mutable, owned exclusively by the Zone Service) are kept
//! separate; `ZoneCombined` is the read-only merge external callers see.

use serde::{Deserialize, Serialize};

use crate::color::Color;
use crate::config::ZoneConfig;
use crate::ids::{AnimationId, ParameterId, ZoneId};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    Static,
    Animation,
    Off,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneState {
    pub color: Color,
    /// `0..=100`.
    pub brightness: u8,
    pub is_on: bool,
    pub mode: Mode,
    pub active_animation_id: Option<AnimationId>,
    pub animation_param_values: HashMap<ParameterId, f64>,
}

impl ZoneState {
    pub fn default_for(_zone: &ZoneId) -> Self {
        Self {
            color: Color::rgb(0, 0, 0),
            brightness: 100,
            is_on: true,
            mode: Mode::Static,
            active_animation_id: None,
            animation_param_values: HashMap::new(),
        }
    }

    /// Invariant from spec §3: `mode == Animation` implies an animation id
    /// is set (the corresponding producer task's existence is enforced by
    /// the Animation Engine, not representable here).
    pub fn is_consistent(&self) -> bool {
        match self.mode {
            Mode::Animation => self.active_animation_id.is_some(),
            Mode::Static | Mode::Off => true,
        }
    }
}

/// What external readers (`get`/`all`) see: immutable config joined with
/// live state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneCombined {
    pub config: ZoneConfig,
    pub state: ZoneState,
}

/// A diff describing what a single mutation changed, attached to the
/// `ZoneStateChanged` event the Zone Service publishes (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneDiff {
    pub color: Option<Color>,
    pub brightness: Option<u8>,
    pub is_on: Option<bool>,
    pub mode: Option<Mode>,
    pub animation_param: Option<(ParameterId, f64)>,
}

impl ZoneDiff {
    pub fn empty() -> Self {
        Self {
            color: None,
            brightness: None,
            is_on: None,
            mode: None,
            animation_param: None,
        }
    }
}
