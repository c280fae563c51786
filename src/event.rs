//! Event model (spec §3). `Event` carries a tagged `EventKind` plus the
//! common envelope fields every event needs for echo suppression and
//! controller filtering (spec §4.8).

use std::time::Instant;

use crate::error::{AnimationError, CommandError, HardwareError};
use crate::ids::{AnimationId, ClientId, ParameterId, ZoneId};
use crate::zone::ZoneDiff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Hardware,
    Internal,
    Command,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    KeyPress { key: String },
    EncoderDelta { encoder: String, delta: i32 },
    Button { button: String, pressed: bool },
    ZoneStateChanged { zone: ZoneId, diff: ZoneDiff },
    AnimationStarted { zone: ZoneId, animation: AnimationId },
    AnimationStopped { zone: ZoneId },
    ParamChanged { zone: ZoneId, param: ParameterId, value: f64 },
    ModeChanged { zone: ZoneId, mode: crate::zone::Mode },
    ShutdownRequested { reason: String },
    /// Reported by the Animation Engine (spec §4.6) and surfaced so the
    /// registry/coordinator can log it without a direct dependency back on
    /// the engine.
    AnimationCancelTimeout { zone: ZoneId },
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub origin_client_id: Option<ClientId>,
    pub source_type: SourceType,
    pub at: Instant,
}

impl Event {
    pub fn new(kind: EventKind, origin_client_id: Option<ClientId>, source_type: SourceType) -> Self {
        Self {
            kind,
            origin_client_id,
            source_type,
            at: Instant::now(),
        }
    }

    pub fn hardware(kind: EventKind) -> Self {
        Self::new(kind, None, SourceType::Hardware)
    }

    pub fn internal(kind: EventKind) -> Self {
        Self::new(kind, None, SourceType::Internal)
    }

    pub fn command(kind: EventKind, client_id: ClientId) -> Self {
        Self::new(kind, Some(client_id), SourceType::Command)
    }

    /// Discriminant used for subscription matching, independent of payload.
    pub fn kind_tag(&self) -> EventKindTag {
        match &self.kind {
            EventKind::KeyPress { .. } => EventKindTag::KeyPress,
            EventKind::EncoderDelta { .. } => EventKindTag::EncoderDelta,
            EventKind::Button { .. } => EventKindTag::Button,
            EventKind::ZoneStateChanged { .. } => EventKindTag::ZoneStateChanged,
            EventKind::AnimationStarted { .. } => EventKindTag::AnimationStarted,
            EventKind::AnimationStopped { .. } => EventKindTag::AnimationStopped,
            EventKind::ParamChanged { .. } => EventKindTag::ParamChanged,
            EventKind::ModeChanged { .. } => EventKindTag::ModeChanged,
            EventKind::ShutdownRequested { .. } => EventKindTag::ShutdownRequested,
            EventKind::AnimationCancelTimeout { .. } => EventKindTag::AnimationCancelTimeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKindTag {
    KeyPress,
    EncoderDelta,
    Button,
    ZoneStateChanged,
    AnimationStarted,
    AnimationStopped,
    ParamChanged,
    ModeChanged,
    ShutdownRequested,
    AnimationCancelTimeout,
}

/// Reasons a prioritized shutdown can be triggered (spec §4.9).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ShutdownReason {
    #[error("OS signal received")]
    Signal,
    #[error("explicit shutdown request")]
    Explicit,
    #[error("critical task {category} ({description}) failed: {error}")]
    TaskFailure {
        category: crate::registry::TaskCategory,
        description: String,
        error: String,
    },
}

/// Errors that cross a task boundary and must be turned into a terminal
/// registry state (spec §7, "TaskCancelled... must propagate").
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    Hardware(#[from] HardwareError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Animation(#[from] AnimationError),
    #[error("{0}")]
    Other(String),
}
