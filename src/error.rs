//! Error kinds (spec §7). Grouped by the boundary that surfaces them, each
//! as its own `thiserror` enum rather than one crate-wide error, matching
//! the teacher's per-module `ConfigError`/`WriteError` split
//! (`re_analytics::config`).

use crate::ids::{AnimationId, ParameterId, ZoneId};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ColorError {
    #[error("unknown color preset {0:?}")]
    UnknownPreset(String),
}

/// Driver-level failures (spec §4.1). `TransientIO` is retry-safe and only
/// logged; `FatalDriver` must propagate out of the render task so the task
/// registry records a failure and prioritized shutdown begins (spec §4.9).
#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    #[error("transient I/O error on strip {strip}: {reason}")]
    TransientIO { strip: String, reason: String },

    #[error("fatal driver error on strip {strip}: {reason}")]
    FatalDriver { strip: String, reason: String },
}

/// Frame validation / submission failures (spec §4.2, §4.5.2).
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("zone {zone:?} pixel update has {got} pixels, expected {expected}")]
    PixelCountMismatch {
        zone: ZoneId,
        expected: usize,
        got: usize,
    },

    #[error("frame referenced unknown zone {0:?}")]
    UnknownZone(ZoneId),

    #[error("frame was already stale at submission")]
    AlreadyStale,
}

/// Boundary-facing errors (spec §4.8, §6's command error column). `Clone`
/// so a cached idempotent result (spec §4.8 point 2) can be returned more
/// than once without re-executing.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CommandError {
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("value out of range: {0}")]
    OutOfRange(String),

    #[error("unknown zone {0:?}")]
    UnknownZone(ZoneId),

    #[error("unknown animation {0:?}")]
    UnknownAnimation(AnimationId),

    #[error("unknown parameter {0:?}")]
    UnknownParam(ParameterId),

    #[error("invalid render mode {0:?}")]
    InvalidMode(String),

    #[error("invalid color: {0}")]
    InvalidColor(#[from] ColorError),

    /// A no-op that is still a success per spec §4.8 (e.g. `stop_animation`
    /// on a zone with nothing running): not a failure, but distinct from a
    /// fresh mutation for callers that care (testable property 9).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited")]
    RateLimited,
}

#[derive(Debug, thiserror::Error)]
pub enum AnimationError {
    #[error("unknown animation {0:?}")]
    UnknownAnimation(AnimationId),

    #[error("unknown parameter {0:?} for animation {1:?}")]
    UnknownParam(ParameterId, AnimationId),

    #[error("parameter {param:?} value {value} outside [{min}, {max}]")]
    ParamOutOfRange {
        param: ParameterId,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("zone {0:?} has no running animation")]
    NotRunning(ZoneId),
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error("snapshot version {found} is newer than the highest supported ({max_supported})")]
    UnsupportedVersion { found: u32, max_supported: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("zone {zone:?} pixel range {range:?} overlaps another zone on strip {strip:?}")]
    OverlappingZoneRange {
        zone: ZoneId,
        strip: String,
        range: std::ops::Range<usize>,
    },

    #[error("zone {0:?} has pixel_count 0")]
    EmptyZone(ZoneId),

    #[error("strip {strip:?}'s zone ranges are not a contiguous prefix of its pixel buffer")]
    NonPrefixCoverage { strip: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("shutdown handler {handler:?} timed out after {timeout_ms}ms")]
    HandlerTimeout { handler: String, timeout_ms: u64 },

    #[error("global shutdown timeout of {0}ms exceeded")]
    GlobalTimeout(u64),

    #[error("port {port} still occupied after one reclamation attempt")]
    PortOccupied { port: u16 },
}
