//! Frame model (spec §3, §4.2). A `Frame` is a declarative, partial or
//! total update to one strip's pixel buffer, tagged with a priority the
//! Frame Pipeline uses to merge concurrently-submitted frames.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::color::Color;
use crate::config::StaticConfig;
use crate::error::FrameError;
use crate::ids::ZoneId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    Idle = 0,
    Manual = 10,
    Pulse = 20,
    Animation = 30,
    Transition = 40,
    Debug = 50,
}

impl Priority {
    pub const ALL: [Priority; 6] = [
        Priority::Idle,
        Priority::Manual,
        Priority::Pulse,
        Priority::Animation,
        Priority::Transition,
        Priority::Debug,
    ];

    pub fn index(self) -> usize {
        match self {
            Priority::Idle => 0,
            Priority::Manual => 1,
            Priority::Pulse => 2,
            Priority::Animation => 3,
            Priority::Transition => 4,
            Priority::Debug => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    WholeStrip { color: Color },
    ZoneUpdate { updates: HashMap<ZoneId, Color> },
    PixelUpdate { updates: HashMap<ZoneId, Vec<Color>> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceTag {
    Manual,
    Animation(crate::ids::AnimationId),
    Transition,
    Debug,
    Pulse,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub body: FrameBody,
    pub priority: Priority,
    pub ttl: Duration,
    pub source: SourceTag,
    /// True unless this frame fully specifies every pixel of every strip.
    /// `WholeStrip` frames targeting every zone are the only frames that
    /// can be non-partial; everything produced by a single zone's producer
    /// is partial by construction.
    pub partial: bool,
    pub submitted_at: Instant,
}

impl Frame {
    pub fn whole_strip(color: Color, priority: Priority, ttl: Duration, source: SourceTag) -> Self {
        Self {
            body: FrameBody::WholeStrip { color },
            priority,
            ttl,
            source,
            partial: false,
            submitted_at: Instant::now(),
        }
    }

    pub fn zone_update(
        updates: HashMap<ZoneId, Color>,
        priority: Priority,
        ttl: Duration,
        source: SourceTag,
    ) -> Self {
        Self {
            body: FrameBody::ZoneUpdate { updates },
            priority,
            ttl,
            source,
            partial: true,
            submitted_at: Instant::now(),
        }
    }

    pub fn pixel_update(
        updates: HashMap<ZoneId, Vec<Color>>,
        priority: Priority,
        ttl: Duration,
        source: SourceTag,
    ) -> Self {
        Self {
            body: FrameBody::PixelUpdate { updates },
            priority,
            ttl,
            source,
            partial: true,
            submitted_at: Instant::now(),
        }
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        now > self.submitted_at + self.ttl
    }

    /// Validates against `config` per spec §4.2: a `PixelUpdate` whose
    /// pixel count disagrees with the zone's `pixel_count` is rejected at
    /// submission, as is any frame naming an unknown zone, or one already
    /// stale at submission time (spec §4.5.2).
    pub fn validate(&self, config: &StaticConfig) -> Result<(), FrameError> {
        if self.is_stale(Instant::now()) {
            return Err(FrameError::AlreadyStale);
        }
        match &self.body {
            FrameBody::WholeStrip { .. } => Ok(()),
            FrameBody::ZoneUpdate { updates } => {
                for zone in updates.keys() {
                    config
                        .zone(zone)
                        .ok_or_else(|| FrameError::UnknownZone(zone.clone()))?;
                }
                Ok(())
            }
            FrameBody::PixelUpdate { updates } => {
                for (zone, pixels) in updates {
                    let zone_cfg = config
                        .zone(zone)
                        .ok_or_else(|| FrameError::UnknownZone(zone.clone()))?;
                    if pixels.len() != zone_cfg.pixel_count {
                        return Err(FrameError::PixelCountMismatch {
                            zone: zone.clone(),
                            expected: zone_cfg.pixel_count,
                            got: pixels.len(),
                        });
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SystemConfig, ZoneConfig};

    fn config() -> StaticConfig {
        StaticConfig {
            zones: vec![ZoneConfig {
                id: "z1".into(),
                display_name: "Z1".into(),
                pixel_count: 10,
                gpio_pin: 18,
                strip: "s1".into(),
                pixel_index_range: 0..10,
                layout: None,
            }],
            presets: vec![],
            animations: vec![],
            system: SystemConfig::default(),
        }
    }

    #[test]
    fn wrong_pixel_count_rejected() {
        let cfg = config();
        let mut updates = HashMap::new();
        updates.insert(ZoneId::from("z1"), vec![Color::rgb(0, 0, 0); 3]);
        let frame = Frame::pixel_update(
            updates,
            Priority::Manual,
            Duration::from_millis(100),
            SourceTag::Manual,
        );
        assert!(matches!(
            frame.validate(&cfg),
            Err(FrameError::PixelCountMismatch { expected: 10, got: 3, .. })
        ));
    }

    #[test]
    fn unknown_zone_rejected() {
        let cfg = config();
        let mut updates = HashMap::new();
        updates.insert(ZoneId::from("ghost"), Color::rgb(1, 1, 1));
        let frame = Frame::zone_update(
            updates,
            Priority::Manual,
            Duration::from_millis(100),
            SourceTag::Manual,
        );
        assert!(matches!(frame.validate(&cfg), Err(FrameError::UnknownZone(_))));
    }

    #[test]
    fn stale_at_submission_rejected() {
        let cfg = config();
        let mut frame = Frame::whole_strip(
            Color::rgb(0, 0, 0),
            Priority::Idle,
            Duration::from_millis(1),
            SourceTag::Manual,
        );
        frame.submitted_at = Instant::now() - Duration::from_secs(1);
        assert!(matches!(frame.validate(&cfg), Err(FrameError::AlreadyStale)));
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::Transition > Priority::Animation);
        assert!(Priority::Animation > Priority::Manual);
        assert!(Priority::Manual > Priority::Idle);
    }
}
