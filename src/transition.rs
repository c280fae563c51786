//! Transition Service (spec §4.7, C7). Produces `TRANSITION`-priority frame
//! sequences that interpolate a zone from its current color to a target
//! over `duration`, pre-empting `ANIMATION` by the Frame Pipeline's own
//! merge policy (§4.5.3) without this service needing to know anything
//! about what else is running on the zone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::color::{Color, PresetTable};
use crate::config::StaticConfig;
use crate::frame::{Frame, Priority, SourceTag};
use crate::ids::ZoneId;
use crate::pipeline::FramePipeline;
use crate::zone_service::ZoneService;

const CANCEL_TIMEOUT: Duration = Duration::from_secs(1);

struct TransitionSlot {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

/// Only one transition runs per zone at a time (spec §4.7): a second
/// `start` cancels and replaces the first, using the same
/// mutate-under-lock-then-await-outside-it pattern as the Animation Engine
/// (spec §4.6, Design Notes §9).
pub struct TransitionService {
    config: Arc<StaticConfig>,
    pipeline: Arc<FramePipeline>,
    zones: Arc<ZoneService>,
    presets: PresetTable,
    slots: Mutex<HashMap<ZoneId, TransitionSlot>>,
}

impl TransitionService {
    pub fn new(config: Arc<StaticConfig>, pipeline: Arc<FramePipeline>, zones: Arc<ZoneService>) -> Self {
        let presets = PresetTable::from_configs(&config.presets);
        Self {
            config,
            pipeline,
            zones,
            presets,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a fade on `zone` toward `target` over `duration`, replacing
    /// any transition already running there. Returns once the replacement
    /// is live; the fade itself continues in the background.
    pub async fn start(&self, zone: ZoneId, target: Color, duration: Duration) {
        let source_rgb = self
            .zones
            .get(&zone)
            .ok()
            .and_then(|combined| combined.state.color.to_rgb(&self.presets).ok())
            .unwrap_or((0, 0, 0));
        let target_rgb = target.to_rgb(&self.presets).unwrap_or((0, 0, 0));

        let fps = self.config.system.fps_target.max(1);
        let interval = Duration::from_secs_f64(1.0 / f64::from(fps));
        let steps = ((duration.as_secs_f64() / interval.as_secs_f64()).round() as u64).max(1);

        let pipeline = self.pipeline.clone();
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task_zone = zone.clone();

        let handle = tokio::spawn(async move {
            for step in 0..=steps {
                if task_cancel.is_cancelled() {
                    break;
                }
                let t = step as f64 / steps as f64;
                let rgb = lerp(source_rgb, target_rgb, t);
                let mut updates = HashMap::new();
                updates.insert(task_zone.clone(), Color::rgb(rgb.0, rgb.1, rgb.2));
                pipeline.submit(Frame::zone_update(
                    updates,
                    Priority::Transition,
                    interval * 2,
                    SourceTag::Transition,
                ));
                if step == steps {
                    break;
                }
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });

        let previous = {
            let mut slots = self.slots.lock();
            let previous = slots.remove(&zone);
            if let Some(previous) = &previous {
                previous.cancel.cancel();
            }
            slots.insert(zone.clone(), TransitionSlot { cancel, handle });
            previous
        };

        if let Some(previous) = previous {
            if tokio::time::timeout(CANCEL_TIMEOUT, previous.handle).await.is_err() {
                tracing::warn!(zone = %zone, "transition cancel timed out, abandoning task");
            }
        }
    }

    /// Waits for `zone`'s current transition, if any, to finish on its own
    /// (not cancellation — a genuine completion wait). Used by shutdown's
    /// fade-out, which must run to completion before LEDs are cleared
    /// (spec §4.7, §4.9).
    pub async fn join(&self, zone: &ZoneId) {
        let slot = self.slots.lock().remove(zone);
        if let Some(slot) = slot {
            let _ = slot.handle.await;
        }
    }

    pub fn is_running(&self, zone: &ZoneId) -> bool {
        self.slots.lock().contains_key(zone)
    }
}

/// Fades every currently-on zone to black and waits for all of them to
/// finish. This is the shutdown handler body at priority 100 (spec §4.9):
/// it must complete before LEDs are blanked and the process exits. OFF
/// zones are skipped — they already render black (resolved open question 3
/// in `SPEC_FULL.md`).
pub async fn fade_out_all(service: &Arc<TransitionService>, duration: Duration) {
    let targets: Vec<ZoneId> = service
        .zones
        .all()
        .into_iter()
        .filter(|z| z.state.is_on)
        .map(|z| z.config.id)
        .collect();

    let mut set = tokio::task::JoinSet::new();
    for zone in targets {
        let service = service.clone();
        set.spawn(async move {
            service.start(zone.clone(), Color::rgb(0, 0, 0), duration).await;
            service.join(&zone).await;
        });
    }
    while set.join_next().await.is_some() {}
}

fn lerp(a: (u8, u8, u8), b: (u8, u8, u8), t: f64) -> (u8, u8, u8) {
    let lerp_channel = |x: u8, y: u8| -> u8 {
        (f64::from(x) + (f64::from(y) - f64::from(x)) * t).round().clamp(0.0, 255.0) as u8
    };
    (lerp_channel(a.0, b.0), lerp_channel(a.1, b.1), lerp_channel(a.2, b.2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SystemConfig, ZoneConfig};
    use crate::event::SourceType;
    use crate::event_bus::EventBus;
    use crate::snapshot::SnapshotStore;
    use crate::strip_driver::SimulatedStrip;

    fn config() -> Arc<StaticConfig> {
        Arc::new(StaticConfig {
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
            system: SystemConfig {
                fps_target: 200,
                ..SystemConfig::default()
            },
        })
    }

    fn harness() -> (Arc<TransitionService>, Arc<ZoneService>) {
        let config = config();
        let bus = Arc::new(EventBus::new());
        let dir = std::env::temp_dir().join(format!("ledctl-trans-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let snapshots = Arc::new(SnapshotStore::open(dir.join("snap.json"), Duration::from_secs(60)));
        let zones = Arc::new(ZoneService::new(config.clone(), bus.clone(), snapshots));
        let pipeline = Arc::new(FramePipeline::new(config.clone(), zones.clone()));
        pipeline.register_strip("s1".into(), || SimulatedStrip::new("s1"));
        (
            Arc::new(TransitionService::new(config, pipeline, zones.clone())),
            zones,
        )
    }

    #[tokio::test]
    async fn restart_never_leaves_two_tasks() {
        let (service, _zones) = harness();
        let zone = ZoneId::from("z1");
        service.start(zone.clone(), Color::rgb(255, 0, 0), Duration::from_millis(200)).await;
        assert!(service.is_running(&zone));
        service.start(zone.clone(), Color::rgb(0, 255, 0), Duration::from_millis(200)).await;
        assert_eq!(service.slots.lock().len(), 1);
        service.join(&zone).await;
    }

    #[tokio::test]
    async fn fade_out_skips_off_zones() {
        let (service, zones) = harness();
        let zone = ZoneId::from("z1");
        zones.set_enabled(&zone, false, None, SourceType::Internal).unwrap();
        fade_out_all(&service, Duration::from_millis(20)).await;
        assert!(!service.is_running(&zone));
    }
}
