//! Zone Service (spec §4.3, C3). The single writer of zone state; every
//! mutator publishes a `ZoneStateChanged` event and reschedules the
//! debounced snapshot write. Readers get a consistent clone taken under a
//! lock held only for the read (spec §5's shared-resource policy).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::color::Color;
use crate::config::StaticConfig;
use crate::error::CommandError;
use crate::event::{Event, EventKind, SourceType};
use crate::event_bus::EventBus;
use crate::ids::{ClientId, ParameterId, ZoneId};
use crate::snapshot::{GlobalSnapshot, Snapshot, SnapshotStore};
use crate::zone::{Mode, ZoneCombined, ZoneDiff, ZoneState};

pub struct ZoneService {
    config: Arc<StaticConfig>,
    state: RwLock<HashMap<ZoneId, ZoneState>>,
    global: RwLock<GlobalSnapshot>,
    bus: Arc<EventBus>,
    snapshots: Arc<SnapshotStore>,
}

impl ZoneService {
    /// Boots from a prior snapshot if present, otherwise defaults, per
    /// spec §3's zone lifecycle.
    pub fn new(config: Arc<StaticConfig>, bus: Arc<EventBus>, snapshots: Arc<SnapshotStore>) -> Self {
        let loaded = snapshots.read().ok().flatten();
        let mut state = HashMap::new();
        for zone in &config.zones {
            let zone_state = loaded
                .as_ref()
                .and_then(|s| s.zones.get(&zone.id).cloned())
                .unwrap_or_else(|| ZoneState::default_for(&zone.id));
            state.insert(zone.id.clone(), zone_state);
        }
        let global = loaded.map(|s| s.global).unwrap_or_default();

        Self {
            config,
            state: RwLock::new(state),
            global: RwLock::new(global),
            bus,
            snapshots,
        }
    }

    fn publish_and_persist(&self, zone: ZoneId, diff: ZoneDiff, origin: Option<ClientId>, source_type: SourceType) {
        let event = Event::new(
            EventKind::ZoneStateChanged { zone, diff },
            origin,
            source_type,
        );
        let bus = self.bus.clone();
        tokio::spawn(async move {
            bus.publish(event).await;
        });
        self.schedule_snapshot();
    }

    fn schedule_snapshot(&self) {
        let zones = self.state.read().clone();
        let global = self.global.read().clone();
        let snapshots = self.snapshots.clone();
        tokio::spawn(async move {
            snapshots.schedule_write(Snapshot::new(zones, global)).await;
        });
    }

    pub async fn flush(&self) -> Result<(), crate::error::SnapshotError> {
        self.snapshots.flush().await
    }

    fn with_zone_mut<R>(
        &self,
        zone: &ZoneId,
        f: impl FnOnce(&mut ZoneState) -> R,
    ) -> Result<R, CommandError> {
        let mut guard = self.state.write();
        let zone_state = guard
            .get_mut(zone)
            .ok_or_else(|| CommandError::UnknownZone(zone.clone()))?;
        Ok(f(zone_state))
    }

    pub fn set_color(
        &self,
        zone: &ZoneId,
        color: Color,
        origin: Option<ClientId>,
        source_type: SourceType,
    ) -> Result<ZoneCombined, CommandError> {
        self.with_zone_mut(zone, |s| s.color = color.clone())?;
        self.publish_and_persist(
            zone.clone(),
            ZoneDiff { color: Some(color), ..ZoneDiff::empty() },
            origin,
            source_type,
        );
        self.get(zone)
    }

    pub fn set_brightness(
        &self,
        zone: &ZoneId,
        brightness: u8,
        origin: Option<ClientId>,
        source_type: SourceType,
    ) -> Result<ZoneCombined, CommandError> {
        if brightness > 100 {
            return Err(CommandError::OutOfRange(format!(
                "brightness {brightness} out of range [0, 100]"
            )));
        }
        self.with_zone_mut(zone, |s| s.brightness = brightness)?;
        self.publish_and_persist(
            zone.clone(),
            ZoneDiff { brightness: Some(brightness), ..ZoneDiff::empty() },
            origin,
            source_type,
        );
        self.get(zone)
    }

    pub fn set_enabled(
        &self,
        zone: &ZoneId,
        is_on: bool,
        origin: Option<ClientId>,
        source_type: SourceType,
    ) -> Result<ZoneCombined, CommandError> {
        self.with_zone_mut(zone, |s| s.is_on = is_on)?;
        self.publish_and_persist(
            zone.clone(),
            ZoneDiff { is_on: Some(is_on), ..ZoneDiff::empty() },
            origin,
            source_type,
        );
        self.get(zone)
    }

    /// Sets the zone's render mode. Entering/leaving `ANIMATION` is the
    /// Animation Engine's job (it owns the producer-task lifecycle); this
    /// only updates the state flag and, on leaving `ANIMATION`, clears the
    /// active animation id to keep spec §3's invariant
    /// (`mode == ANIMATION` implies `active_animation_id.is_some()`).
    pub fn set_mode(
        &self,
        zone: &ZoneId,
        mode: Mode,
        origin: Option<ClientId>,
        source_type: SourceType,
    ) -> Result<ZoneCombined, CommandError> {
        self.with_zone_mut(zone, |s| {
            s.mode = mode;
            if mode != Mode::Animation {
                s.active_animation_id = None;
            }
        })?;
        self.publish_and_persist(
            zone.clone(),
            ZoneDiff { mode: Some(mode), ..ZoneDiff::empty() },
            origin,
            source_type,
        );
        self.get(zone)
    }

    /// Called by the Animation Engine once a producer task is actually
    /// running, so the mode/animation-id invariant only becomes true once
    /// the task exists (spec §3).
    pub fn set_active_animation(
        &self,
        zone: &ZoneId,
        animation: Option<crate::ids::AnimationId>,
        origin: Option<ClientId>,
        source_type: SourceType,
    ) -> Result<(), CommandError> {
        self.with_zone_mut(zone, |s| {
            s.active_animation_id = animation;
            s.mode = if s.active_animation_id.is_some() {
                Mode::Animation
            } else if s.mode == Mode::Animation {
                Mode::Static
            } else {
                s.mode
            };
        })?;
        self.publish_and_persist(
            zone.clone(),
            ZoneDiff { mode: Some(self.get(zone)?.state.mode), ..ZoneDiff::empty() },
            origin,
            source_type,
        );
        Ok(())
    }

    pub fn set_animation_param(
        &self,
        zone: &ZoneId,
        param: ParameterId,
        value: f64,
        origin: Option<ClientId>,
        source_type: SourceType,
    ) -> Result<ZoneCombined, CommandError> {
        self.with_zone_mut(zone, |s| {
            s.animation_param_values.insert(param.clone(), value);
        })?;
        self.publish_and_persist(
            zone.clone(),
            ZoneDiff { animation_param: Some((param, value)), ..ZoneDiff::empty() },
            origin,
            source_type,
        );
        self.get(zone)
    }

    pub fn get(&self, zone: &ZoneId) -> Result<ZoneCombined, CommandError> {
        let config = self
            .config
            .zone(zone)
            .ok_or_else(|| CommandError::UnknownZone(zone.clone()))?
            .clone();
        let state = self
            .state
            .read()
            .get(zone)
            .cloned()
            .ok_or_else(|| CommandError::UnknownZone(zone.clone()))?;
        Ok(ZoneCombined { config, state })
    }

    pub fn all(&self) -> Vec<ZoneCombined> {
        self.config
            .zones
            .iter()
            .filter_map(|cfg| self.get(&cfg.id).ok())
            .collect()
    }

    /// All zones other than `zone` (used e.g. by controllers deciding which
    /// zones a `WholeStrip` update must leave untouched).
    pub fn excluded_from(&self, zone: &ZoneId) -> Vec<ZoneId> {
        self.config
            .zones
            .iter()
            .map(|z| z.id.clone())
            .filter(|id| id != zone)
            .collect()
    }

    pub fn config(&self) -> &Arc<StaticConfig> {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SystemConfig, ZoneConfig};
    use std::time::Duration;

    fn test_config() -> Arc<StaticConfig> {
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
            system: SystemConfig::default(),
        })
    }

    fn harness() -> (Arc<ZoneService>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let dir = std::env::temp_dir().join(format!("ledctl-zs-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let snapshots = Arc::new(SnapshotStore::open(dir.join("snap.json"), Duration::from_millis(20)));
        let service = Arc::new(ZoneService::new(test_config(), bus.clone(), snapshots));
        (service, bus)
    }

    #[tokio::test]
    async fn set_color_round_trips() {
        let (svc, _bus) = harness();
        let zone = ZoneId::from("z1");
        svc.set_color(&zone, Color::rgb(9, 9, 9), None, SourceType::Internal)
            .unwrap();
        assert_eq!(svc.get(&zone).unwrap().state.color, Color::rgb(9, 9, 9));
    }

    #[tokio::test]
    async fn brightness_out_of_range_rejected() {
        let (svc, _bus) = harness();
        let zone = ZoneId::from("z1");
        let err = svc
            .set_brightness(&zone, 255, None, SourceType::Internal)
            .unwrap_err();
        assert!(matches!(err, CommandError::OutOfRange(_)));
    }

    #[tokio::test]
    async fn unknown_zone_rejected() {
        let (svc, _bus) = harness();
        let err = svc
            .set_color(&ZoneId::from("ghost"), Color::rgb(0, 0, 0), None, SourceType::Internal)
            .unwrap_err();
        assert!(matches!(err, CommandError::UnknownZone(_)));
    }
}
