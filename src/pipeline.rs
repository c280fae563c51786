//! Frame Pipeline (spec §4.5, C5) — priority queues, merge policy, cadence
//! control, hardware-timing gate and strip dispatch. The heart of the
//! system.
//!
//! Design Notes §9 rejects a single coarse lock shared between submission
//! and drain: here each priority level gets its own `parking_lot::Mutex`,
//! so a fast producer at one priority never contends with a drain touching
//! a different priority, and every lock is held only for the duration of
//! one append or one drain iteration.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::color::PresetTable;
use crate::config::StaticConfig;
use crate::error::HardwareError;
use crate::frame::{Frame, FrameBody, Priority};
use crate::ids::StripId;
use crate::strip_driver::{Pixel, StripDriver, StripWorker};
use crate::zone::Mode;
use crate::zone_service::ZoneService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Initializing,
    Running,
    Paused,
    Stopping,
    Stopped,
}

#[derive(Default)]
pub struct Metrics {
    pub frames_rendered: AtomicU64,
}

struct StripEntry {
    worker: StripWorker,
    errors: std::sync::mpsc::Receiver<HardwareError>,
}

pub struct FramePipeline {
    config: Arc<StaticConfig>,
    zones: Arc<ZoneService>,
    presets: PresetTable,
    queues: [Mutex<VecDeque<Frame>>; 6],
    strip_buffers: Mutex<HashMap<StripId, Vec<Pixel>>>,
    pub(crate) last_rendered: Mutex<HashMap<StripId, Vec<Pixel>>>,
    strips: Mutex<HashMap<StripId, StripEntry>>,
    state: Mutex<PipelineState>,
    step_requested: std::sync::atomic::AtomicBool,
    tick_period: Duration,
    hardware_floor: Duration,
    pub metrics: Metrics,
}

impl FramePipeline {
    pub fn new(config: Arc<StaticConfig>, zones: Arc<ZoneService>) -> Self {
        let presets = PresetTable::from_configs(&config.presets);
        let tick_period = Duration::from_secs_f64(1.0 / f64::from(config.system.fps_target.max(1)));
        let hardware_floor = Duration::from_secs_f64(config.system.hardware_min_frame_ms / 1000.0);
        let mut strip_buffers = HashMap::new();
        for strip in config.strips() {
            let len = config.strip_len(&strip);
            strip_buffers.insert(strip, vec![(0, 0, 0); len]);
        }
        let last_rendered = strip_buffers.clone();

        Self {
            config,
            zones,
            presets,
            queues: Default::default(),
            strip_buffers: Mutex::new(strip_buffers),
            last_rendered: Mutex::new(last_rendered),
            strips: Mutex::new(HashMap::new()),
            state: Mutex::new(PipelineState::Initializing),
            step_requested: std::sync::atomic::AtomicBool::new(false),
            tick_period,
            hardware_floor,
            metrics: Metrics::default(),
        }
    }

    pub fn register_strip<D, F>(&self, strip: StripId, make_driver: F)
    where
        D: StripDriver + 'static,
        F: FnOnce() -> D + Send + 'static,
    {
        let (worker, errors) = StripWorker::spawn(strip.to_string(), make_driver, self.hardware_floor);
        self.strips.lock().insert(strip, StripEntry { worker, errors });
    }

    /// Non-blocking. Validates and appends to the frame's priority queue;
    /// evicts the oldest entry at that priority if the ring is full (spec
    /// §4.5.1, §4.5.2). Already-stale frames are dropped at submission.
    pub fn submit(&self, frame: Frame) {
        if let Err(err) = frame.validate(&self.config) {
            tracing::warn!(%err, "frame rejected at submission");
            return;
        }
        let idx = frame.priority.index();
        let mut queue = self.queues[idx].lock();
        queue.push_back(frame);
        while queue.len() > 2 {
            queue.pop_front();
        }
    }

    /// Drains every queue, highest priority last so callers can apply in
    /// increasing-priority order (spec §4.5.3 step 2). Stale frames are
    /// dropped, not fallen through to a lower priority (resolved open
    /// question 1 in `SPEC_FULL.md`).
    fn drain_all(&self, now: Instant) -> Vec<Frame> {
        let mut out = Vec::new();
        for priority in Priority::ALL {
            let mut queue = self.queues[priority.index()].lock();
            while let Some(frame) = queue.pop_front() {
                if frame.is_stale(now) {
                    continue;
                }
                out.push(frame);
            }
        }
        out
    }

    /// Merges this tick's live frames onto the persisted base buffer
    /// (spec §4.5.3 steps 1-2): starts from the last *unscaled* merged
    /// state (never the brightness-scaled render output — a zone's base
    /// pixels must stay stable across ticks it isn't touched by a new
    /// frame, or repeated brightness scaling would decay them toward
    /// black), then applies every live frame in increasing-priority order
    /// so the highest priority observed this tick overwrites lower ones.
    /// This is the buffer persisted back into `self.strip_buffers`.
    fn merge_frames(&self, frames: &[Frame]) -> HashMap<StripId, Vec<Pixel>> {
        let mut buffers = self.strip_buffers.lock().clone();

        for frame in frames {
            match &frame.body {
                FrameBody::WholeStrip { color } => {
                    if let Ok(rgb) = color.to_rgb(&self.presets) {
                        for buf in buffers.values_mut() {
                            buf.fill(rgb);
                        }
                    }
                }
                FrameBody::ZoneUpdate { updates } => {
                    for (zone_id, color) in updates {
                        let Some(zone_cfg) = self.config.zone(zone_id) else { continue };
                        let Ok(rgb) = color.to_rgb(&self.presets) else { continue };
                        if let Some(buf) = buffers.get_mut(&zone_cfg.strip) {
                            if let Some(slice) = buf.get_mut(zone_cfg.pixel_index_range.clone()) {
                                slice.fill(rgb);
                            }
                        }
                    }
                }
                FrameBody::PixelUpdate { updates } => {
                    for (zone_id, colors) in updates {
                        let Some(zone_cfg) = self.config.zone(zone_id) else { continue };
                        if let Some(buf) = buffers.get_mut(&zone_cfg.strip) {
                            if let Some(slice) = buf.get_mut(zone_cfg.pixel_index_range.clone()) {
                                for (px, color) in slice.iter_mut().zip(colors) {
                                    if let Ok(rgb) = color.to_rgb(&self.presets) {
                                        *px = rgb;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        buffers
    }

    /// Applies zone brightness scaling and off-forcing to a clone of the
    /// base buffer, producing the frame actually dispatched to strip
    /// workers (spec §4.5.3 steps 3-7). This output is never written back
    /// as the next tick's base — only `self.last_rendered` — so a zone
    /// left untouched by new frames renders at a stable brightness
    /// instead of decaying geometrically tick over tick.
    fn render(&self, base: &HashMap<StripId, Vec<Pixel>>) -> HashMap<StripId, Vec<Pixel>> {
        let mut buffers = base.clone();

        for zone_cfg in &self.config.zones {
            let Ok(combined) = self.zones.get(&zone_cfg.id) else { continue };
            let Some(buf) = buffers.get_mut(&zone_cfg.strip) else { continue };
            let Some(slice) = buf.get_mut(zone_cfg.pixel_index_range.clone()) else { continue };
            if !combined.state.is_on || combined.state.mode == Mode::Off {
                slice.fill((0, 0, 0));
            } else {
                let brightness = combined.state.brightness;
                for px in slice.iter_mut() {
                    *px = crate::color::scale_brightness(*px, brightness);
                }
            }
        }

        buffers
    }

    /// One full render tick (spec §4.5.4 steps 3-6, minus the cadence
    /// sleeps which `run` owns). Returns `Err` if any strip reported a
    /// fatal driver failure during this tick.
    async fn tick(&self) -> Result<(), HardwareError> {
        let now = Instant::now();
        let frames = self.drain_all(now);
        let base = self.merge_frames(&frames);
        *self.strip_buffers.lock() = base.clone();
        let rendered = self.render(&base);
        *self.last_rendered.lock() = rendered.clone();

        let mut fatal = None;
        {
            let strips = self.strips.lock();
            for (strip, buf) in &rendered {
                if let Some(entry) = strips.get(strip) {
                    entry.worker.submit(buf.clone());
                    match entry.errors.try_recv() {
                        Ok(err @ HardwareError::FatalDriver { .. }) => fatal = Some(err),
                        Ok(HardwareError::TransientIO { .. }) => {}
                        Err(_) => {}
                    }
                }
            }
        }
        self.metrics.frames_rendered.fetch_add(1, Ordering::Relaxed);
        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn start(&self) {
        let mut state = self.state.lock();
        if *state == PipelineState::Initializing {
            *state = PipelineState::Running;
        }
    }

    pub fn pause(&self) {
        let mut state = self.state.lock();
        if *state == PipelineState::Running {
            *state = PipelineState::Paused;
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.lock();
        if *state == PipelineState::Paused {
            *state = PipelineState::Running;
        }
    }

    pub fn request_step(&self) {
        self.step_requested.store(true, Ordering::SeqCst);
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    /// Runs the render loop until `shutdown()` is called or a fatal driver
    /// error occurs. Intended to be spawned as the crate's single RENDER
    /// task (spec §4.9's critical-task category).
    pub async fn run(self: Arc<Self>) -> Result<(), HardwareError> {
        loop {
            match self.state() {
                PipelineState::Stopping => {
                    *self.state.lock() = PipelineState::Stopped;
                    return Ok(());
                }
                PipelineState::Stopped => return Ok(()),
                PipelineState::Paused => {
                    if self.step_requested.swap(false, Ordering::SeqCst) {
                        self.tick().await?;
                    } else {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
                PipelineState::Initializing | PipelineState::Running => {
                    let tick_start = Instant::now();
                    self.tick().await?;
                    let elapsed = tick_start.elapsed();
                    if elapsed < self.tick_period {
                        tokio::time::sleep(self.tick_period - elapsed).await;
                    }
                }
            }
        }
    }

    /// Requests the render loop stop, and waits for it to drain its
    /// in-flight apply and reach `Stopped` (spec §4.5.6).
    pub async fn shutdown(&self) {
        *self.state.lock() = PipelineState::Stopping;
        // The loop only notifies once it observes `Stopping`, which can be
        // up to one `tick_period` away; polling keeps this simple without
        // a second coordination primitive.
        while self.state() != PipelineState::Stopped {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    pub fn shutdown_strips(&self) {
        let mut strips = self.strips.lock();
        for (_, entry) in strips.drain() {
            entry.worker.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::Color;
    use crate::config::{SystemConfig, ZoneConfig};
    use crate::event_bus::EventBus;
    use crate::frame::SourceTag;
    use crate::snapshot::SnapshotStore;
    use crate::strip_driver::SimulatedStrip;
    use std::collections::HashMap as Map;

    fn config() -> Arc<StaticConfig> {
        Arc::new(StaticConfig {
            zones: vec![
                ZoneConfig {
                    id: "z1".into(),
                    display_name: "Z1".into(),
                    pixel_count: 10,
                    gpio_pin: 18,
                    strip: "s1".into(),
                    pixel_index_range: 0..10,
                    layout: None,
                },
                ZoneConfig {
                    id: "z2".into(),
                    display_name: "Z2".into(),
                    pixel_count: 10,
                    gpio_pin: 19,
                    strip: "s1".into(),
                    pixel_index_range: 10..20,
                    layout: None,
                },
            ],
            presets: vec![],
            animations: vec![],
            system: SystemConfig::default(),
        })
    }

    fn zone_service(config: Arc<StaticConfig>) -> Arc<ZoneService> {
        let bus = Arc::new(EventBus::new());
        let dir = std::env::temp_dir().join(format!("ledctl-pipe-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let snapshots = Arc::new(SnapshotStore::open(dir.join("snap.json"), Duration::from_secs(60)));
        Arc::new(ZoneService::new(config, bus, snapshots))
    }

    #[tokio::test]
    async fn priority_overlay_picks_highest() {
        let config = config();
        let zones = zone_service(config.clone());
        let pipeline = FramePipeline::new(config, zones);
        pipeline.register_strip("s1".into(), || SimulatedStrip::new("s1"));

        let mut low = Map::new();
        low.insert(crate::ids::ZoneId::from("z1"), Color::rgb(0, 255, 0));
        pipeline.submit(Frame::zone_update(
            low,
            Priority::Animation,
            Duration::from_secs(1),
            SourceTag::Animation("a".into()),
        ));

        let mut high = Map::new();
        high.insert(crate::ids::ZoneId::from("z1"), Color::rgb(255, 0, 0));
        pipeline.submit(Frame::zone_update(
            high,
            Priority::Transition,
            Duration::from_secs(1),
            SourceTag::Transition,
        ));

        pipeline.tick().await.unwrap();
        let buffers = pipeline.last_rendered.lock();
        let buf = &buffers[&crate::ids::StripId::from("s1")];
        assert_eq!(buf[0], (255, 0, 0));
        // z2 untouched by either frame, stays at its previous (black) state.
        assert_eq!(buf[10], (0, 0, 0));
    }

    #[tokio::test]
    async fn stale_frame_is_dropped_not_fallen_through() {
        let config = config();
        let zones = zone_service(config.clone());
        let pipeline = FramePipeline::new(config, zones);
        pipeline.register_strip("s1".into(), || SimulatedStrip::new("s1"));

        let mut updates = Map::new();
        updates.insert(crate::ids::ZoneId::from("z1"), Color::rgb(1, 2, 3));
        let mut frame = Frame::zone_update(
            updates,
            Priority::Transition,
            Duration::from_millis(1),
            SourceTag::Transition,
        );
        frame.submitted_at -= Duration::from_millis(5);
        // Bypass `submit`'s own staleness check to simulate a frame that
        // went stale while queued, not at submission time.
        pipeline.queues[Priority::Transition.index()].lock().push_back(frame);

        pipeline.tick().await.unwrap();
        let buffers = pipeline.last_rendered.lock();
        let buf = &buffers[&crate::ids::StripId::from("s1")];
        assert_eq!(buf[0], (0, 0, 0));
    }

    #[tokio::test]
    async fn off_zone_always_renders_black() {
        let config = config();
        let zones = zone_service(config.clone());
        zones
            .set_enabled(
                &crate::ids::ZoneId::from("z1"),
                false,
                None,
                crate::event::SourceType::Internal,
            )
            .unwrap();
        let pipeline = FramePipeline::new(config, zones);
        pipeline.register_strip("s1".into(), || SimulatedStrip::new("s1"));

        let mut updates = Map::new();
        updates.insert(crate::ids::ZoneId::from("z1"), Color::rgb(255, 255, 255));
        pipeline.submit(Frame::zone_update(
            updates,
            Priority::Debug,
            Duration::from_secs(1),
            SourceTag::Debug,
        ));

        pipeline.tick().await.unwrap();
        let buffers = pipeline.last_rendered.lock();
        let buf = &buffers[&crate::ids::StripId::from("s1")];
        assert_eq!(buf[0], (0, 0, 0));
    }

    #[tokio::test]
    async fn brightness_does_not_compound_across_ticks() {
        let config = config();
        let zones = zone_service(config.clone());
        zones
            .set_brightness(&crate::ids::ZoneId::from("z1"), 50, None, crate::event::SourceType::Internal)
            .unwrap();
        let pipeline = FramePipeline::new(config, zones);
        pipeline.register_strip("s1".into(), || SimulatedStrip::new("s1"));

        let mut updates = Map::new();
        updates.insert(crate::ids::ZoneId::from("z1"), Color::rgb(200, 200, 200));
        pipeline.submit(Frame::zone_update(
            updates,
            Priority::Manual,
            Duration::from_secs(10),
            SourceTag::Manual,
        ));

        pipeline.tick().await.unwrap();
        let first = pipeline.last_rendered.lock()[&crate::ids::StripId::from("s1")][0];

        // No new frame submitted: a steady zone must render the same
        // brightness-scaled value every subsequent tick, not decay.
        for _ in 0..10 {
            pipeline.tick().await.unwrap();
        }
        let later = pipeline.last_rendered.lock()[&crate::ids::StripId::from("s1")][0];
        assert_eq!(first, later);
        assert_eq!(first, (100, 100, 100));
    }

    #[tokio::test]
    async fn fatal_driver_error_surfaces_from_tick() {
        struct FailOnce(SimulatedStrip);
        impl StripDriver for FailOnce {
            fn apply(&mut self, pixels: &[Pixel]) -> Result<(), HardwareError> {
                self.0.apply(pixels)
            }
            fn shutdown(&mut self) {}
        }

        let config = config();
        let zones = zone_service(config.clone());
        let pipeline = FramePipeline::new(config, zones);
        let mut driver = SimulatedStrip::new("s1");
        driver.fail_next_apply(HardwareError::FatalDriver {
            strip: "s1".into(),
            reason: "boom".into(),
        });
        pipeline.register_strip("s1".into(), move || FailOnce(driver));

        pipeline.tick().await.unwrap(); // error surfaces on the worker's next recv, not instantly
        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = pipeline.tick().await;
        assert!(result.is_err());
    }
}
