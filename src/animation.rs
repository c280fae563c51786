//! Animation Engine (spec §4.6, C6). Owns per-zone producer tasks. The
//! `zone -> task` and `zone -> instance` maps are mutated under one
//! `parking_lot::Mutex`; per spec §4.6 and Design Notes §9, the awaited
//! cancellation of a replaced task happens *after* that lock is released,
//! so a slow-to-cancel old task can never head-of-line-block a concurrent
//! `start`/`stop` on a different zone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::color::Color;
use crate::config::StaticConfig;
use crate::error::AnimationError;
use crate::event::{Event, EventKind, SourceType};
use crate::event_bus::EventBus;
use crate::frame::{Frame, FrameBody, Priority, SourceTag};
use crate::ids::{AnimationId, ParameterId, ZoneId};
use crate::pipeline::FramePipeline;

/// Per-zone animation cadence/output contract. Algorithm bodies are
/// otherwise out of scope (spec §1); `SolidPulse` below exists only to
/// exercise this contract in tests (config fixtures name it `"breathe"`
/// purely as a representative animation id, not a distinct algorithm).
pub trait Animation: Send {
    fn step(&mut self, now: Instant, params: &HashMap<ParameterId, f64>) -> Option<Frame>;
    fn cadence(&self) -> Duration {
        Duration::from_millis(16)
    }
}

const IDLE_QUANTUM: Duration = Duration::from_millis(5);
const CANCEL_TIMEOUT: Duration = Duration::from_secs(1);

struct AnimationSlot {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
    params: Arc<Mutex<HashMap<ParameterId, f64>>>,
}

pub struct AnimationEngine {
    config: Arc<StaticConfig>,
    pipeline: Arc<FramePipeline>,
    bus: Arc<EventBus>,
    slots: Mutex<HashMap<ZoneId, AnimationSlot>>,
}

pub type AnimationFactory =
    Arc<dyn Fn(&AnimationId) -> Option<Box<dyn Animation>> + Send + Sync>;

impl AnimationEngine {
    pub fn new(config: Arc<StaticConfig>, pipeline: Arc<FramePipeline>, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            pipeline,
            bus,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Starts `animation_id` on `zone`. If one is already running there it
    /// is stopped atomically first: the invariant is that at no observable
    /// instant does a zone have two live producer tasks (spec §4.6, §8
    /// invariant 2).
    pub async fn start(
        &self,
        zone: ZoneId,
        animation_id: AnimationId,
        params: HashMap<ParameterId, f64>,
        make_animation: AnimationFactory,
    ) -> Result<(), AnimationError> {
        let animation_cfg = self
            .config
            .animation(&animation_id)
            .ok_or_else(|| AnimationError::UnknownAnimation(animation_id.clone()))?;

        let mut resolved = HashMap::new();
        for spec in &animation_cfg.parameters {
            let value = params.get(&spec.id).copied().unwrap_or(spec.default);
            if value < spec.min || value > spec.max {
                return Err(AnimationError::ParamOutOfRange {
                    param: spec.id.clone(),
                    value,
                    min: spec.min,
                    max: spec.max,
                });
            }
            resolved.insert(spec.id.clone(), value);
        }
        for key in params.keys() {
            if !resolved.contains_key(key) {
                return Err(AnimationError::UnknownParam(key.clone(), animation_id.clone()));
            }
        }

        let mut animation = make_animation(&animation_id)
            .ok_or_else(|| AnimationError::UnknownAnimation(animation_id.clone()))?;

        let shared_params = Arc::new(Mutex::new(resolved));
        let cancel = CancellationToken::new();
        // The new task parks here until the critical section below has
        // fully cancelled and awaited the previous occupant (if any): a
        // `Notify::notify_one` permit is stored even if sent before this
        // task is first polled, so there is no race between spawning and
        // gating (spec §4.6, §8 invariant 2: never two live producers).
        let start_gate = Arc::new(tokio::sync::Notify::new());
        let pipeline = self.pipeline.clone();
        let task_zone = zone.clone();
        let task_cancel = cancel.clone();
        let task_params = shared_params.clone();
        let task_gate = start_gate.clone();

        let handle = tokio::spawn(async move {
            task_gate.notified().await;
            loop {
                if task_cancel.is_cancelled() {
                    break;
                }
                let params_snapshot = task_params.lock().clone();
                let produced = animation.step(Instant::now(), &params_snapshot);
                let sleep_for = match produced {
                    Some(frame) => {
                        pipeline.submit(frame);
                        animation.cadence()
                    }
                    None => IDLE_QUANTUM,
                };
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = tokio::time::sleep(sleep_for) => {}
                }
            }
            tracing::debug!(zone = %task_zone, "animation producer task exiting");
        });

        // Critical section: decide-and-mutate only. The old task's
        // cancellation is signaled here (non-blocking) but awaited below,
        // outside the lock.
        let previous = {
            let mut slots = self.slots.lock();
            let previous = slots.remove(&zone);
            if let Some(previous) = &previous {
                previous.cancel.cancel();
            }
            slots.insert(
                zone.clone(),
                AnimationSlot {
                    cancel,
                    handle,
                    params: shared_params,
                },
            );
            previous
        };

        if let Some(previous) = previous {
            if tokio::time::timeout(CANCEL_TIMEOUT, previous.handle).await.is_err() {
                tracing::warn!(zone = %zone, "animation cancel timed out, abandoning task");
                self.bus
                    .publish(Event::internal(EventKind::AnimationCancelTimeout {
                        zone: zone.clone(),
                    }))
                    .await;
            }
        }

        // Only now may the replacement actually start producing frames:
        // the previous occupant, if any, has fully terminated (or been
        // abandoned past its cancel timeout) by this point.
        start_gate.notify_one();

        self.bus
            .publish(Event::internal(EventKind::AnimationStarted {
                zone,
                animation: animation_id,
            }))
            .await;
        Ok(())
    }

    /// Stops whatever is running on `zone`, if anything. Idempotent: a
    /// second call on an already-stopped zone is a no-op success (spec §8
    /// invariant 9).
    pub async fn stop(&self, zone: ZoneId) {
        let slot = {
            let mut slots = self.slots.lock();
            let slot = slots.remove(&zone);
            if let Some(slot) = &slot {
                slot.cancel.cancel();
            }
            slot
        };

        let Some(slot) = slot else {
            return;
        };
        if tokio::time::timeout(CANCEL_TIMEOUT, slot.handle).await.is_err() {
            tracing::warn!(zone = %zone, "animation cancel timed out, abandoning task");
            self.bus
                .publish(Event::internal(EventKind::AnimationCancelTimeout {
                    zone: zone.clone(),
                }))
                .await;
        }
        self.bus
            .publish(Event::internal(EventKind::AnimationStopped { zone }))
            .await;
    }

    pub async fn stop_all(&self) {
        let zones: Vec<ZoneId> = self.slots.lock().keys().cloned().collect();
        for zone in zones {
            self.stop(zone).await;
        }
    }

    /// Live parameter update, visible on the animation's next produced
    /// frame (spec §4.6).
    pub fn set_param(&self, zone: &ZoneId, param: ParameterId, value: f64) -> Result<(), AnimationError> {
        let slots = self.slots.lock();
        let slot = slots
            .get(zone)
            .ok_or_else(|| AnimationError::NotRunning(zone.clone()))?;
        slot.params.lock().insert(param, value);
        Ok(())
    }

    pub fn is_running(&self, zone: &ZoneId) -> bool {
        self.slots.lock().contains_key(zone)
    }
}

/// Pulses a single color on/off at a fixed period. Used in tests only.
pub struct SolidPulse {
    pub zone: ZoneId,
    pub color: Color,
    pub period: Duration,
    pub started_at: Option<Instant>,
}

impl Animation for SolidPulse {
    fn step(&mut self, now: Instant, params: &HashMap<ParameterId, f64>) -> Option<Frame> {
        let started_at = *self.started_at.get_or_insert(now);
        let period_ms = params
            .get(&ParameterId::from("period_ms"))
            .copied()
            .unwrap_or(self.period.as_millis() as f64)
            .max(1.0);
        let elapsed = now.duration_since(started_at).as_millis() as f64;
        let phase = (elapsed % (period_ms * 2.0)) / period_ms;
        let on = phase < 1.0;
        let mut updates = HashMap::new();
        updates.insert(
            self.zone.clone(),
            if on { self.color.clone() } else { Color::rgb(0, 0, 0) },
        );
        Some(Frame::zone_update(
            updates,
            Priority::Animation,
            Duration::from_millis(200),
            SourceTag::Animation(AnimationId::from("solid_pulse")),
        ))
    }

    fn cadence(&self) -> Duration {
        Duration::from_millis(33)
    }
}
