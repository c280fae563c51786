//! Dependency container (Design Notes §9: "no global mutable singleton — a
//! dependency container constructed at startup owns services and is
//! threaded through constructors"). Wires every component together and owns
//! the default shutdown-handler registration from spec §4.9.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;

use crate::animation::{AnimationEngine, AnimationFactory};
use crate::command::CommandBoundary;
use crate::config::StaticConfig;
use crate::error::ConfigError;
use crate::event::ShutdownReason;
use crate::event_bus::EventBus;
use crate::pipeline::FramePipeline;
use crate::registry::{HandlerOutcome, LifecycleCoordinator, TaskCategory, TaskRegistry};
use crate::snapshot::SnapshotStore;
use crate::strip_driver::StripDriver;
use crate::transition::{self, TransitionService};
use crate::zone_service::ZoneService;

pub struct Container {
    pub config: Arc<StaticConfig>,
    pub bus: Arc<EventBus>,
    pub zones: Arc<ZoneService>,
    pub snapshots: Arc<SnapshotStore>,
    pub pipeline: Arc<FramePipeline>,
    pub engine: Arc<AnimationEngine>,
    pub transitions: Arc<TransitionService>,
    pub registry: Arc<TaskRegistry>,
    pub coordinator: Arc<LifecycleCoordinator>,
    pub commands: Arc<CommandBoundary>,
    shutdown_rx: AsyncMutex<tokio::sync::mpsc::UnboundedReceiver<ShutdownReason>>,
}

impl Container {
    /// Validates `config` (spec §3's zone-range invariant) then builds
    /// every service in dependency order: bus and snapshot store first
    /// (nothing else can construct without them), then zone service, then
    /// the render/animation/transition trio, then the registry/coordinator
    /// and command boundary last since they reference everything else.
    pub fn new(
        config: Arc<StaticConfig>,
        snapshot_path: impl Into<std::path::PathBuf>,
        make_animation: AnimationFactory,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;

        let bus = Arc::new(EventBus::new());
        let snapshots = Arc::new(SnapshotStore::open(
            snapshot_path,
            Duration::from_millis(config.system.state_debounce_ms),
        ));
        let zones = Arc::new(ZoneService::new(config.clone(), bus.clone(), snapshots.clone()));
        let pipeline = Arc::new(FramePipeline::new(config.clone(), zones.clone()));
        let engine = Arc::new(AnimationEngine::new(config.clone(), pipeline.clone(), bus.clone()));
        let transitions = Arc::new(TransitionService::new(
            config.clone(),
            pipeline.clone(),
            zones.clone(),
        ));

        let (registry, shutdown_rx) = TaskRegistry::new();
        let coordinator = Arc::new(LifecycleCoordinator::new(
            registry.clone(),
            Duration::from_millis(config.system.shutdown_global_timeout_ms),
            Duration::from_millis(config.system.shutdown_per_handler_timeout_ms),
        ));
        let commands = CommandBoundary::new(&config, zones.clone(), pipeline.clone(), engine.clone(), &bus, make_animation);
        crate::static_controller::install(&bus, pipeline.clone(), zones.clone());

        let container = Arc::new(Self {
            config,
            bus,
            zones,
            snapshots,
            pipeline,
            engine,
            transitions,
            registry,
            coordinator,
            commands,
            shutdown_rx: AsyncMutex::new(shutdown_rx),
        });
        container.install_shutdown_handlers();
        Ok(container)
    }

    pub fn register_strip<D, F>(&self, strip: crate::ids::StripId, make_driver: F)
    where
        D: StripDriver + 'static,
        F: FnOnce() -> D + Send + 'static,
    {
        self.pipeline.register_strip(strip, make_driver);
    }

    /// Recommended priorities from spec §4.9: 100 LED clear (fade-out then
    /// blank), 80 animation stop-all, 30 the registered-tasks safety net.
    /// Priority 90 (API server) and 10 (GPIO release) are left to the
    /// binary, since the transport and GPIO ownership live outside this
    /// crate (spec §1's Non-goals).
    fn install_shutdown_handlers(self: &Arc<Self>) {
        let led_clear = self.clone();
        self.coordinator.register_handler(100, "led-clear", move || {
            let this = led_clear.clone();
            async move {
                transition::fade_out_all(&this.transitions, Duration::from_millis(400)).await;
                this.pipeline.shutdown().await;
                this.pipeline.shutdown_strips();
            }
        });

        let stop_animations = self.clone();
        self.coordinator.register_handler(80, "animation-stop-all", move || {
            let this = stop_animations.clone();
            async move { this.engine.stop_all().await }
        });

        let safety_net = self.clone();
        self.coordinator.register_handler(30, "registered-tasks-safety-net", move || {
            let this = safety_net.clone();
            async move {
                for task in this.registry.active() {
                    tracing::warn!(task = %task.description, category = ?task.category, "task still active at shutdown safety net");
                }
            }
        });
    }

    /// Spawns the render loop as a tracked RENDER task (spec §4.9 watches
    /// this category; its exceptional termination triggers shutdown).
    pub fn spawn_render_task(self: &Arc<Self>) {
        self.pipeline.start();
        let pipeline = self.pipeline.clone();
        self.registry.spawn_tracked(TaskCategory::Render, "frame pipeline render loop", async move {
            pipeline.run().await.map_err(crate::event::TaskError::from)
        });
    }

    /// Awaits the next shutdown trigger, whether from a critical-task
    /// failure or an explicit `request_shutdown` call.
    pub async fn wait_for_shutdown_reason(&self) -> ShutdownReason {
        self.shutdown_rx
            .lock()
            .await
            .recv()
            .await
            .unwrap_or(ShutdownReason::Explicit)
    }

    pub fn request_shutdown(&self, reason: ShutdownReason) {
        self.registry.request_shutdown(reason);
    }

    /// Runs the prioritized shutdown sequence then flushes the snapshot
    /// (spec §4.9 step 4: "persistence is flushed before resource release").
    pub async fn shutdown(&self, reason: ShutdownReason) -> Vec<HandlerOutcome> {
        let outcomes = self.coordinator.run_shutdown(reason).await;
        if let Err(err) = self.zones.flush().await {
            tracing::error!(%err, "final snapshot flush failed");
        }
        outcomes
    }
}
