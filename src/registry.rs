//! Task Registry & Lifecycle Coordinator (spec §4.9, C9). Every long-running
//! task in the crate is registered here before its first suspension point;
//! the coordinator watches a fixed set of "critical" categories and turns an
//! exceptional termination of one into an immediate prioritized shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::event::ShutdownReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskCategory {
    Api,
    Hardware,
    Render,
    Animation,
    Input,
    EventBus,
    Transition,
    Background,
    General,
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl TaskCategory {
    /// Categories the coordinator watches for immediate prioritized
    /// shutdown on exceptional termination (spec §4.9).
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            TaskCategory::Api | TaskCategory::Hardware | TaskCategory::Render | TaskCategory::Input
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

#[derive(Debug, Clone)]
pub enum TerminalState {
    Cancelled,
    FailedWith(String),
    Succeeded,
}

pub struct TaskRecord {
    pub id: TaskId,
    pub category: TaskCategory,
    pub description: String,
    pub created_at: Instant,
    pub terminal: Mutex<Option<TerminalState>>,
}

/// Tracks every registered task and its eventual terminal state (spec §3's
/// `TaskRecord`, invariant 5 of spec §8: every task terminates with exactly
/// one of Cancelled/FailedWith/Succeeded).
pub struct TaskRegistry {
    tasks: Mutex<HashMap<TaskId, Arc<TaskRecord>>>,
    next_id: AtomicU64,
    shutdown_tx: mpsc::UnboundedSender<ShutdownReason>,
}

impl TaskRegistry {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ShutdownReason>) {
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tasks: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                shutdown_tx,
            }),
            shutdown_rx,
        )
    }

    fn register(&self, category: TaskCategory, description: impl Into<String>) -> Arc<TaskRecord> {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let record = Arc::new(TaskRecord {
            id,
            category,
            description: description.into(),
            created_at: Instant::now(),
            terminal: Mutex::new(None),
        });
        self.tasks.lock().insert(id, record.clone());
        record
    }

    /// Spawns `fut` as a tracked task. The task is registered before
    /// `fut` starts, satisfying spec §3's "registered before first
    /// suspension" invariant. Its `Result` becomes the terminal state;
    /// exceptional termination of a critical-category task triggers an
    /// immediate shutdown request.
    pub fn spawn_tracked<F>(
        self: &Arc<Self>,
        category: TaskCategory,
        description: impl Into<String>,
        fut: F,
    ) -> TaskId
    where
        F: Future<Output = Result<(), crate::event::TaskError>> + Send + 'static,
    {
        let record = self.register(category, description);
        let id = record.id;
        let registry = self.clone();
        tokio::spawn(async move {
            let outcome = fut.await;
            let (terminal, failure) = match outcome {
                Ok(()) => (TerminalState::Succeeded, None),
                Err(err) => (TerminalState::FailedWith(err.to_string()), Some(err.to_string())),
            };
            *record.terminal.lock() = Some(terminal);

            if let Some(error) = failure {
                if category.is_critical() {
                    let _ = registry.shutdown_tx.send(ShutdownReason::TaskFailure {
                        category,
                        description: record.description.clone(),
                        error,
                    });
                }
            }
        });
        id
    }

    /// Marks a task cancelled without having run it through `spawn_tracked`
    /// (used by components, like the Animation Engine, that manage their
    /// own `JoinHandle` lifecycle but still want the task visible here).
    pub fn mark_cancelled(&self, id: TaskId) {
        if let Some(record) = self.tasks.lock().get(&id) {
            *record.terminal.lock() = Some(TerminalState::Cancelled);
        }
    }

    pub fn all(&self) -> Vec<Arc<TaskRecord>> {
        self.tasks.lock().values().cloned().collect()
    }

    pub fn active(&self) -> Vec<Arc<TaskRecord>> {
        self.tasks
            .lock()
            .values()
            .filter(|r| r.terminal.lock().is_none())
            .cloned()
            .collect()
    }

    pub fn failed(&self) -> Vec<Arc<TaskRecord>> {
        self.tasks
            .lock()
            .values()
            .filter(|r| matches!(*r.terminal.lock(), Some(TerminalState::FailedWith(_))))
            .cloned()
            .collect()
    }

    pub fn by_category(&self, category: TaskCategory) -> Vec<Arc<TaskRecord>> {
        self.tasks
            .lock()
            .values()
            .filter(|r| r.category == category)
            .cloned()
            .collect()
    }

    pub fn request_shutdown(&self, reason: ShutdownReason) {
        let _ = self.shutdown_tx.send(reason);
    }
}

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type ShutdownHandlerFn = Arc<dyn Fn() -> BoxFuture + Send + Sync>;

struct ShutdownHandler {
    priority: i32,
    name: String,
    timeout: Duration,
    run: ShutdownHandlerFn,
}

/// Drives the prioritized shutdown sequence (spec §4.9 steps 1-4). Handlers
/// are recommended at priorities 100 (LED clear), 90 (API server), 80
/// (animation stop-all), 40 (explicit task cancellation), 30 (registered
/// tasks safety net), 10 (GPIO release); any integer priority is accepted.
pub struct LifecycleCoordinator {
    registry: Arc<TaskRegistry>,
    handlers: Mutex<Vec<ShutdownHandler>>,
    global_timeout: Duration,
    per_handler_timeout: Duration,
}

#[derive(Debug)]
pub struct HandlerOutcome {
    pub name: String,
    pub ok: bool,
}

impl LifecycleCoordinator {
    pub fn new(registry: Arc<TaskRegistry>, global_timeout: Duration, per_handler_timeout: Duration) -> Self {
        Self {
            registry,
            handlers: Mutex::new(Vec::new()),
            global_timeout,
            per_handler_timeout,
        }
    }

    pub fn register_handler<F, Fut>(&self, priority: i32, name: impl Into<String>, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.lock().push(ShutdownHandler {
            priority,
            name: name.into(),
            timeout: self.per_handler_timeout,
            run: Arc::new(move || Box::pin(handler())),
        });
    }

    pub fn register_handler_with_timeout<F, Fut>(
        &self,
        priority: i32,
        name: impl Into<String>,
        timeout: Duration,
        handler: F,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.lock().push(ShutdownHandler {
            priority,
            name: name.into(),
            timeout,
            run: Arc::new(move || Box::pin(handler())),
        });
    }

    /// Runs every registered handler in descending priority order, each
    /// under its own timeout, within an overall `global_timeout`. A
    /// handler that fails or times out is logged and does not block the
    /// rest of the sequence (spec §7's shutdown resilience).
    pub async fn run_shutdown(&self, reason: ShutdownReason) -> Vec<HandlerOutcome> {
        tracing::warn!(%reason, "beginning prioritized shutdown");
        let mut handlers: Vec<(i32, String, Duration, ShutdownHandlerFn)> = self
            .handlers
            .lock()
            .iter()
            .map(|h| (h.priority, h.name.clone(), h.timeout, h.run.clone()))
            .collect();
        handlers.sort_by(|a, b| b.0.cmp(&a.0));

        let sequence = async {
            let mut outcomes = Vec::new();
            for (priority, name, timeout, run) in handlers {
                let ok = tokio::time::timeout(timeout, run()).await.is_ok();
                if !ok {
                    tracing::error!(handler = %name, priority, "shutdown handler timed out");
                }
                outcomes.push(HandlerOutcome { name, ok });
            }
            outcomes
        };

        match tokio::time::timeout(self.global_timeout, sequence).await {
            Ok(outcomes) => outcomes,
            Err(_) => {
                tracing::error!("global shutdown timeout exceeded; remaining handlers abandoned");
                Vec::new()
            }
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }
}

/// Abstraction over the "is a port free, and if not, can we reclaim it"
/// probe from spec §4.9. Locating and terminating the holder process is
/// inherently OS-specific; this crate supplies the portable `is_free`
/// check and leaves `reclaim` to a platform-specific implementation
/// supplied by the binary (the demo's default never reclaims, matching
/// "physical HTTP/WebSocket transport framing" being out of scope, spec §1).
pub trait PortProbe: Send + Sync {
    fn is_free(&self, port: u16) -> bool;
    fn reclaim(&self, _port: u16) -> bool {
        false
    }
}

pub struct TcpPortProbe;

impl PortProbe for TcpPortProbe {
    fn is_free(&self, port: u16) -> bool {
        std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
    }
}

/// Runs the probe/reclaim/re-probe sequence (spec §4.9's port reclamation):
/// probe, and if occupied, make one reclamation attempt before re-probing.
pub fn ensure_port_free(probe: &dyn PortProbe, port: u16) -> Result<(), crate::error::ShutdownError> {
    if probe.is_free(port) {
        return Ok(());
    }
    tracing::warn!(port, "port occupied at startup, attempting reclamation");
    probe.reclaim(port);
    if probe.is_free(port) {
        Ok(())
    } else {
        Err(crate::error::ShutdownError::PortOccupied { port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn critical_task_failure_triggers_shutdown_request() {
        let (registry, mut shutdown_rx) = TaskRegistry::new();
        registry.spawn_tracked(TaskCategory::Render, "render loop", async {
            Err(crate::event::TaskError::Other("boom".into()))
        });
        let reason = tokio::time::timeout(Duration::from_secs(1), shutdown_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(reason, ShutdownReason::TaskFailure { category: TaskCategory::Render, .. }));
    }

    #[tokio::test]
    async fn non_critical_failure_does_not_trigger_shutdown() {
        let (registry, mut shutdown_rx) = TaskRegistry::new();
        registry.spawn_tracked(TaskCategory::Background, "cleanup", async {
            Err(crate::event::TaskError::Other("boom".into()))
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(shutdown_rx.try_recv().is_err());
        assert_eq!(registry.failed().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_handlers_run_in_descending_priority_order() {
        let (registry, _rx) = TaskRegistry::new();
        let coordinator = LifecycleCoordinator::new(registry, Duration::from_secs(5), Duration::from_secs(1));
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        coordinator.register_handler(10, "gpio-release", move || {
            let o1 = o1.clone();
            async move { o1.lock().push("gpio") }
        });
        let o2 = order.clone();
        coordinator.register_handler(100, "led-clear", move || {
            let o2 = o2.clone();
            async move { o2.lock().push("led") }
        });

        coordinator.run_shutdown(ShutdownReason::Explicit).await;
        assert_eq!(*order.lock(), vec!["led", "gpio"]);
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_the_rest() {
        let (registry, _rx) = TaskRegistry::new();
        let coordinator = LifecycleCoordinator::new(registry, Duration::from_secs(5), Duration::from_millis(20));
        let ran = Arc::new(AtomicBool::new(false));

        coordinator.register_handler_with_timeout(90, "stuck", Duration::from_millis(10), || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        });
        let ran2 = ran.clone();
        coordinator.register_handler(10, "quick", move || {
            let ran2 = ran2.clone();
            async move { ran2.store(true, Ordering::SeqCst) }
        });

        let outcomes = coordinator.run_shutdown(ShutdownReason::Explicit).await;
        assert!(ran.load(Ordering::SeqCst));
        assert!(!outcomes[0].ok);
        assert!(outcomes[1].ok);
    }

    #[test]
    fn tcp_probe_detects_free_port() {
        let probe = TcpPortProbe;
        // Bind to an ephemeral port, then check that same bound port is
        // reported occupied while held.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!probe.is_free(port));
        drop(listener);
        assert!(probe.is_free(port));
    }
}
