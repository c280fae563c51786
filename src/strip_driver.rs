//! Strip Driver Abstraction (spec §4.1, C1). `StripDriver` is the
//! boundary to GPIO/DMA internals, which are explicitly out of scope
//! (spec §1). `StripWorker` owns one driver instance on a dedicated OS
//! thread and exposes only a non-blocking `submit`, so render-loop code
//! never calls a blocking function directly (spec §5).

use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::HardwareError;
use crate::mailbox::{mailbox, MailboxSender};

pub type Pixel = (u8, u8, u8);

/// Implementations MUST serialize `apply` calls (hardware requires
/// single-threaded DMA access) and complete within a bounded budget
/// (~2.75ms typical, spec §4.1). `StripWorker` upholds the serialization by
/// construction: only its one dedicated thread ever calls `apply`.
pub trait StripDriver: Send {
    fn apply(&mut self, pixels: &[Pixel]) -> Result<(), HardwareError>;
    fn shutdown(&mut self);
}

/// In-memory driver used by tests and the demo binary. Never touches real
/// GPIO; a real WS281x backend (e.g. an `rs_ws281x`-style crate) would
/// implement the same trait behind a feature flag, which this crate does
/// not enable by default since GPIO driver internals are out of scope
/// (spec §1).
pub struct SimulatedStrip {
    pub name: String,
    pub last_applied: Vec<Pixel>,
    fail_next: Option<HardwareError>,
}

impl SimulatedStrip {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last_applied: Vec::new(),
            fail_next: None,
        }
    }

    pub fn fail_next_apply(&mut self, err: HardwareError) {
        self.fail_next = Some(err);
    }
}

impl StripDriver for SimulatedStrip {
    fn apply(&mut self, pixels: &[Pixel]) -> Result<(), HardwareError> {
        if let Some(err) = self.fail_next.take() {
            return Err(err);
        }
        self.last_applied = pixels.to_vec();
        Ok(())
    }

    fn shutdown(&mut self) {}
}

/// Owns a `StripDriver` on a dedicated OS thread. The render loop sends
/// composed buffers through a single-slot mailbox (spec §5: capacity 1,
/// newest wins) and never blocks.
pub struct StripWorker {
    sender: MailboxSender<Vec<Pixel>>,
    handle: Option<JoinHandle<()>>,
}

impl StripWorker {
    pub fn spawn<D, F>(strip_name: String, make_driver: F, hardware_floor: Duration) -> (Self, std::sync::mpsc::Receiver<HardwareError>)
    where
        D: StripDriver + 'static,
        F: FnOnce() -> D + Send + 'static,
    {
        let (tx, rx) = mailbox::<Vec<Pixel>>();
        let (err_tx, err_rx) = std::sync::mpsc::channel();
        let worker_rx = rx;
        let handle = std::thread::Builder::new()
            .name(format!("strip-worker-{strip_name}"))
            .spawn(move || {
                let mut driver = make_driver();
                let mut last_apply = std::time::Instant::now() - hardware_floor;
                while let Some(pixels) = worker_rx.recv_blocking() {
                    let elapsed = last_apply.elapsed();
                    if elapsed < hardware_floor {
                        std::thread::sleep(hardware_floor - elapsed);
                    }
                    match driver.apply(&pixels) {
                        Ok(()) => {}
                        Err(err @ HardwareError::TransientIO { .. }) => {
                            tracing::warn!(strip = %strip_name, %err, "transient driver error");
                            let _ = err_tx.send(err);
                        }
                        Err(err @ HardwareError::FatalDriver { .. }) => {
                            tracing::error!(strip = %strip_name, %err, "fatal driver error");
                            let _ = err_tx.send(err);
                            break;
                        }
                    }
                    last_apply = std::time::Instant::now();
                }
                driver.shutdown();
            })
            .expect("failed to spawn strip worker thread");

        (
            Self {
                sender: tx,
                handle: Some(handle),
            },
            err_rx,
        )
    }

    pub fn submit(&self, pixels: Vec<Pixel>) {
        self.sender.send(pixels);
    }

    /// Signals the worker to stop after draining its current in-flight
    /// apply, and joins the thread (spec §4.5.6: shutdown "drains in-flight
    /// apply").
    pub fn shutdown(mut self) {
        self.sender.close();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
