//! A single-slot, newest-wins mailbox. Used for the strip-worker channel
//! (spec §5: "capacity 1 per strip: newer buffer replaces older") and
//! anywhere else a fast producer must never block on a slower consumer.
//!
//! `parking_lot::Mutex` + `Condvar` rather than a channel crate: the
//! consumer here is a dedicated blocking OS thread (spec §5's "one worker
//! thread per strip"), not an async task, so a condvar-guarded slot is the
//! idiomatic fit — the same shape the teacher reaches for with
//! `parking_lot::Mutex` guarding shared state touched from both an async
//! task and a blocking context (`comms::server`'s history `Mutex`).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

struct Inner<T> {
    slot: Mutex<Option<T>>,
    closed: Mutex<bool>,
    condvar: Condvar,
}

pub struct MailboxSender<T> {
    inner: Arc<Inner<T>>,
}

pub struct MailboxReceiver<T> {
    inner: Arc<Inner<T>>,
}

pub fn mailbox<T>() -> (MailboxSender<T>, MailboxReceiver<T>) {
    let inner = Arc::new(Inner {
        slot: Mutex::new(None),
        closed: Mutex::new(false),
        condvar: Condvar::new(),
    });
    (
        MailboxSender { inner: inner.clone() },
        MailboxReceiver { inner },
    )
}

impl<T> MailboxSender<T> {
    /// Never blocks. Replaces whatever was in the slot.
    pub fn send(&self, value: T) {
        *self.inner.slot.lock() = Some(value);
        self.inner.condvar.notify_one();
    }

    pub fn close(&self) {
        *self.inner.closed.lock() = true;
        self.inner.condvar.notify_all();
    }
}

impl<T> Clone for MailboxSender<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> MailboxReceiver<T> {
    /// Blocks the calling (OS) thread until a value is available or the
    /// mailbox is closed.
    pub fn recv_blocking(&self) -> Option<T> {
        let mut slot = self.inner.slot.lock();
        loop {
            if let Some(value) = slot.take() {
                return Some(value);
            }
            if *self.inner.closed.lock() {
                return None;
            }
            self.inner
                .condvar
                .wait_for(&mut slot, Duration::from_millis(250));
        }
    }
}
