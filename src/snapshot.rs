//! Persistence (spec §4.3's persistence contract, §6's snapshot document,
//! §9's "one owner of the snapshot file"). `SnapshotStore` is the *only*
//! component in this crate that reads or writes the snapshot file; the Zone
//! Service holds one and never opens the file itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::error::SnapshotError;
use crate::ids::ZoneId;
use crate::zone::ZoneState;

pub const CURRENT_SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GlobalSnapshot {
    pub selected_zone: Option<ZoneId>,
    pub power_on: bool,
}

/// The single persisted document (spec §6). `#[serde(default)]` on new
/// fields plus `#[serde(flatten)]`-free unknown-field tolerance (serde's
/// default behavior) keeps old snapshots forward-compatible: unknown
/// fields are ignored, missing ones default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub zones: HashMap<ZoneId, ZoneState>,
    pub global: GlobalSnapshot,
}

impl Snapshot {
    pub fn new(zones: HashMap<ZoneId, ZoneState>, global: GlobalSnapshot) -> Self {
        Self {
            version: CURRENT_SNAPSHOT_VERSION,
            zones,
            global,
        }
    }
}

/// Single owner of the snapshot file. `read()` is a one-shot boot-time
/// load; `schedule_write`/`flush` implement the debounce contract (spec
/// §4.3): every mutation reschedules the pending write `debounce_ms` out,
/// and `flush()` forces an immediate write (called on shutdown before
/// resource release, spec §4.9 step 4).
pub struct SnapshotStore {
    path: PathBuf,
    debounce: Duration,
    pending: Arc<AsyncMutex<Option<Snapshot>>>,
    reset_tx: mpsc::UnboundedSender<()>,
}

impl SnapshotStore {
    pub fn open(path: impl Into<PathBuf>, debounce: Duration) -> Self {
        let path = path.into();
        let pending: Arc<AsyncMutex<Option<Snapshot>>> = Arc::new(AsyncMutex::new(None));
        let (reset_tx, mut reset_rx) = mpsc::unbounded_channel::<()>();

        let debouncer_path = path.clone();
        let debouncer_pending = pending.clone();
        tokio::spawn(async move {
            loop {
                // Wait for the first reset signaling a pending write exists.
                if reset_rx.recv().await.is_none() {
                    return;
                }
                loop {
                    tokio::select! {
                        biased;
                        signal = reset_rx.recv() => {
                            if signal.is_none() {
                                return;
                            }
                            // Mutation arrived: restart the debounce window.
                            continue;
                        }
                        _ = tokio::time::sleep(debounce) => break,
                    }
                }
                let snapshot = debouncer_pending.lock().await.take();
                if let Some(snapshot) = snapshot {
                    if let Err(err) = write_to_path(&debouncer_path, &snapshot) {
                        tracing::error!(%err, "debounced snapshot write failed");
                    }
                }
            }
        });

        Self {
            path,
            debounce,
            pending,
            reset_tx,
        }
    }

    pub fn read(&self) -> Result<Option<Snapshot>, SnapshotError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&self.path)?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        if snapshot.version > CURRENT_SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion {
                found: snapshot.version,
                max_supported: CURRENT_SNAPSHOT_VERSION,
            });
        }
        Ok(Some(snapshot))
    }

    /// Records `snapshot` as the latest pending write and (re)starts the
    /// debounce timer. Cheap and non-blocking from the caller's point of
    /// view; the actual write happens on the debouncer task.
    pub async fn schedule_write(&self, snapshot: Snapshot) {
        *self.pending.lock().await = Some(snapshot);
        let _ = self.reset_tx.send(());
    }

    /// Forces an immediate write of whatever is pending, bypassing the
    /// debounce window. Called on shutdown (spec §4.9 step 4).
    pub async fn flush(&self) -> Result<(), SnapshotError> {
        let snapshot = self.pending.lock().await.take();
        if let Some(snapshot) = snapshot {
            write_to_path(&self.path, &snapshot)?;
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }
}

fn write_to_path(path: &Path, snapshot: &Snapshot) -> Result<(), SnapshotError> {
    let tmp = path.with_extension("tmp");
    let bytes = serde_json::to_vec_pretty(snapshot)?;
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::Color;
    use crate::zone::Mode;

    fn zone_state() -> ZoneState {
        ZoneState {
            color: Color::rgb(1, 2, 3),
            brightness: 50,
            is_on: true,
            mode: Mode::Static,
            active_animation_id: None,
            animation_param_values: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn flush_writes_immediately() {
        let dir = std::env::temp_dir().join(format!("ledctl-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("snapshot.json");
        let store = SnapshotStore::open(&path, Duration::from_secs(60));

        let mut zones = HashMap::new();
        zones.insert(ZoneId::from("z1"), zone_state());
        store
            .schedule_write(Snapshot::new(zones, GlobalSnapshot::default()))
            .await;
        store.flush().await.unwrap();

        let loaded = store.read().unwrap().expect("snapshot should exist");
        assert_eq!(loaded.zones.len(), 1);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn debounced_write_eventually_lands() {
        let dir = std::env::temp_dir().join(format!("ledctl-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("snapshot.json");
        let store = SnapshotStore::open(&path, Duration::from_millis(20));

        let mut zones = HashMap::new();
        zones.insert(ZoneId::from("z1"), zone_state());
        store
            .schedule_write(Snapshot::new(zones, GlobalSnapshot::default()))
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let loaded = store.read().unwrap().expect("debounced write should land");
        assert_eq!(loaded.zones.len(), 1);
        let _ = std::fs::remove_file(&path);
    }
}
