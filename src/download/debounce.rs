// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Coalesced snapshot persistence.
//!
//! Progress ticks arrive far faster than it is reasonable to rewrite the
//! state document. Ticks are parked in a pending map and flushed together
//! at the end of a fixed window that opens on the first tick after a
//! flush. State transitions (begin, pause, resume, terminal clears) go
//! through [`SnapshotWriter::write_now`] / [`SnapshotWriter::clear_now`],
//! which drop any parked tick for the same model and hit the store
//! immediately.
//!
//! The pending lock is taken before the store lock on every path, so a
//! flush can never resurrect a snapshot that was cleared while it ran.
//! Clearing also retires the download id for that model: a tick computed
//! before the clear but handed in after it is dropped instead of written.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;

use super::state::StateStore;
use super::types::{DownloadId, ModelName, ProgressSnapshot};
use crate::sync::{resilient_read, resilient_write};

#[derive(Default)]
struct Pending {
    snapshots: HashMap<ModelName, ProgressSnapshot>,
    /// Highest cleared download id per model
    retired: HashMap<ModelName, DownloadId>,
    flush_scheduled: bool,
}

impl Pending {
    fn is_retired(&self, snapshot: &ProgressSnapshot) -> bool {
        self.retired
            .get(&snapshot.model_name)
            .is_some_and(|&id| snapshot.download_id <= id)
    }
}

pub struct SnapshotWriter {
    store: Arc<StateStore>,
    window: Duration,
    pending: RwLock<Pending>,
}

impl SnapshotWriter {
    pub fn new(store: Arc<StateStore>, window: Duration) -> Self {
        Self {
            store,
            window,
            pending: RwLock::new(Pending::default()),
        }
    }

    /// Park a progress snapshot; it is persisted when the window closes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(self: &Arc<Self>, snapshot: ProgressSnapshot) {
        let mut pending = resilient_write(&self.pending);
        if pending.is_retired(&snapshot) {
            tracing::trace!(model = %snapshot.model_name, "Dropping tick for a cleared download");
            return;
        }
        pending
            .snapshots
            .insert(snapshot.model_name.clone(), snapshot);
        if pending.flush_scheduled {
            return;
        }
        pending.flush_scheduled = true;
        drop(pending);

        let writer = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(writer.window).await;
            if let Err(e) = writer.flush() {
                tracing::warn!("Failed to persist coalesced progress: {:#}", e);
            }
        });
    }

    /// Persist every parked snapshot now.
    pub fn flush(&self) -> Result<()> {
        let mut pending = resilient_write(&self.pending);
        pending.flush_scheduled = false;
        let batch: Vec<_> = pending.snapshots.drain().map(|(_, s)| s).collect();
        if batch.is_empty() {
            return Ok(());
        }
        tracing::trace!(count = batch.len(), "Flushing progress snapshots");
        self.store.upsert_snapshots(batch)
    }

    /// Persist a snapshot immediately, superseding any parked tick.
    /// Ignored once the download has been cleared.
    pub fn write_now(&self, snapshot: ProgressSnapshot) -> Result<()> {
        let mut pending = resilient_write(&self.pending);
        if pending.is_retired(&snapshot) {
            tracing::trace!(model = %snapshot.model_name, "Dropping write for a cleared download");
            return Ok(());
        }
        pending.snapshots.remove(&snapshot.model_name);
        self.store.upsert_snapshot(snapshot)
    }

    /// Remove the snapshot of download `id` immediately, discarding any
    /// parked tick. A snapshot that already belongs to a newer download of
    /// the same model is left alone.
    pub fn clear_now(&self, name: &ModelName, id: DownloadId) -> Result<()> {
        let mut pending = resilient_write(&self.pending);
        if pending.snapshots.get(name).is_some_and(|s| s.download_id <= id) {
            pending.snapshots.remove(name);
        }
        let retired = pending.retired.entry(name.clone()).or_insert(id);
        *retired = (*retired).max(id);

        if self.store.snapshot(name).is_some_and(|s| s.download_id > id) {
            return Ok(());
        }
        self.store.remove_snapshot(name).map(|_| ())
    }

    /// Number of snapshots waiting for the window to close.
    pub fn pending_len(&self) -> usize {
        resilient_read(&self.pending).snapshots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::types::DownloadStatus;
    use chrono::Utc;
    use tempfile::TempDir;

    fn snapshot(progress: u8) -> ProgressSnapshot {
        ProgressSnapshot {
            model_name: ModelName::parse("m.gguf").unwrap(),
            download_id: DownloadId(1),
            progress,
            bytes_downloaded: progress as u64,
            bytes_total: 100,
            status: DownloadStatus::Downloading,
            is_paused: false,
            origin_url: None,
            updated_at: Utc::now(),
        }
    }

    fn writer(dir: &TempDir, window: Duration) -> (Arc<StateStore>, Arc<SnapshotWriter>) {
        let store = Arc::new(StateStore::open(dir.path().join("state.json")).expect("open"));
        let writer = Arc::new(SnapshotWriter::new(Arc::clone(&store), window));
        (store, writer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_coalesce_into_one_write() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (store, writer) = writer(&dir, Duration::from_millis(500));
        let name = ModelName::parse("m.gguf").unwrap();

        for pct in [10, 20, 30] {
            writer.schedule(snapshot(pct));
        }
        assert_eq!(writer.pending_len(), 1);
        assert!(store.snapshot(&name).is_none(), "nothing written inside the window");

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(store.snapshot(&name).unwrap().progress, 30);
        assert_eq!(writer.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_beats_pending_flush() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (store, writer) = writer(&dir, Duration::from_millis(500));
        let name = ModelName::parse("m.gguf").unwrap();

        writer.write_now(snapshot(0)).unwrap();
        writer.schedule(snapshot(50));
        writer.clear_now(&name, DownloadId(1)).unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(store.snapshot(&name).is_none(), "cleared snapshot must stay cleared");
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_tick_after_clear_is_dropped() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (store, writer) = writer(&dir, Duration::from_millis(500));
        let name = ModelName::parse("m.gguf").unwrap();

        writer.write_now(snapshot(0)).unwrap();
        writer.clear_now(&name, DownloadId(1)).unwrap();
        // Computed before the clear, delivered after it
        writer.schedule(snapshot(60));
        writer.write_now(snapshot(61)).unwrap();
        assert_eq!(writer.pending_len(), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(store.snapshot(&name).is_none());

        // A newer download of the same model is unaffected
        let mut next = snapshot(5);
        next.download_id = DownloadId(2);
        writer.schedule(next);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(store.snapshot(&name).unwrap().download_id, DownloadId(2));
    }

    #[tokio::test]
    async fn test_stale_clear_keeps_newer_snapshot() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (store, writer) = writer(&dir, Duration::from_secs(60));
        let name = ModelName::parse("m.gguf").unwrap();

        let mut newer = snapshot(10);
        newer.download_id = DownloadId(7);
        writer.write_now(newer).unwrap();
        writer.clear_now(&name, DownloadId(3)).unwrap();

        assert_eq!(store.snapshot(&name).unwrap().download_id, DownloadId(7));
    }

    #[tokio::test]
    async fn test_write_now_supersedes_parked_tick() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (store, writer) = writer(&dir, Duration::from_secs(60));
        let name = ModelName::parse("m.gguf").unwrap();

        writer.schedule(snapshot(40));
        let mut paused = snapshot(40);
        paused.is_paused = true;
        writer.write_now(paused).unwrap();

        assert_eq!(writer.pending_len(), 0);
        assert!(store.snapshot(&name).unwrap().is_paused);
    }
}
