// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Reconciliation sweeper.
//!
//! Brings the staging directory, the persisted snapshots and the library
//! back in line after a crash, a restart, or a transfer that finished
//! while nobody was listening. Runs at startup and then periodically.
//!
//! Pass 1 walks the staging directory. A staged file nobody owns is either
//! redundant (the library already has that name, so it is deleted) or a
//! finished orphan (promoted under a freshly allocated id). A file is
//! owned when a live transfer exists for it, or when a persisted snapshot
//! says the transfer is still short of its announced size. A staged file
//! named like a linked model is never promoted; it stays where it is.
//! Both the delete and the promotion first reserve the name in the live
//! map, so a download started mid-sweep is never touched.
//!
//! Pass 2 walks the persisted snapshots with no live transfer. If the
//! staged bytes are still there the transport is asked to reattach; if it
//! declines, the last known progress is re-broadcast so the UI can show
//! it. If the staged file is gone, the download is failed with
//! [`FILE_NOT_FOUND_REASON`] and its snapshot removed.
//!
//! Every step is safe to repeat; a second sweep over an unchanged
//! filesystem does nothing but re-broadcast.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::manager::{DownloadManager, ManagerInner, FILE_NOT_FOUND_REASON};
use super::transfer::TransferRequest;
use super::types::{DownloadId, DownloadStatus, ModelName, ProgressSnapshot, TransferRecord};
use crate::error::DepotResult;
use crate::events::DownloadProgressEvent;
use crate::library::FileEntry;
use crate::sync::{resilient_read, resilient_write};

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Orphaned staged files moved into the library
    pub promoted: Vec<ModelName>,
    /// Staged files deleted because the library already had them
    pub discarded: Vec<ModelName>,
    /// Persisted downloads re-broadcast without a live transfer
    pub resumed: Vec<ModelName>,
    /// Persisted downloads picked up again by the transport
    pub reattached: Vec<ModelName>,
    /// Persisted downloads whose staged file was gone
    pub failed: Vec<ModelName>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.promoted.is_empty()
            && self.discarded.is_empty()
            && self.resumed.is_empty()
            && self.reattached.is_empty()
            && self.failed.is_empty()
    }

    fn merge(&mut self, other: SweepReport) {
        self.promoted.extend(other.promoted);
        self.discarded.extend(other.discarded);
        self.resumed.extend(other.resumed);
        self.reattached.extend(other.reattached);
        self.failed.extend(other.failed);
    }
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} promoted, {} discarded, {} resumed, {} reattached, {} failed",
            self.promoted.len(),
            self.discarded.len(),
            self.resumed.len(),
            self.reattached.len(),
            self.failed.len()
        )
    }
}

/// Whether a staged file already holds every byte its transfer announced.
fn staged_complete(snapshot: &ProgressSnapshot, staged_len: u64) -> bool {
    snapshot.bytes_total > 0 && staged_len >= snapshot.bytes_total
}

impl DownloadManager {
    /// Run both reconciliation passes, then rescan the library.
    pub async fn sweep(&self) -> DepotResult<SweepReport> {
        let _guard = self.inner.sweep_lock.lock().await;

        let mut report = self.process_completed_downloads().await?;
        report.merge(self.check_background_downloads().await?);
        self.rescan_library(!report.promoted.is_empty() || !report.discarded.is_empty())
            .await?;

        tracing::debug!("Sweep finished: {}", report);
        Ok(report)
    }

    /// Pass 1: settle staged files that no live transfer owns.
    pub async fn process_completed_downloads(&self) -> DepotResult<SweepReport> {
        let inner = &self.inner;
        let mut report = SweepReport::default();

        let staged = inner.dirs.list_files(inner.dirs.staging_dir()).await?;
        for file in staged {
            if resilient_read(&inner.active).contains_key(&file.name) {
                continue;
            }
            let persisted = inner.store.snapshot(&file.name);
            if let Some(snapshot) = &persisted {
                if !snapshot.status.is_terminal() && !staged_complete(snapshot, file.len) {
                    continue;
                }
            }
            if is_linked(inner, &file.name) {
                tracing::warn!(model = %file.name, "Staged file shares its name with a linked model, leaving it in place");
                continue;
            }

            if inner.dirs.library_contains(&file.name).await? {
                if self.discard_redundant(&file, persisted.as_ref()).await {
                    report.discarded.push(file.name);
                }
                continue;
            }

            if file.len == 0 {
                continue;
            }

            if self.promote_orphan(&file, persisted.as_ref()).await? {
                report.promoted.push(file.name);
            }
        }
        Ok(report)
    }

    /// Delete a staged copy of a model the library already has.
    async fn discard_redundant(&self, file: &FileEntry, persisted: Option<&ProgressSnapshot>) -> bool {
        let inner = &self.inner;
        let persisted_id = persisted.map(|s| s.download_id);
        if !reserve(inner, file, persisted_id) {
            return false;
        }

        tracing::info!(model = %file.name, "Discarding staged copy of a model already in the library");
        inner.discard_staged(&file.path).await;
        if let Some(id) = persisted_id {
            inner.clear_persisted(&file.name, id);
        }
        inner.release(DownloadId::UNASSIGNED, &file.name);
        true
    }

    /// Move one unowned staged file into the library.
    ///
    /// The name stays reserved for the duration of the move so a new
    /// download of the same model cannot start underneath it. A failed
    /// move keeps the persisted snapshot, so the next sweep retries under
    /// the same id.
    async fn promote_orphan(&self, file: &FileEntry, persisted: Option<&ProgressSnapshot>) -> DepotResult<bool> {
        let inner = &self.inner;
        let name = &file.name;
        let persisted_id = persisted.map(|s| s.download_id);
        if !reserve(inner, file, persisted_id) {
            return Ok(false);
        }

        let download_id = match persisted_id {
            Some(id) => id,
            None => match inner.store.allocate_download_id() {
                Ok(id) => id,
                Err(e) => {
                    inner.release(DownloadId::UNASSIGNED, name);
                    return Err(e.into());
                }
            },
        };

        let promoted = inner.dirs.promote(name).await;
        if let (Ok(_), Some(id)) = (&promoted, persisted_id) {
            inner.clear_persisted(name, id);
        }
        inner.release(DownloadId::UNASSIGNED, name);

        let size = match promoted {
            Ok(size) => size,
            Err(e) => {
                tracing::warn!(model = %name, "Failed to promote staged file: {}", e);
                return Ok(false);
            }
        };

        tracing::info!(model = %name, download_id = %download_id, size, "Promoted orphaned download");
        inner.bus.publish_progress(DownloadProgressEvent {
            model_name: name.clone(),
            download_id,
            progress: 100,
            bytes_downloaded: size,
            total_bytes: size,
            status: DownloadStatus::Completed,
            is_paused: false,
            error: None,
        });
        Ok(true)
    }

    /// Pass 2: account for persisted downloads with no live transfer.
    pub async fn check_background_downloads(&self) -> DepotResult<SweepReport> {
        let inner = &self.inner;
        let mut report = SweepReport::default();

        for snapshot in inner.store.snapshots() {
            let name = snapshot.model_name.clone();
            if resilient_read(&inner.active).contains_key(&name) {
                continue;
            }
            if snapshot.status.is_terminal() {
                clear_orphan(inner, &snapshot);
                continue;
            }

            let staging_path = inner.dirs.staging_path(&name);
            match inner.dirs.file_len(&staging_path).await {
                Ok(Some(_)) => {
                    if reattach(inner, &snapshot) {
                        report.reattached.push(name);
                    } else {
                        inner
                            .bus
                            .publish_progress(DownloadProgressEvent::from_snapshot(&snapshot));
                        report.resumed.push(name);
                    }
                }
                Ok(None) => {
                    if !clear_orphan(inner, &snapshot) {
                        continue;
                    }
                    tracing::warn!(
                        model = %name,
                        download_id = %snapshot.download_id,
                        "Persisted download has no staged file"
                    );
                    inner.bus.publish_progress(
                        DownloadProgressEvent::from_snapshot(&snapshot)
                            .terminal(DownloadStatus::Failed, Some(FILE_NOT_FOUND_REASON.to_string())),
                    );
                    report.failed.push(name);
                }
                Err(e) => tracing::warn!(model = %name, "Failed to inspect staged file: {}", e),
            }
        }
        Ok(report)
    }

    /// Publish `ModelsChanged` when the library's filenames differ from
    /// the previous sweep, or when this sweep itself changed them.
    async fn rescan_library(&self, force: bool) -> DepotResult<()> {
        let inner = &self.inner;
        let names: BTreeSet<ModelName> = inner
            .dirs
            .list_files(inner.dirs.library_dir())
            .await?
            .into_iter()
            .map(|file| file.name)
            .collect();

        let changed = {
            let mut known = resilient_write(&inner.known_library);
            let changed = known.as_ref().is_some_and(|previous| previous != &names);
            *known = Some(names);
            changed
        };
        if changed || force {
            inner.bus.publish_models_changed();
        }
        Ok(())
    }
}

fn is_linked(inner: &ManagerInner, name: &ModelName) -> bool {
    inner.store.external_models().iter().any(|m| &m.name == name)
}

/// Reserve a staged file's name for the sweeper.
///
/// Refused when a download or link holds the name, when it became a
/// linked model, or when its persisted snapshot changed since the file
/// was inspected.
fn reserve(inner: &ManagerInner, file: &FileEntry, persisted_id: Option<DownloadId>) -> bool {
    let mut active = resilient_write(&inner.active);
    if active.contains_key(&file.name) || is_linked(inner, &file.name) {
        return false;
    }
    if inner.store.snapshot(&file.name).map(|s| s.download_id) != persisted_id {
        return false;
    }
    active.insert(
        file.name.clone(),
        TransferRecord::reserved(file.name.clone(), file.path.clone()),
    );
    true
}

/// Remove a snapshot that still belongs to a transfer with no live
/// record. False if a newer download has taken the name since.
fn clear_orphan(inner: &ManagerInner, snapshot: &ProgressSnapshot) -> bool {
    let name = &snapshot.model_name;
    if resilient_read(&inner.active).contains_key(name) {
        return false;
    }
    let current = inner.store.snapshot(name).map(|s| s.download_id);
    if current != Some(snapshot.download_id) {
        return false;
    }
    inner.clear_persisted(name, snapshot.download_id);
    true
}

/// Ask the transport to pick a persisted download back up. On success a
/// live record is installed and its events are pumped like any other.
fn reattach(inner: &Arc<ManagerInner>, snapshot: &ProgressSnapshot) -> bool {
    let Some(url) = snapshot.origin_url.clone() else {
        return false;
    };
    let name = snapshot.model_name.clone();
    let download_id = snapshot.download_id;
    let staging_path = inner.dirs.staging_path(&name);

    {
        let mut active = resilient_write(&inner.active);
        if active.contains_key(&name) {
            return false;
        }
        active.insert(
            name.clone(),
            TransferRecord::from_snapshot(snapshot, staging_path.clone()),
        );
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let request = TransferRequest {
        download_id,
        model_name: name.clone(),
        url,
        destination: staging_path,
    };
    let Some(task) = inner.transport.reattach(request, tx) else {
        inner.release(download_id, &name);
        return false;
    };

    if snapshot.is_paused && task.supports_pause() {
        task.pause();
    }
    if !inner.attach_task(download_id, &name, Arc::clone(&task)) {
        task.stop();
        return true;
    }

    tracing::info!(model = %name, download_id = %download_id, "Reattached surviving download");
    inner
        .bus
        .publish_progress(DownloadProgressEvent::from_snapshot(snapshot));
    ManagerInner::spawn_pump(Arc::clone(inner), download_id, name, rx);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DepotConfig;
    use crate::download::state::StateStore;
    use crate::download::transfer::BridgeTransport;
    use crate::events::DepotEvent;
    use chrono::Utc;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    fn snapshot(name: &str, id: u64, downloaded: u64, total: u64) -> ProgressSnapshot {
        ProgressSnapshot {
            model_name: ModelName::parse(name).unwrap(),
            download_id: DownloadId(id),
            progress: crate::download::types::progress_percent(downloaded, total),
            bytes_downloaded: downloaded,
            bytes_total: total,
            status: DownloadStatus::Downloading,
            is_paused: false,
            origin_url: Some(format!("https://models.invalid/{}", name)),
            updated_at: Utc::now(),
        }
    }

    /// Write state as a previous process would have left it.
    fn seed_state(config: &DepotConfig, snapshots: Vec<ProgressSnapshot>) {
        let store = StateStore::open(&config.state_file).expect("open state");
        for _ in 0..10 {
            store.allocate_download_id().unwrap();
        }
        store.upsert_snapshots(snapshots).unwrap();
    }

    fn stage(config: &DepotConfig, name: &str, len: usize) {
        std::fs::create_dir_all(&config.staging_dir).unwrap();
        std::fs::write(config.staging_dir.join(name), vec![1u8; len]).unwrap();
    }

    fn drain(events: &mut broadcast::Receiver<DepotEvent>) -> Vec<DepotEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn manager(config: &DepotConfig, bridge: BridgeTransport) -> DownloadManager {
        DownloadManager::new(config, Arc::new(bridge)).expect("manager")
    }

    fn exists(path: &Path) -> bool {
        path.exists()
    }

    #[tokio::test]
    async fn test_orphan_promoted_with_fresh_id() {
        let tmp = TempDir::new().expect("Failed to create temp dir");
        let config = DepotConfig::for_root(tmp.path());
        seed_state(&config, Vec::new());
        stage(&config, "orphan.gguf", 64);

        let manager = manager(&config, BridgeTransport::new(false));
        let mut events = manager.subscribe();
        let report = manager.sweep().await.unwrap();

        assert_eq!(report.promoted, vec![ModelName::parse("orphan.gguf").unwrap()]);
        assert!(exists(&config.library_dir.join("orphan.gguf")));
        assert!(!exists(&config.staging_dir.join("orphan.gguf")));

        let events = drain(&mut events);
        let completed = events
            .iter()
            .find_map(|e| match e {
                DepotEvent::DownloadProgress(p) => Some(p.clone()),
                _ => None,
            })
            .expect("completed event");
        assert_eq!(completed.status, DownloadStatus::Completed);
        assert_eq!(completed.progress, 100);
        assert_eq!(completed.bytes_downloaded, 64);
        assert!(completed.download_id.0 > 10, "synthetic id comes from the allocator");
        assert!(events.contains(&DepotEvent::ModelsChanged));
    }

    #[tokio::test]
    async fn test_redundant_staged_copy_discarded() {
        let tmp = TempDir::new().expect("Failed to create temp dir");
        let config = DepotConfig::for_root(tmp.path());
        stage(&config, "dup.gguf", 8);
        std::fs::create_dir_all(&config.library_dir).unwrap();
        std::fs::write(config.library_dir.join("dup.gguf"), b"library").unwrap();

        let manager = manager(&config, BridgeTransport::new(false));
        let report = manager.sweep().await.unwrap();

        assert_eq!(report.discarded.len(), 1);
        assert!(!exists(&config.staging_dir.join("dup.gguf")));
        assert_eq!(std::fs::read(config.library_dir.join("dup.gguf")).unwrap(), b"library");
    }

    #[tokio::test]
    async fn test_staged_file_named_like_linked_model_not_promoted() {
        let tmp = TempDir::new().expect("Failed to create temp dir");
        let config = DepotConfig::for_root(tmp.path());
        let manager = manager(&config, BridgeTransport::new(false));
        let outside = tmp.path().join("x.gguf");
        std::fs::write(&outside, b"linked bytes").unwrap();
        manager
            .link_external_model(crate::library::ModelSource::Path(outside.clone()), "x.gguf")
            .await
            .expect("link");
        stage(&config, "x.gguf", 32);

        let report = manager.sweep().await.unwrap();
        assert!(report.promoted.is_empty());
        assert!(report.discarded.is_empty());
        assert!(exists(&config.staging_dir.join("x.gguf")));
        assert!(!exists(&config.library_dir.join("x.gguf")));

        let models = manager.get_stored_models().await.unwrap();
        assert_eq!(models.len(), 1);
        assert!(models[0].is_external);
        assert_eq!(std::fs::read(&outside).unwrap(), b"linked bytes");
    }

    #[tokio::test]
    async fn test_redundant_copy_kept_when_download_takes_the_name() {
        let tmp = TempDir::new().expect("Failed to create temp dir");
        let config = DepotConfig::for_root(tmp.path());
        stage(&config, "m.gguf", 8);
        std::fs::create_dir_all(&config.library_dir).unwrap();
        std::fs::write(config.library_dir.join("m.gguf"), b"old copy").unwrap();

        let bridge = Arc::new(BridgeTransport::new(false));
        let manager = DownloadManager::new(&config, bridge.clone()).expect("manager");
        let listed = manager
            .inner
            .dirs
            .list_files(&config.staging_dir)
            .await
            .unwrap()
            .remove(0);

        // A re-download starts between the listing and the delete
        manager.download_model("https://h/m.gguf", "m.gguf").await.unwrap();
        let _transfer = bridge.next_transfer().await;

        assert!(!manager.discard_redundant(&listed, None).await);
        assert!(exists(&config.staging_dir.join("m.gguf")));
        assert_eq!(manager.active_downloads().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_promotion_keeps_persisted_id() {
        let tmp = TempDir::new().expect("Failed to create temp dir");
        let config = DepotConfig::for_root(tmp.path());
        seed_state(&config, vec![snapshot("stuck.gguf", 4, 60, 100)]);
        stage(&config, "stuck.gguf", 100);
        // A directory squatting on the target makes the move fail
        let blocker = config.library_dir.join("stuck.gguf");
        std::fs::create_dir_all(blocker.join("inner")).unwrap();

        let manager = manager(&config, BridgeTransport::new(false));
        let report = manager.sweep().await.unwrap();
        assert!(report.promoted.is_empty());
        assert_eq!(manager.persisted_downloads()[0].download_id, DownloadId(4));
        assert!(exists(&config.staging_dir.join("stuck.gguf")));

        std::fs::remove_dir_all(&blocker).unwrap();
        let mut events = manager.subscribe();
        let report = manager.sweep().await.unwrap();
        assert_eq!(report.promoted.len(), 1);
        let completed = drain(&mut events)
            .into_iter()
            .find_map(|e| match e {
                DepotEvent::DownloadProgress(p) => Some(p),
                _ => None,
            })
            .expect("completed event");
        assert_eq!(completed.download_id, DownloadId(4));
        assert!(manager.persisted_downloads().is_empty());
    }

    #[tokio::test]
    async fn test_empty_and_in_progress_files_left_alone() {
        let tmp = TempDir::new().expect("Failed to create temp dir");
        let config = DepotConfig::for_root(tmp.path());
        seed_state(&config, vec![snapshot("partial.gguf", 3, 40, 100)]);
        stage(&config, "empty.gguf", 0);
        stage(&config, "partial.gguf", 40);

        let manager = manager(&config, BridgeTransport::new(false));
        let mut events = manager.subscribe();
        let report = manager.sweep().await.unwrap();

        assert!(report.promoted.is_empty());
        assert_eq!(report.resumed, vec![ModelName::parse("partial.gguf").unwrap()]);
        assert!(exists(&config.staging_dir.join("empty.gguf")));
        assert!(exists(&config.staging_dir.join("partial.gguf")));

        let rebroadcast = drain(&mut events)
            .into_iter()
            .find_map(|e| match e {
                DepotEvent::DownloadProgress(p) => Some(p),
                _ => None,
            })
            .expect("re-broadcast");
        assert_eq!(rebroadcast.progress, 40);
        assert_eq!(rebroadcast.status, DownloadStatus::Downloading);
    }

    #[tokio::test]
    async fn test_fully_staged_download_promoted_after_crash() {
        let tmp = TempDir::new().expect("Failed to create temp dir");
        let config = DepotConfig::for_root(tmp.path());
        // Last persisted tick lagged behind the final bytes
        seed_state(&config, vec![snapshot("done.gguf", 4, 60, 100)]);
        stage(&config, "done.gguf", 100);

        let manager = manager(&config, BridgeTransport::new(false));
        let report = manager.sweep().await.unwrap();

        assert_eq!(report.promoted.len(), 1);
        assert!(report.resumed.is_empty());
        assert!(exists(&config.library_dir.join("done.gguf")));
        assert!(manager.persisted_downloads().is_empty());
    }

    #[tokio::test]
    async fn test_stale_snapshot_fails_and_clears() {
        let tmp = TempDir::new().expect("Failed to create temp dir");
        let config = DepotConfig::for_root(tmp.path());
        seed_state(&config, vec![snapshot("gone.gguf", 5, 40, 100)]);

        let manager = manager(&config, BridgeTransport::new(false));
        let mut events = manager.subscribe();
        let report = manager.sweep().await.unwrap();

        assert_eq!(report.failed.len(), 1);
        assert!(manager.persisted_downloads().is_empty());
        let failed = drain(&mut events)
            .into_iter()
            .find_map(|e| match e {
                DepotEvent::DownloadProgress(p) => Some(p),
                _ => None,
            })
            .expect("failed event");
        assert_eq!(failed.download_id, DownloadId(5));
        assert_eq!(failed.status, DownloadStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some(FILE_NOT_FOUND_REASON));

        let again = manager.sweep().await.unwrap();
        assert!(again.is_empty(), "second sweep must find nothing to do");
    }

    #[tokio::test]
    async fn test_reattached_download_completes() {
        let tmp = TempDir::new().expect("Failed to create temp dir");
        let config = DepotConfig::for_root(tmp.path());
        seed_state(&config, vec![snapshot("live.gguf", 6, 40, 100)]);
        stage(&config, "live.gguf", 40);

        let bridge = Arc::new(BridgeTransport::new(true).accepting_reattach());
        let manager = DownloadManager::new(&config, bridge.clone()).expect("manager");
        let mut events = manager.subscribe();

        let report = manager.sweep().await.unwrap();
        assert_eq!(report.reattached.len(), 1);
        assert_eq!(manager.active_downloads()[0].download_id, DownloadId(6));

        let transfer = bridge.next_transfer().await;
        assert!(transfer.reattached);
        transfer.begin(100);
        transfer.progress(100, 100);
        std::fs::write(&transfer.request.destination, vec![1u8; 100]).unwrap();
        transfer.done();

        loop {
            let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
                .await
                .expect("timed out")
                .unwrap();
            if let DepotEvent::DownloadProgress(p) = event {
                if p.status == DownloadStatus::Completed {
                    assert_eq!(p.download_id, DownloadId(6));
                    break;
                }
            }
        }
        assert!(exists(&config.library_dir.join("live.gguf")));
        assert!(manager.persisted_downloads().is_empty());

        // Nothing left for a later sweep
        let again = manager.sweep().await.unwrap();
        assert!(again.reattached.is_empty() && again.promoted.is_empty());
    }

    #[tokio::test]
    async fn test_library_change_detected_between_sweeps() {
        let tmp = TempDir::new().expect("Failed to create temp dir");
        let config = DepotConfig::for_root(tmp.path());
        let manager = manager(&config, BridgeTransport::new(false));
        let mut events = manager.subscribe();

        manager.sweep().await.unwrap();
        assert!(drain(&mut events).is_empty());

        std::fs::create_dir_all(&config.library_dir).unwrap();
        std::fs::write(config.library_dir.join("dropped-in.gguf"), b"x").unwrap();
        manager.sweep().await.unwrap();
        assert_eq!(drain(&mut events), vec![DepotEvent::ModelsChanged]);

        manager.sweep().await.unwrap();
        assert!(drain(&mut events).is_empty());
    }
}
