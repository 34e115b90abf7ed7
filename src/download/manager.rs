// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download lifecycle manager.
//!
//! Owns the map from model name to live [`TransferRecord`], drives each
//! transfer through
//!
//! ```text
//! queued -> downloading <-> paused -> completed | failed | cancelled
//! ```
//!
//! mirrors every transition onto the event bus and into the state store,
//! and promotes finished files from staging into the library.
//!
//! The only mutual-exclusion rule is "one live transfer per model name",
//! checked synchronously under the map's lock before any I/O. Terminal
//! handlers first *claim* a record by flagging it `finalizing`; whoever
//! claims it does the cleanup, everybody else backs off. The record stays
//! in the map until its files are settled, so a new download of the same
//! name cannot start while the old staging file is still being moved or
//! deleted.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::debounce::SnapshotWriter;
use super::state::StateStore;
use super::transfer::{EventReceiver, HttpTransport, TransferEvent, TransferRequest, TransferTask, Transport};
use super::types::{DownloadId, DownloadStatus, ModelName, ProgressSnapshot, StoredModel, TransferRecord};
use crate::config::DepotConfig;
use crate::error::{DepotError, DepotResult};
use crate::events::{DepotEvent, DownloadNotice, DownloadProgressEvent, EventBus};
use crate::library::{DeleteOutcome, Library, ModelDirs, ModelSource};
use crate::sync::{resilient_read, resilient_write};
use crate::utils::redact_url;

/// Reason attached to the terminal event of a stale persisted download.
pub const FILE_NOT_FOUND_REASON: &str = "download file not found";

/// Reason attached to the terminal event of a cancelled download.
pub const CANCELLED_REASON: &str = "cancelled by user";

/// Result of a pause or resume request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseOutcome {
    /// The transfer was asked to pause/resume
    Applied,
    /// The transfer service cannot pause; a notice was published
    Unsupported,
    /// No live download has that id
    UnknownDownload,
}

/// Manager for model downloads.
///
/// Cheap to clone; all clones share one set of bookkeeping.
#[derive(Clone)]
pub struct DownloadManager {
    pub(crate) inner: Arc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    pub(crate) dirs: ModelDirs,
    pub(crate) store: Arc<StateStore>,
    pub(crate) bus: EventBus,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) library: Library,
    pub(crate) writer: Arc<SnapshotWriter>,
    pub(crate) active: RwLock<HashMap<ModelName, TransferRecord>>,
    /// Library filenames seen by the previous sweep
    pub(crate) known_library: RwLock<Option<BTreeSet<ModelName>>>,
    /// Serializes sweeper runs
    pub(crate) sweep_lock: tokio::sync::Mutex<()>,
}

/// What a terminal handler needs once it has claimed a record.
struct Claimed {
    name: ModelName,
    staging_path: PathBuf,
    task: Option<Arc<dyn TransferTask>>,
    snapshot: ProgressSnapshot,
}

impl DownloadManager {
    /// Create a manager over the configured directories and state file.
    ///
    /// Does not touch the staging directory; call [`DownloadManager::open`]
    /// or [`DownloadManager::sweep`] to reconcile what a previous run left.
    pub fn new(config: &DepotConfig, transport: Arc<dyn Transport>) -> DepotResult<Self> {
        let store = Arc::new(StateStore::open(&config.state_file)?);
        let bus = EventBus::new(config.event_capacity);
        let dirs = ModelDirs::new(&config.staging_dir, &config.library_dir);
        let writer = Arc::new(SnapshotWriter::new(Arc::clone(&store), config.progress_debounce()));
        let library = Library::new(dirs.clone(), Arc::clone(&store), bus.clone());

        Ok(Self {
            inner: Arc::new(ManagerInner {
                dirs,
                store,
                bus,
                transport,
                library,
                writer,
                active: RwLock::new(HashMap::new()),
                known_library: RwLock::new(None),
                sweep_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Create a manager and run the startup sweep.
    pub async fn open(config: &DepotConfig, transport: Arc<dyn Transport>) -> DepotResult<Self> {
        let manager = Self::new(config, transport)?;
        let report = manager.sweep().await?;
        if !report.is_empty() {
            tracing::info!("Startup reconciliation: {}", report);
        }
        Ok(manager)
    }

    /// Create a manager that downloads over HTTP(S).
    pub async fn open_http(config: &DepotConfig) -> DepotResult<Self> {
        let transport = HttpTransport::new(config.connect_timeout(), &config.user_agent)?;
        Self::open(config, Arc::new(transport)).await
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DepotEvent> {
        self.inner.bus.subscribe()
    }

    pub fn dirs(&self) -> &ModelDirs {
        &self.inner.dirs
    }

    /// Start downloading `url` into the library as `name`.
    ///
    /// Returns as soon as the transfer is registered; progress arrives on
    /// the event bus.
    pub async fn download_model(&self, url: &str, name: &str) -> DepotResult<DownloadId> {
        let name = ModelName::parse(name)?;
        self.start_download(url, name).await
    }

    /// Register and launch a transfer for `name`.
    ///
    /// Rejected with [`DepotError::AlreadyDownloading`] while another
    /// transfer for the same name is live; no id is allocated then. The
    /// queued snapshot is persisted but not broadcast: the first progress
    /// event is the transfer's `begin`.
    pub async fn start_download(&self, url: &str, name: ModelName) -> DepotResult<DownloadId> {
        if url.trim().is_empty() {
            return Err(DepotError::UnsupportedSource(url.to_string()));
        }
        let inner = &self.inner;
        let staging_path = inner.dirs.staging_path(&name);

        // Hold the name while the id is allocated outside the lock
        {
            let mut active = resilient_write(&inner.active);
            if active.contains_key(&name) {
                return Err(DepotError::AlreadyDownloading(name.to_string()));
            }
            if inner.store.external_models().iter().any(|m| m.name == name) {
                return Err(DepotError::NameTaken(name.to_string()));
            }
            active.insert(name.clone(), TransferRecord::reserved(name.clone(), staging_path.clone()));
        }

        let download_id = match inner.store.allocate_download_id() {
            Ok(id) => id,
            Err(e) => {
                inner.release(DownloadId::UNASSIGNED, &name);
                return Err(e.into());
            }
        };
        let queued = {
            let record = TransferRecord::new(download_id, name.clone(), staging_path.clone(), url);
            let queued = record.snapshot();
            resilient_write(&inner.active).insert(name.clone(), record);
            queued
        };

        if let Err(e) = self.prepare_download(queued).await {
            inner.release(download_id, &name);
            return Err(e);
        }

        tracing::info!(
            model = %name,
            download_id = %download_id,
            url = %redact_url(url),
            "Download queued"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let request = TransferRequest {
            download_id,
            model_name: name.clone(),
            url: url.to_string(),
            destination: staging_path,
        };
        let task = inner.transport.spawn(request, tx);
        if !inner.attach_task(download_id, &name, Arc::clone(&task)) {
            // Cancelled before the transport handed back its task
            task.stop();
            inner.clear_persisted(&name, download_id);
            return Ok(download_id);
        }
        ManagerInner::spawn_pump(Arc::clone(inner), download_id, name, rx);
        Ok(download_id)
    }

    async fn prepare_download(&self, queued: ProgressSnapshot) -> DepotResult<()> {
        self.inner.dirs.ensure_staging().await?;
        self.inner.writer.write_now(queued)?;
        Ok(())
    }

    /// Pause a live download.
    pub fn pause_download(&self, id: DownloadId) -> DepotResult<PauseOutcome> {
        self.inner.set_paused(id, true)
    }

    /// Resume a paused download.
    pub fn resume_download(&self, id: DownloadId) -> DepotResult<PauseOutcome> {
        self.inner.set_paused(id, false)
    }

    /// Cancel a download. Unknown ids are a no-op; returns whether
    /// anything was cancelled.
    pub async fn cancel_download(&self, id: DownloadId) -> DepotResult<bool> {
        self.inner.cancel(id).await
    }

    /// Snapshot of every live download.
    pub fn active_downloads(&self) -> Vec<ProgressSnapshot> {
        let active = resilient_read(&self.inner.active);
        let mut snapshots: Vec<_> = active
            .values()
            .filter(|r| !r.finalizing)
            .map(TransferRecord::snapshot)
            .collect();
        snapshots.sort_by_key(|s| s.download_id);
        snapshots
    }

    /// Snapshots persisted in the state store (including ones with no
    /// live transfer behind them).
    pub fn persisted_downloads(&self) -> Vec<ProgressSnapshot> {
        self.inner.store.snapshots()
    }

    /// Every stored model: library files and linked models.
    pub async fn get_stored_models(&self) -> DepotResult<Vec<StoredModel>> {
        self.inner.library.stored_models().await
    }

    /// Delete a model by path. Linked models only lose their registry row.
    pub async fn delete_model(&self, path: &Path) -> DepotResult<DeleteOutcome> {
        self.inner.library.delete_model(path).await
    }

    /// Link a model that lives outside the library.
    ///
    /// Refused while a download of the same name is live or persisted.
    /// The name is reserved in the live map until the link settles, so
    /// neither a start nor a sweep can claim it meanwhile.
    pub async fn link_external_model(&self, source: ModelSource, name: &str) -> DepotResult<StoredModel> {
        let name = ModelName::parse(name)?;
        let inner = &self.inner;
        {
            let mut active = resilient_write(&inner.active);
            match active.get(&name) {
                Some(record) if record.finalizing => return Err(DepotError::NameTaken(name.to_string())),
                Some(_) => return Err(DepotError::AlreadyDownloading(name.to_string())),
                None => {}
            }
            if inner.store.snapshot(&name).is_some() {
                return Err(DepotError::AlreadyDownloading(name.to_string()));
            }
            active.insert(
                name.clone(),
                TransferRecord::reserved(name.clone(), inner.dirs.staging_path(&name)),
            );
        }

        let result = inner.library.link_external(source, name.clone()).await;
        inner.release(DownloadId::UNASSIGNED, &name);
        result
    }

    /// Run the sweeper on a fixed interval until the handle is aborted.
    pub fn spawn_periodic_sweeper(&self, interval: std::time::Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; startup already swept
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match manager.sweep().await {
                    Ok(report) if !report.is_empty() => tracing::info!("Periodic sweep: {}", report),
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Periodic sweep failed: {}", e),
                }
            }
        })
    }

    /// Persist any coalesced progress. Transfers keep running.
    pub fn shutdown(&self) -> DepotResult<()> {
        self.inner.writer.flush()?;
        Ok(())
    }
}

impl ManagerInner {
    pub(super) fn spawn_pump(inner: Arc<Self>, id: DownloadId, name: ModelName, mut rx: EventReceiver) {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let terminal = matches!(event, TransferEvent::Done | TransferEvent::Error { .. });
                inner.handle_event(id, &name, event).await;
                if terminal {
                    return;
                }
            }
            // Transport went away without a terminal event
            if inner.owns(id, &name) {
                inner
                    .fail(id, &name, "transfer ended before completing".to_string())
                    .await;
            }
        });
    }

    async fn handle_event(&self, id: DownloadId, name: &ModelName, event: TransferEvent) {
        match event {
            TransferEvent::Begin { expected_bytes } => self.on_begin(id, name, expected_bytes),
            TransferEvent::Progress {
                bytes_downloaded,
                bytes_total,
            } => self.on_progress(id, name, bytes_downloaded, bytes_total),
            TransferEvent::Done => self.on_done(id, name).await,
            TransferEvent::Error { error, error_code } => {
                let reason = match error_code {
                    Some(code) => format!("{} (code {})", error, code),
                    None => error,
                };
                self.fail(id, name, reason).await;
            }
        }
    }

    fn on_begin(&self, id: DownloadId, name: &ModelName, expected_bytes: u64) {
        let snapshot = {
            let mut active = resilient_write(&self.active);
            let Some(record) = live_record(&mut active, id, name) else {
                return;
            };
            if record.began {
                tracing::debug!(model = %name, download_id = %id, "Ignoring duplicate begin");
                return;
            }
            record.began = true;
            record.apply_progress(record.bytes_downloaded, expected_bytes);
            record.status = if record.is_paused {
                DownloadStatus::Paused
            } else {
                DownloadStatus::Downloading
            };
            record.snapshot()
        };

        tracing::info!(
            model = %name,
            download_id = %id,
            expected_bytes,
            "Download started"
        );
        self.persist_now(snapshot.clone());
        self.bus
            .publish_progress(DownloadProgressEvent::from_snapshot(&snapshot));
    }

    fn on_progress(&self, id: DownloadId, name: &ModelName, bytes_downloaded: u64, bytes_total: u64) {
        let snapshot = {
            let mut active = resilient_write(&self.active);
            let Some(record) = live_record(&mut active, id, name) else {
                return;
            };
            record.apply_progress(bytes_downloaded, bytes_total);
            record.snapshot()
        };

        tracing::trace!(model = %name, progress = snapshot.progress, "Download progress");
        self.writer.schedule(snapshot.clone());
        self.bus
            .publish_progress(DownloadProgressEvent::from_snapshot(&snapshot));
    }

    async fn on_done(&self, id: DownloadId, name: &ModelName) {
        let Some(claimed) = self.claim(id, name) else {
            return;
        };

        match self.dirs.file_len(&claimed.staging_path).await {
            Ok(Some(len)) if len > 0 => {}
            Ok(_) => {
                let err = DepotError::Integrity {
                    model: name.to_string(),
                    reason: "downloaded file is missing or empty".to_string(),
                };
                return self.finish_failed(id, claimed, err.to_string()).await;
            }
            Err(e) => return self.finish_failed(id, claimed, e.to_string()).await,
        }

        let size = match self.dirs.promote(name).await {
            Ok(size) => size,
            Err(e) => return self.finish_failed(id, claimed, e.to_string()).await,
        };

        self.clear_persisted(name, id);
        self.release(id, name);

        tracing::info!(model = %name, download_id = %id, size, "Download completed");
        let mut event = DownloadProgressEvent::from_snapshot(&claimed.snapshot)
            .terminal(DownloadStatus::Completed, None);
        event.progress = 100;
        event.bytes_downloaded = size;
        event.total_bytes = size;
        self.bus.publish_progress(event);
        self.bus.publish_models_changed();
    }

    /// Terminal failure for a live download.
    async fn fail(&self, id: DownloadId, name: &ModelName, reason: String) {
        let Some(claimed) = self.claim(id, name) else {
            return;
        };
        self.finish_failed(id, claimed, reason).await;
    }

    async fn finish_failed(&self, id: DownloadId, claimed: Claimed, reason: String) {
        let name = claimed.name.clone();
        tracing::warn!(model = %name, download_id = %id, "Download failed: {}", reason);

        self.clear_persisted(&name, id);
        self.discard_staged(&claimed.staging_path).await;
        self.release(id, &name);
        self.bus.publish_progress(
            DownloadProgressEvent::from_snapshot(&claimed.snapshot)
                .terminal(DownloadStatus::Failed, Some(reason)),
        );
    }

    async fn cancel(&self, id: DownloadId) -> DepotResult<bool> {
        let claimed = {
            let mut active = resilient_write(&self.active);
            active
                .values_mut()
                .find(|r| r.download_id == id && !r.finalizing)
                .map(claim_record)
        };

        let Some(claimed) = claimed else {
            return self.cancel_orphan(id).await;
        };

        if let Some(task) = &claimed.task {
            task.stop();
        }
        self.discard_staged(&claimed.staging_path).await;
        self.clear_persisted(&claimed.name, id);
        self.release(id, &claimed.name);

        tracing::info!(model = %claimed.name, download_id = %id, "Download cancelled");
        self.bus.publish_progress(
            DownloadProgressEvent::from_snapshot(&claimed.snapshot)
                .terminal(DownloadStatus::Cancelled, Some(CANCELLED_REASON.to_string())),
        );
        Ok(true)
    }

    /// Cancel a persisted download that has no live transfer (left over
    /// from a previous run and not reattached).
    async fn cancel_orphan(&self, id: DownloadId) -> DepotResult<bool> {
        let Some(snapshot) = self
            .store
            .snapshots()
            .into_iter()
            .find(|s| s.download_id == id)
        else {
            tracing::debug!(download_id = %id, "Cancel for unknown download ignored");
            return Ok(false);
        };
        if resilient_read(&self.active).contains_key(&snapshot.model_name) {
            // A newer transfer owns this name now
            return Ok(false);
        }

        self.discard_staged(&self.dirs.staging_path(&snapshot.model_name))
            .await;
        self.writer.clear_now(&snapshot.model_name, id)?;
        tracing::info!(model = %snapshot.model_name, download_id = %id, "Stale download cancelled");
        self.bus.publish_progress(
            DownloadProgressEvent::from_snapshot(&snapshot)
                .terminal(DownloadStatus::Cancelled, Some(CANCELLED_REASON.to_string())),
        );
        Ok(true)
    }

    fn set_paused(&self, id: DownloadId, paused: bool) -> DepotResult<PauseOutcome> {
        let found = {
            let active = resilient_read(&self.active);
            active
                .values()
                .find(|r| r.download_id == id && !r.finalizing)
                .map(|r| (r.model_name.clone(), r.task.clone()))
        };
        let Some((name, task)) = found else {
            tracing::debug!(download_id = %id, "Pause/resume for unknown download ignored");
            return Ok(PauseOutcome::UnknownDownload);
        };

        let Some(task) = task.filter(|t| t.supports_pause()) else {
            let verb = if paused { "paused" } else { "resumed" };
            self.bus.publish(DepotEvent::DownloadNotice(DownloadNotice {
                model_name: name,
                download_id: id,
                message: format!("This download cannot be {} on this platform", verb),
            }));
            return Ok(PauseOutcome::Unsupported);
        };

        if paused {
            task.pause();
        } else {
            task.resume();
        }

        let snapshot = {
            let mut active = resilient_write(&self.active);
            let Some(record) = live_record(&mut active, id, &name) else {
                return Ok(PauseOutcome::UnknownDownload);
            };
            record.is_paused = paused;
            record.status = match (paused, record.began) {
                (true, _) => DownloadStatus::Paused,
                (false, true) => DownloadStatus::Downloading,
                (false, false) => DownloadStatus::Queued,
            };
            record.snapshot()
        };

        tracing::info!(model = %name, download_id = %id, paused, "Download pause state changed");
        self.writer.write_now(snapshot.clone())?;
        self.bus
            .publish_progress(DownloadProgressEvent::from_snapshot(&snapshot));
        Ok(PauseOutcome::Applied)
    }

    /// Mark the record finalizing and hand back what cleanup needs.
    /// `None` if the record is gone, superseded, or already claimed.
    fn claim(&self, id: DownloadId, name: &ModelName) -> Option<Claimed> {
        let mut active = resilient_write(&self.active);
        live_record(&mut active, id, name).map(claim_record)
    }

    /// Install the transport's task on a record. False if the record is gone.
    pub(super) fn attach_task(&self, id: DownloadId, name: &ModelName, task: Arc<dyn TransferTask>) -> bool {
        let mut active = resilient_write(&self.active);
        match active.get_mut(name) {
            Some(record) if record.download_id == id && !record.finalizing => {
                record.task = Some(task);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn owns(&self, id: DownloadId, name: &ModelName) -> bool {
        resilient_read(&self.active)
            .get(name)
            .is_some_and(|r| r.download_id == id && !r.finalizing)
    }

    /// Drop the record for `name` if it still belongs to `id`.
    pub(crate) fn release(&self, id: DownloadId, name: &ModelName) {
        let mut active = resilient_write(&self.active);
        if active.get(name).is_some_and(|r| r.download_id == id) {
            active.remove(name);
        }
    }

    fn persist_now(&self, snapshot: ProgressSnapshot) {
        if let Err(e) = self.writer.write_now(snapshot) {
            tracing::warn!("Failed to persist download snapshot: {:#}", e);
        }
    }

    /// Remove the snapshot of download `id`. Late ticks for it are dropped.
    pub(crate) fn clear_persisted(&self, name: &ModelName, id: DownloadId) {
        if let Err(e) = self.writer.clear_now(name, id) {
            tracing::warn!(model = %name, "Failed to clear download snapshot: {:#}", e);
        }
    }

    pub(crate) async fn discard_staged(&self, path: &Path) {
        match self.dirs.remove_if_exists(path).await {
            Ok(true) => tracing::debug!(path = %path.display(), "Removed staged file"),
            Ok(false) => {}
            Err(e) => tracing::warn!("Failed to remove staged file: {}", e),
        }
    }
}

/// The live, unclaimed record for `name` belonging to transfer `id`.
fn live_record<'a>(
    active: &'a mut HashMap<ModelName, TransferRecord>,
    id: DownloadId,
    name: &ModelName,
) -> Option<&'a mut TransferRecord> {
    active
        .get_mut(name)
        .filter(|r| r.download_id == id && !r.finalizing)
}

fn claim_record(record: &mut TransferRecord) -> Claimed {
    record.finalizing = true;
    Claimed {
        name: record.model_name.clone(),
        staging_path: record.staging_path.clone(),
        task: record.task.clone(),
        snapshot: record.snapshot(),
    }
}
