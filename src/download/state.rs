// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent state store.
//!
//! A single JSON document holds the download-id counter, the progress
//! snapshot of every active download, and the external model registry.
//! Every mutation rewrites the whole document atomically (temp file +
//! rename) while holding an exclusive advisory lock on a sibling
//! `.lock` file, so a second process never interleaves a write and a
//! kill mid-save never leaves a truncated document behind.
//!
//! The in-memory copy sits behind one `RwLock`; mutation and save happen
//! under the same write guard, which serializes writers across the
//! runtime's worker threads.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use super::types::{DownloadId, ModelName, ProgressSnapshot, StoredModel};
use crate::sync::{resilient_read, resilient_write};

/// Default timeout for acquiring file locks (5 seconds)
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Current document version.
const STATE_VERSION: u32 = 1;

/// The persisted document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepotState {
    /// Next id handed out by [`StateStore::allocate_download_id`]
    pub next_download_id: u64,
    /// Progress snapshots keyed by model name
    #[serde(default)]
    pub active_download_snapshots: BTreeMap<ModelName, ProgressSnapshot>,
    /// Linked models living outside the library, in insertion order
    #[serde(default)]
    pub external_model_registry: Vec<StoredModel>,
    /// When the state was last saved
    pub last_saved: Option<DateTime<Utc>>,
    /// Version for future migrations
    pub version: u32,
}

impl Default for DepotState {
    fn default() -> Self {
        Self {
            next_download_id: 1,
            active_download_snapshots: BTreeMap::new(),
            external_model_registry: Vec::new(),
            last_saved: None,
            version: STATE_VERSION,
        }
    }
}

/// Durable key/value state shared by the manager and the sweeper.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: RwLock<DepotState>,
}

impl StateStore {
    /// Open the store at `path`, loading the existing document if present.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = load_document(&path, LOCK_TIMEOUT)?;
        tracing::debug!(
            path = %path.display(),
            next_id = state.next_download_id,
            snapshots = state.active_download_snapshots.len(),
            external = state.external_model_registry.len(),
            "Loaded depot state"
        );
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocate the next download id and persist the bumped counter.
    ///
    /// The counter is only advanced in memory once the save succeeds, so
    /// a failed save never hands out an id that could be handed out again.
    pub fn allocate_download_id(&self) -> Result<DownloadId> {
        self.mutate(|state| {
            let id = DownloadId(state.next_download_id.max(1));
            state.next_download_id = id.0 + 1;
            id
        })
    }

    /// Copy of every persisted snapshot, ordered by model name.
    pub fn snapshots(&self) -> Vec<ProgressSnapshot> {
        resilient_read(&self.state)
            .active_download_snapshots
            .values()
            .cloned()
            .collect()
    }

    pub fn snapshot(&self, name: &ModelName) -> Option<ProgressSnapshot> {
        resilient_read(&self.state)
            .active_download_snapshots
            .get(name)
            .cloned()
    }

    pub fn upsert_snapshot(&self, snapshot: ProgressSnapshot) -> Result<()> {
        self.mutate(|state| {
            state
                .active_download_snapshots
                .insert(snapshot.model_name.clone(), snapshot);
        })
    }

    /// Write a batch of snapshots with a single save.
    pub fn upsert_snapshots(&self, snapshots: Vec<ProgressSnapshot>) -> Result<()> {
        if snapshots.is_empty() {
            return Ok(());
        }
        self.mutate(|state| {
            for snapshot in snapshots {
                state
                    .active_download_snapshots
                    .insert(snapshot.model_name.clone(), snapshot);
            }
        })
    }

    /// Remove a snapshot. Saves only if something was removed.
    pub fn remove_snapshot(&self, name: &ModelName) -> Result<Option<ProgressSnapshot>> {
        if !resilient_read(&self.state)
            .active_download_snapshots
            .contains_key(name)
        {
            return Ok(None);
        }
        self.mutate(|state| state.active_download_snapshots.remove(name))
    }

    pub fn external_models(&self) -> Vec<StoredModel> {
        resilient_read(&self.state).external_model_registry.clone()
    }

    pub fn add_external_model(&self, model: StoredModel) -> Result<()> {
        self.mutate(|state| state.external_model_registry.push(model))
    }

    /// Remove the registry row pointing at `path`, if any.
    pub fn remove_external_model(&self, path: &Path) -> Result<Option<StoredModel>> {
        let known = resilient_read(&self.state)
            .external_model_registry
            .iter()
            .any(|m| m.path == path);
        if !known {
            return Ok(None);
        }
        // Re-resolve under the write guard; another writer may have
        // changed the registry in between.
        self.mutate(|state| {
            let idx = state
                .external_model_registry
                .iter()
                .position(|m| m.path == path)?;
            Some(state.external_model_registry.remove(idx))
        })
    }

    /// Apply `f` to a copy of the document, save it, then publish it.
    fn mutate<T>(&self, f: impl FnOnce(&mut DepotState) -> T) -> Result<T> {
        let mut guard = resilient_write(&self.state);
        let mut next = guard.clone();
        let out = f(&mut next);
        save_document(&self.path, &mut next, LOCK_TIMEOUT)?;
        *guard = next;
        Ok(out)
    }
}

fn lock_path(path: &Path) -> PathBuf {
    path.with_extension("lock")
}

/// Acquire an exclusive lock with timeout.
fn acquire_exclusive_lock_with_timeout(path: &Path, timeout: Duration) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory for lock file: {:?}", parent))?;
    }

    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to open lock file: {:?}", path))?;

    let start = Instant::now();
    loop {
        match FileExt::try_lock_exclusive(&lock_file) {
            Ok(()) => return Ok(lock_file),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    bail!(
                        "Timed out waiting for exclusive lock on {:?} after {:?}. \
                         Another instance may be writing to the state file.",
                        path,
                        timeout
                    );
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to acquire exclusive lock on {:?}", path));
            }
        }
    }
}

/// Acquire a shared lock with timeout.
fn acquire_shared_lock_with_timeout(file: &File, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    loop {
        match FileExt::try_lock_shared(file) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    bail!(
                        "Timed out waiting for shared lock after {:?}. \
                         Another instance may be writing to the state file.",
                        timeout
                    );
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(e).with_context(|| "Failed to acquire shared lock on state file");
            }
        }
    }
}

fn load_document(path: &Path, timeout: Duration) -> Result<DepotState> {
    if !path.exists() {
        return Ok(DepotState::default());
    }

    let lock_path = lock_path(path);
    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .with_context(|| format!("Failed to open lock file: {:?}", lock_path))?;

    acquire_shared_lock_with_timeout(&lock_file, timeout)?;

    let content = fs::read_to_string(path).with_context(|| "Failed to read state file")?;
    let state: DepotState =
        serde_json::from_str(&content).with_context(|| "Failed to parse state file")?;

    if state.version > STATE_VERSION {
        bail!(
            "State file version {} is newer than supported version {}",
            state.version,
            STATE_VERSION
        );
    }
    Ok(state)
}

fn save_document(path: &Path, state: &mut DepotState, timeout: Duration) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }

    let _lock_guard = acquire_exclusive_lock_with_timeout(&lock_path(path), timeout)?;

    let temp_path = path.with_extension("tmp");
    state.last_saved = Some(Utc::now());

    let content =
        serde_json::to_string_pretty(state).with_context(|| "Failed to serialize state to JSON")?;

    {
        let mut temp_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;

        temp_file
            .write_all(content.as_bytes())
            .with_context(|| "Failed to write to temp file")?;
        temp_file
            .sync_all()
            .with_context(|| "Failed to sync temp file to disk")?;
    }

    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "Failed to rename temp file to state file: {:?} -> {:?}",
            temp_path, path
        )
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::types::DownloadStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn snapshot(name: &str, id: u64, progress: u8) -> ProgressSnapshot {
        ProgressSnapshot {
            model_name: ModelName::parse(name).unwrap(),
            download_id: DownloadId(id),
            progress,
            bytes_downloaded: progress as u64,
            bytes_total: 100,
            status: DownloadStatus::Downloading,
            is_paused: false,
            origin_url: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_fresh_store_defaults() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = StateStore::open(dir.path().join("state.json")).expect("open");
        assert!(store.snapshots().is_empty());
        assert!(store.external_models().is_empty());
        assert!(!store.path().exists(), "nothing is written until a mutation");
    }

    #[test]
    fn test_download_ids_survive_reopen() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("state.json");

        {
            let store = StateStore::open(&path).expect("open");
            assert_eq!(store.allocate_download_id().unwrap(), DownloadId(1));
            assert_eq!(store.allocate_download_id().unwrap(), DownloadId(2));
        }

        let store = StateStore::open(&path).expect("reopen");
        assert_eq!(store.allocate_download_id().unwrap(), DownloadId(3));
    }

    #[test]
    fn test_snapshot_upsert_and_remove() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("state.json");
        let store = StateStore::open(&path).expect("open");

        store.upsert_snapshot(snapshot("a.gguf", 1, 10)).unwrap();
        store
            .upsert_snapshots(vec![snapshot("a.gguf", 1, 40), snapshot("b.gguf", 2, 5)])
            .unwrap();

        let reopened = StateStore::open(&path).expect("reopen");
        let name = ModelName::parse("a.gguf").unwrap();
        assert_eq!(reopened.snapshot(&name).unwrap().progress, 40);
        assert_eq!(reopened.snapshots().len(), 2);

        assert!(store.remove_snapshot(&name).unwrap().is_some());
        assert!(store.remove_snapshot(&name).unwrap().is_none());
        assert_eq!(StateStore::open(&path).unwrap().snapshots().len(), 1);
    }

    #[test]
    fn test_external_registry_persists_in_order() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("state.json");
        let store = StateStore::open(&path).expect("open");

        for name in ["z.gguf", "a.gguf"] {
            store
                .add_external_model(StoredModel {
                    name: ModelName::parse(name).unwrap(),
                    path: PathBuf::from(format!("/data/{}", name)),
                    size_bytes: 7,
                    modified_at: None,
                    is_external: true,
                })
                .unwrap();
        }

        let reopened = StateStore::open(&path).expect("reopen");
        let names: Vec<_> = reopened
            .external_models()
            .into_iter()
            .map(|m| m.name.to_string())
            .collect();
        assert_eq!(names, vec!["z.gguf", "a.gguf"]);

        let removed = store
            .remove_external_model(Path::new("/data/z.gguf"))
            .unwrap();
        assert!(removed.is_some());
        assert!(store
            .remove_external_model(Path::new("/data/missing.gguf"))
            .unwrap()
            .is_none());
        assert_eq!(StateStore::open(&path).unwrap().external_models().len(), 1);
    }

    #[test]
    fn test_corrupt_document_is_an_error() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(StateStore::open(&path).is_err());
    }

    #[test]
    fn test_concurrent_id_allocation_is_unique() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(StateStore::open(dir.path().join("state.json")).expect("open"));
        let allocated = Arc::new(RwLock::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let allocated = Arc::clone(&allocated);
                let calls = Arc::clone(&calls);
                thread::spawn(move || {
                    for _ in 0..5 {
                        let id = store.allocate_download_id().expect("allocate");
                        allocated.write().unwrap().push(id);
                        calls.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("Thread panicked");
        }

        let mut ids = allocated.read().unwrap().clone();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), calls.load(Ordering::SeqCst));
        assert_eq!(ids.last(), Some(&DownloadId(20)));
    }

    // ========================================================================
    // File locking tests
    // ========================================================================

    #[test]
    fn test_exclusive_lock_times_out_while_held() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let lock = dir.path().join("test.lock");

        let first = acquire_exclusive_lock_with_timeout(&lock, Duration::from_secs(1));
        assert!(first.is_ok(), "First exclusive lock should succeed");

        let second = acquire_exclusive_lock_with_timeout(&lock, Duration::from_millis(100));
        let err = second.expect_err("Second exclusive lock should fail while first is held");
        assert!(err.to_string().contains("Timed out"));

        drop(first);
        assert!(acquire_exclusive_lock_with_timeout(&lock, Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_exclusive_lock_blocks_shared() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let lock = dir.path().join("shared.lock");

        let _exclusive = acquire_exclusive_lock_with_timeout(&lock, Duration::from_secs(1))
            .expect("Exclusive lock should succeed");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock)
            .expect("Failed to open lock file");
        let result = acquire_shared_lock_with_timeout(&file, Duration::from_millis(100));
        assert!(result.is_err(), "Shared lock should fail while exclusive is held");
    }
}
