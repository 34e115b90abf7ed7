// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download types shared by the manager, the sweeper and the state store.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::transfer::TransferTask;
use crate::error::DepotError;

/// Monotonically increasing download identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadId(pub u64);

impl DownloadId {
    /// Held by a name reservation before its real id is allocated.
    /// Allocated ids start at 1.
    pub const UNASSIGNED: DownloadId = DownloadId(0);
}

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Logical model identifier, also used verbatim as the on-disk filename
/// in both the staging and library directories.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelName(String);

impl ModelName {
    /// Validate a model name.
    ///
    /// Rejects empty names, `.`/`..`, hidden names, and anything that
    /// could escape the directory it is joined onto.
    pub fn parse(name: impl Into<String>) -> Result<Self, DepotError> {
        let name = name.into();
        let invalid = name.is_empty()
            || name.starts_with('.')
            || name.contains(['/', '\\', '\0'])
            || name.trim() != name;
        if invalid {
            return Err(DepotError::InvalidName(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path of this model inside `dir`.
    pub fn join_onto(&self, dir: &Path) -> PathBuf {
        dir.join(&self.0)
    }
}

impl TryFrom<String> for ModelName {
    type Error = DepotError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ModelName> for String {
    fn from(name: ModelName) -> Self {
        name.0
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ModelName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Status of a download.
///
/// `Downloading` and `Paused` are the only re-enterable states; the last
/// three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Registered, transfer not yet begun
    Queued,
    /// Bytes are flowing
    Downloading,
    /// Paused by user
    Paused,
    /// Promoted into the library
    Completed,
    /// Transfer or integrity failure
    Failed,
    /// Cancelled by user
    Cancelled,
}

impl DownloadStatus {
    /// Returns true if the download has finished (success, failure or cancel).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress percentage for a byte count, clamped to `0..=100`.
///
/// A total of zero means "unknown" and always yields 0.
pub fn progress_percent(bytes_downloaded: u64, bytes_total: u64) -> u8 {
    if bytes_total == 0 {
        return 0;
    }
    let pct = (bytes_downloaded as f64 / bytes_total as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

/// Persisted progress record for one model's download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub model_name: ModelName,
    pub download_id: DownloadId,
    pub progress: u8,
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
    pub status: DownloadStatus,
    #[serde(default)]
    pub is_paused: bool,
    /// Origin of the transfer, kept so a surviving transfer can be reattached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// In-memory bookkeeping for one live transfer. Never persisted.
pub struct TransferRecord {
    pub download_id: DownloadId,
    pub model_name: ModelName,
    /// Set once the transport has handed back its task.
    pub task: Option<Arc<dyn TransferTask>>,
    pub staging_path: PathBuf,
    pub origin_url: String,
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
    pub progress: u8,
    pub status: DownloadStatus,
    pub is_paused: bool,
    /// Whether a `begin` event has been accepted
    pub began: bool,
    /// Set while the `done` handler is promoting the staged file
    pub finalizing: bool,
}

impl TransferRecord {
    pub fn new(
        download_id: DownloadId,
        model_name: ModelName,
        staging_path: PathBuf,
        origin_url: impl Into<String>,
    ) -> Self {
        Self {
            download_id,
            model_name,
            task: None,
            staging_path,
            origin_url: origin_url.into(),
            bytes_downloaded: 0,
            bytes_total: 0,
            progress: 0,
            status: DownloadStatus::Queued,
            is_paused: false,
            began: false,
            finalizing: false,
        }
    }

    /// Placeholder that holds `model_name` while a start or sweep settles.
    ///
    /// Flagged `finalizing`, so no event handler or cancel will touch it.
    pub fn reserved(model_name: ModelName, staging_path: PathBuf) -> Self {
        let mut record = Self::new(DownloadId::UNASSIGNED, model_name, staging_path, "");
        record.finalizing = true;
        record
    }

    /// Rebuild a record from a persisted snapshot (reattach after restart).
    ///
    /// The reattached transfer announces itself with a fresh `begin`.
    pub fn from_snapshot(snapshot: &ProgressSnapshot, staging_path: PathBuf) -> Self {
        Self {
            download_id: snapshot.download_id,
            model_name: snapshot.model_name.clone(),
            task: None,
            staging_path,
            origin_url: snapshot.origin_url.clone().unwrap_or_default(),
            bytes_downloaded: snapshot.bytes_downloaded,
            bytes_total: snapshot.bytes_total,
            progress: snapshot.progress,
            status: snapshot.status,
            is_paused: snapshot.is_paused,
            began: false,
            finalizing: false,
        }
    }

    /// Apply a byte count, keeping progress monotonic and clamped.
    pub fn apply_progress(&mut self, bytes_downloaded: u64, bytes_total: u64) {
        if bytes_total > 0 {
            self.bytes_total = bytes_total;
        }
        self.bytes_downloaded = bytes_downloaded;
        let pct = progress_percent(bytes_downloaded, self.bytes_total);
        self.progress = self.progress.max(pct);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            model_name: self.model_name.clone(),
            download_id: self.download_id,
            progress: self.progress,
            bytes_downloaded: self.bytes_downloaded,
            bytes_total: self.bytes_total,
            status: self.status,
            is_paused: self.is_paused,
            origin_url: (!self.origin_url.is_empty()).then(|| self.origin_url.clone()),
            updated_at: Utc::now(),
        }
    }
}

/// One row of the user-visible model inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredModel {
    pub name: ModelName,
    pub path: PathBuf,
    pub size_bytes: u64,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    pub is_external: bool,
}
