// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process event bus.
//!
//! A thin typed wrapper over `tokio::sync::broadcast`. Every payload is a
//! variant of [`DepotEvent`], so subscribers match on a closed set of
//! topics instead of parsing loosely-typed JSON. Publishing never blocks
//! and never fails: with no subscribers the event is simply dropped, and
//! a subscriber that falls more than `capacity` events behind sees
//! `RecvError::Lagged` on its next receive.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::download::types::{DownloadId, DownloadStatus, ModelName, ProgressSnapshot};

/// Progress or terminal status of one download.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgressEvent {
    pub model_name: ModelName,
    pub download_id: DownloadId,
    pub progress: u8,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub status: DownloadStatus,
    pub is_paused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DownloadProgressEvent {
    pub fn from_snapshot(snapshot: &ProgressSnapshot) -> Self {
        Self {
            model_name: snapshot.model_name.clone(),
            download_id: snapshot.download_id,
            progress: snapshot.progress,
            bytes_downloaded: snapshot.bytes_downloaded,
            total_bytes: snapshot.bytes_total,
            status: snapshot.status,
            is_paused: snapshot.is_paused,
            error: None,
        }
    }

    /// Same event with a terminal status and optional reason.
    pub fn terminal(mut self, status: DownloadStatus, error: Option<String>) -> Self {
        self.status = status;
        self.error = error;
        self.is_paused = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    Importing,
    Completed,
    Error,
}

/// Status of an external link or copy-in import.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportProgressEvent {
    pub model_name: ModelName,
    pub status: ImportStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Informational notice about a download that did not change its state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadNotice {
    pub model_name: ModelName,
    pub download_id: DownloadId,
    pub message: String,
}

/// Every event published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "topic", content = "payload", rename_all = "camelCase")]
pub enum DepotEvent {
    DownloadProgress(DownloadProgressEvent),
    /// The stored-model inventory is stale and should be re-queried
    ModelsChanged,
    ImportProgress(ImportProgressEvent),
    DownloadNotice(DownloadNotice),
}

impl DepotEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::DownloadProgress(_) => "downloadProgress",
            Self::ModelsChanged => "modelsChanged",
            Self::ImportProgress(_) => "importProgress",
            Self::DownloadNotice(_) => "downloadNotice",
        }
    }
}

/// Broadcast bus for [`DepotEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DepotEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DepotEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: DepotEvent) {
        tracing::trace!(topic = event.topic(), "publish");
        let _ = self.tx.send(event);
    }

    pub fn publish_progress(&self, event: DownloadProgressEvent) {
        self.publish(DepotEvent::DownloadProgress(event));
    }

    pub fn publish_models_changed(&self) {
        self.publish(DepotEvent::ModelsChanged);
    }

    pub fn publish_import(&self, model_name: &ModelName, status: ImportStatus, error: Option<String>) {
        self.publish(DepotEvent::ImportProgress(ImportProgressEvent {
            model_name: model_name.clone(),
            status,
            error,
        }));
    }
}
