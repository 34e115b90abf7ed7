// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Background Download System for modeldepot
//!
//! This module provides non-blocking model downloads with:
//! - Progress events on the shared [`EventBus`](crate::events::EventBus)
//! - Pause/resume where the transport supports it
//! - Snapshots that survive restarts, reconciled by the sweeper
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │ DownloadManager │────▶│ Transport       │
//! │ (records, pump) │◀────│ (http / bridge) │
//! └────────┬────────┘     └─────────────────┘
//!          │  events             ▲ reattach
//!          ▼                     │
//! ┌─────────────────┐     ┌──────┴──────────┐
//! │ SnapshotWriter  │     │ Sweeper         │
//! │ ▶ StateStore    │◀────│ (staging scan)  │
//! └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use modeldepot::config::DepotConfig;
//! use modeldepot::download::DownloadManager;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = DepotConfig::load()?;
//! let manager = DownloadManager::open_http(&config).await?;
//! let mut events = manager.subscribe();
//!
//! let id = manager
//!     .download_model("https://example.com/llama.gguf", "llama.gguf")
//!     .await?;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # let _ = id;
//! # Ok(())
//! # }
//! ```

pub mod debounce;
pub mod manager;
pub mod state;
pub mod sweeper;
pub mod transfer;
pub mod types;

// Re-export commonly used items
pub use manager::{DownloadManager, PauseOutcome, CANCELLED_REASON, FILE_NOT_FOUND_REASON};
pub use state::{DepotState, StateStore};
pub use sweeper::SweepReport;
pub use transfer::{
    BridgeTransport, BridgedTransfer, HttpTransport, TransferControl, TransferEvent, TransferRequest,
    TransferTask, Transport,
};
pub use types::{DownloadId, DownloadStatus, ModelName, ProgressSnapshot, StoredModel};
