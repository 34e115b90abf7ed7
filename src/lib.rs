// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! modeldepot - on-device model download manager
//!
//! Downloads large model files in the background, keeps an inventory of
//! what is on disk, and links models that live elsewhere without copying
//! them.
//!
//! # Core Modules
//!
//! - [`download`] - Download lifecycle, transports, persistence and the sweeper
//! - [`library`] - Inventory, external link registry and deletion
//! - [`events`] - Typed event bus for progress and inventory changes
//! - [`config`] - Home directory and tunables
//! - [`error`] - Error taxonomy and user-facing formatting

pub mod config;
pub mod download;
pub mod error;
pub mod events;
pub mod library;
pub mod sync;
pub mod utils;

pub use config::DepotConfig;
pub use download::{
    DownloadId, DownloadManager, DownloadStatus, ModelName, PauseOutcome, ProgressSnapshot, StoredModel,
    SweepReport,
};
pub use error::{DepotError, DepotResult, ErrorKind};
pub use events::{DepotEvent, DownloadProgressEvent, EventBus, ImportStatus};
pub use library::{DeleteOutcome, ModelSource};
