// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The model library: what is on disk, what is linked from elsewhere,
//! and the rules for adding and removing either.
//!
//! The inventory is always recomputed from the library directory plus
//! the external registry; there is no cached listing to go stale.

pub mod dirs;
pub mod registry;

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use crate::download::state::StateStore;
use crate::download::types::{ModelName, StoredModel};
use crate::error::DepotResult;
use crate::events::EventBus;
use crate::sync::resilient_write;

pub use dirs::{FileEntry, ModelDirs};
pub use registry::{DeleteOutcome, ModelSource};

/// Inventory queries plus the external link registry.
pub struct Library {
    dirs: ModelDirs,
    store: Arc<StateStore>,
    bus: EventBus,
    /// Names with a link or copy-in in flight
    linking: Arc<RwLock<HashSet<ModelName>>>,
}

impl Library {
    pub fn new(dirs: ModelDirs, store: Arc<StateStore>, bus: EventBus) -> Self {
        Self {
            dirs,
            store,
            bus,
            linking: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub fn dirs(&self) -> &ModelDirs {
        &self.dirs
    }

    /// Every model the user has: library files first (by name), then
    /// registry entries in link order.
    ///
    /// Creates the library directory if it does not exist yet. Files that
    /// cannot be stat'd are skipped, never failing the whole listing.
    pub async fn stored_models(&self) -> DepotResult<Vec<StoredModel>> {
        let library = self.dirs.library_dir();
        let mut models = match self.dirs.list_files(library).await {
            Ok(files) => files
                .into_iter()
                .map(|file| StoredModel {
                    name: file.name,
                    path: file.path,
                    size_bytes: file.len,
                    modified_at: file.modified,
                    is_external: false,
                })
                .collect(),
            Err(e) => {
                tracing::warn!("Failed to list model library: {}", e);
                Vec::new()
            }
        };

        if let Err(e) = self.dirs.ensure_library().await {
            tracing::warn!("Failed to create model library: {}", e);
        }

        models.extend(self.store.external_models());
        Ok(models)
    }

    /// True if `name` is a library file or a registry entry.
    pub async fn name_in_use(&self, name: &ModelName) -> DepotResult<bool> {
        if self.is_registered(name) {
            return Ok(true);
        }
        self.dirs.library_contains(name).await
    }

    fn is_registered(&self, name: &ModelName) -> bool {
        self.store
            .external_models()
            .iter()
            .any(|model| &model.name == name)
    }

    /// Claim `name` for an in-flight link. `None` if already claimed.
    fn reserve(&self, name: &ModelName) -> Option<LinkReservation> {
        let mut linking = resilient_write(&self.linking);
        linking.insert(name.clone()).then(|| LinkReservation {
            name: name.clone(),
            linking: Arc::clone(&self.linking),
        })
    }
}

/// Releases a name claimed by [`Library::reserve`] when dropped.
struct LinkReservation {
    name: ModelName,
    linking: Arc<RwLock<HashSet<ModelName>>>,
}

impl Drop for LinkReservation {
    fn drop(&mut self) {
        resilient_write(&self.linking).remove(&self.name);
    }
}
