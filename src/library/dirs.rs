// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Filesystem gateway over the staging and library directories.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs;

use crate::download::types::ModelName;
use crate::error::{DepotError, DepotResult};

/// One regular file found by [`ModelDirs::list_files`].
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub name: ModelName,
    pub path: PathBuf,
    pub len: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// The staging ("incoming") and library directories.
#[derive(Debug, Clone)]
pub struct ModelDirs {
    staging: PathBuf,
    library: PathBuf,
}

impl ModelDirs {
    pub fn new(staging: impl Into<PathBuf>, library: impl Into<PathBuf>) -> Self {
        Self {
            staging: staging.into(),
            library: library.into(),
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }

    pub fn library_dir(&self) -> &Path {
        &self.library
    }

    pub fn staging_path(&self, name: &ModelName) -> PathBuf {
        name.join_onto(&self.staging)
    }

    pub fn library_path(&self, name: &ModelName) -> PathBuf {
        name.join_onto(&self.library)
    }

    pub async fn ensure_staging(&self) -> DepotResult<()> {
        ensure_dir(&self.staging).await
    }

    pub async fn ensure_library(&self) -> DepotResult<()> {
        ensure_dir(&self.library).await
    }

    /// Size of a regular file, or `None` if nothing is there.
    pub async fn file_len(&self, path: &Path) -> DepotResult<Option<u64>> {
        match fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DepotError::fs("stat", path, e)),
        }
    }

    pub async fn library_contains(&self, name: &ModelName) -> DepotResult<bool> {
        Ok(self.file_len(&self.library_path(name)).await?.is_some())
    }

    /// Move a staged file into the library, replacing any stale copy.
    ///
    /// Falls back to copy + delete when the two directories live on
    /// different filesystems.
    pub async fn promote(&self, name: &ModelName) -> DepotResult<u64> {
        let from = self.staging_path(name);
        let to = self.library_path(name);
        self.ensure_library().await?;

        if fs::rename(&from, &to).await.is_err() {
            // Some platforms refuse to rename over an existing file
            self.remove_if_exists(&to).await?;
            if let Err(rename_err) = fs::rename(&from, &to).await {
                tracing::debug!(model = %name, "rename failed ({}), copying instead", rename_err);
                if let Err(e) = fs::copy(&from, &to).await {
                    let _ = fs::remove_file(&to).await;
                    return Err(DepotError::fs("copy", &from, e));
                }
                self.remove_if_exists(&from).await?;
            }
        }

        self.file_len(&to)
            .await?
            .ok_or_else(|| DepotError::fs("stat", &to, io::ErrorKind::NotFound.into()))
    }

    /// Delete a file. Returns whether anything was removed.
    pub async fn remove_if_exists(&self, path: &Path) -> DepotResult<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(DepotError::fs("delete", path, e)),
        }
    }

    /// List the regular files in `dir`, ordered by name.
    ///
    /// A missing directory lists as empty. Entries that are not valid
    /// model names or that cannot be stat'd are skipped with a warning.
    pub async fn list_files(&self, dir: &Path) -> DepotResult<Vec<FileEntry>> {
        let mut read_dir = match fs::read_dir(dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(DepotError::fs("list", dir, e)),
        };

        let mut entries = Vec::new();
        loop {
            let entry = match read_dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => return Err(DepotError::fs("list", dir, e)),
            };
            let path = entry.path();

            let Some(name) = entry
                .file_name()
                .into_string()
                .ok()
                .and_then(|raw| ModelName::parse(raw).ok())
            else {
                tracing::debug!(path = %path.display(), "Skipping non-model entry");
                continue;
            };

            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Skipping unreadable file: {}", e);
                    continue;
                }
            };
            if !meta.is_file() {
                continue;
            }

            entries.push(FileEntry {
                name,
                path,
                len: meta.len(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

async fn ensure_dir(dir: &Path) -> DepotResult<()> {
    fs::create_dir_all(dir)
        .await
        .map_err(|e| DepotError::fs("create", dir, e))
}
