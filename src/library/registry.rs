// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! External link registry.
//!
//! A model the user already has somewhere else is either referenced in
//! place (a registry row, no copy) or, when the host can only hand over
//! an opaque stream, copied into the library as an ordinary file.
//! Deleting a registry row never touches the file it points to.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs::{self, OpenOptions};
use tokio::io::{self, AsyncRead, AsyncWriteExt};

use super::Library;
use crate::download::types::{ModelName, StoredModel};
use crate::error::{DepotError, DepotResult};
use crate::events::ImportStatus;

/// Where a model being linked comes from.
pub enum ModelSource {
    /// A stable path native code can open directly
    Path(PathBuf),
    /// An opaque handle the host already opened; bytes are copied in
    Stream {
        reader: Box<dyn AsyncRead + Send + Unpin>,
        size_hint: Option<u64>,
    },
}

impl ModelSource {
    /// Interpret a `file://` URI or a plain filesystem path.
    ///
    /// Any other scheme (platform content handles and the like) has to
    /// be opened by the host and passed as [`ModelSource::Stream`].
    pub fn from_uri(uri: &str) -> DepotResult<Self> {
        if uri.starts_with("file:") {
            let parsed = url::Url::parse(uri)
                .map_err(|_| DepotError::UnsupportedSource(uri.to_string()))?;
            return parsed
                .to_file_path()
                .map(Self::Path)
                .map_err(|_| DepotError::UnsupportedSource(uri.to_string()));
        }
        if uri.is_empty() || uri.contains("://") {
            return Err(DepotError::UnsupportedSource(uri.to_string()));
        }
        Ok(Self::Path(PathBuf::from(uri)))
    }
}

impl fmt::Debug for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Stream { size_hint, .. } => f
                .debug_struct("Stream")
                .field("size_hint", size_hint)
                .finish_non_exhaustive(),
        }
    }
}

/// What [`Library::delete_model`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome {
    /// A registry row was removed; the user's file is untouched
    Unlinked(StoredModel),
    /// A library file was deleted from disk
    Deleted(PathBuf),
}

impl Library {
    /// Link a model that lives outside the library.
    ///
    /// Rejects a name already used by a library file, a registry entry,
    /// or another link in flight. A failed copy leaves neither a registry
    /// row nor a partial file behind.
    pub async fn link_external(&self, source: ModelSource, name: ModelName) -> DepotResult<StoredModel> {
        let Some(_reservation) = self.reserve(&name) else {
            return Err(DepotError::NameTaken(name.to_string()));
        };
        if self.name_in_use(&name).await? {
            return Err(DepotError::NameTaken(name.to_string()));
        }

        self.bus.publish_import(&name, ImportStatus::Importing, None);
        let result = match source {
            ModelSource::Path(path) => self.link_in_place(&path, &name).await,
            ModelSource::Stream { reader, size_hint } => {
                self.copy_into_library(reader, size_hint, &name).await
            }
        };

        match &result {
            Ok(model) => {
                tracing::info!(
                    model = %name,
                    path = %model.path.display(),
                    external = model.is_external,
                    "Linked model"
                );
                self.bus.publish_import(&name, ImportStatus::Completed, None);
                self.bus.publish_models_changed();
            }
            Err(e) => {
                tracing::warn!(model = %name, "Failed to link model: {}", e);
                self.bus
                    .publish_import(&name, ImportStatus::Error, Some(e.to_string()));
            }
        }
        result
    }

    async fn link_in_place(&self, origin: &Path, name: &ModelName) -> DepotResult<StoredModel> {
        let path = fs::canonicalize(origin)
            .await
            .map_err(|e| DepotError::fs("resolve", origin, e))?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| DepotError::fs("stat", &path, e))?;
        if !meta.is_file() {
            return Err(DepotError::fs(
                "link",
                &path,
                io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }

        // Linking a file that is already in the library adds nothing
        if path.parent() == fs::canonicalize(self.dirs.library_dir()).await.ok().as_deref() {
            return Err(DepotError::NameTaken(name.to_string()));
        }

        let model = StoredModel {
            name: name.clone(),
            path,
            size_bytes: meta.len(),
            modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
            is_external: true,
        };
        self.store.add_external_model(model.clone())?;
        Ok(model)
    }

    async fn copy_into_library(
        &self,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
        size_hint: Option<u64>,
        name: &ModelName,
    ) -> DepotResult<StoredModel> {
        self.dirs.ensure_library().await?;
        let dest = self.dirs.library_path(name);

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&dest)
            .await
            .map_err(|e| DepotError::fs("create", &dest, e))?;

        let copied = async {
            let n = io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<_, io::Error>(n)
        }
        .await;
        drop(file);

        let copied = match copied {
            Ok(n) => n,
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&dest).await {
                    tracing::warn!(path = %dest.display(), "Failed to remove partial copy: {}", cleanup);
                }
                return Err(DepotError::fs("copy", &dest, e));
            }
        };

        if let Some(expected) = size_hint.filter(|&expected| expected != copied) {
            tracing::warn!(model = %name, expected, copied, "Copied size differs from source size");
        }

        let modified_at = fs::metadata(&dest)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);
        Ok(StoredModel {
            name: name.clone(),
            path: dest,
            size_bytes: copied,
            modified_at,
            is_external: false,
        })
    }

    /// Delete a model by path.
    ///
    /// A registry path only loses its registry row. A library path has
    /// its file removed. Anything else is refused.
    pub async fn delete_model(&self, path: &Path) -> DepotResult<DeleteOutcome> {
        if let Some(model) = self.unlink(path).await? {
            tracing::info!(model = %model.name, "Removed external link, file left in place");
            self.bus.publish_models_changed();
            return Ok(DeleteOutcome::Unlinked(model));
        }

        let library = fs::canonicalize(self.dirs.library_dir()).await.ok();
        let target = fs::canonicalize(path)
            .await
            .map_err(|_| DepotError::UnknownPath(path.to_path_buf()))?;
        if library.is_none() || target.parent() != library.as_deref() {
            return Err(DepotError::OutsideLibrary(path.to_path_buf()));
        }

        if !self.dirs.remove_if_exists(&target).await? {
            return Err(DepotError::UnknownPath(path.to_path_buf()));
        }
        tracing::info!(path = %target.display(), "Deleted library model");
        self.bus.publish_models_changed();
        Ok(DeleteOutcome::Deleted(target))
    }

    async fn unlink(&self, path: &Path) -> DepotResult<Option<StoredModel>> {
        if let Some(model) = self.store.remove_external_model(path)? {
            return Ok(Some(model));
        }
        // Registry paths are stored canonicalized
        match fs::canonicalize(path).await {
            Ok(resolved) if resolved != path => Ok(self.store.remove_external_model(&resolved)?),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::state::StateStore;
    use crate::events::{DepotEvent, EventBus};
    use crate::library::ModelDirs;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tempfile::TempDir;
    use tokio::io::ReadBuf;

    fn library(tmp: &TempDir) -> Library {
        let store = Arc::new(StateStore::open(tmp.path().join("state.json")).expect("open"));
        let dirs = ModelDirs::new(tmp.path().join("incoming"), tmp.path().join("models"));
        Library::new(dirs, store, EventBus::new(64))
    }

    fn name(raw: &str) -> ModelName {
        ModelName::parse(raw).unwrap()
    }

    /// Yields some bytes, then fails.
    struct FailingReader {
        sent: bool,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.sent {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "handle revoked")));
            }
            self.sent = true;
            buf.put_slice(b"partial");
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_source_from_uri() {
        assert!(matches!(
            ModelSource::from_uri("/sdcard/m.gguf").unwrap(),
            ModelSource::Path(p) if p == Path::new("/sdcard/m.gguf")
        ));
        assert!(matches!(
            ModelSource::from_uri("file:///sdcard/my%20model.gguf").unwrap(),
            ModelSource::Path(p) if p == Path::new("/sdcard/my model.gguf")
        ));
        assert!(ModelSource::from_uri("content://media/external/123").is_err());
        assert!(ModelSource::from_uri("").is_err());
    }

    #[tokio::test]
    async fn test_link_then_delete_leaves_origin_untouched() {
        let tmp = TempDir::new().expect("Failed to create temp dir");
        let library = library(&tmp);
        let origin = tmp.path().join("downloads").join("mine.gguf");
        std::fs::create_dir_all(origin.parent().unwrap()).unwrap();
        std::fs::write(&origin, b"user owned bytes").unwrap();

        let model = library
            .link_external(ModelSource::Path(origin.clone()), name("mine.gguf"))
            .await
            .expect("link");
        assert!(model.is_external);
        assert_eq!(model.size_bytes, 16);

        let outcome = library.delete_model(&origin).await.expect("delete");
        assert_eq!(outcome, DeleteOutcome::Unlinked(model));
        assert_eq!(std::fs::read(&origin).unwrap(), b"user owned bytes");
        assert!(library.stored_models().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_link_name_rejected() {
        let tmp = TempDir::new().expect("Failed to create temp dir");
        let library = library(&tmp);
        let origin = tmp.path().join("a.bin");
        std::fs::write(&origin, b"abc").unwrap();

        library
            .link_external(ModelSource::Path(origin.clone()), name("dup.gguf"))
            .await
            .expect("first link");
        let second = library
            .link_external(ModelSource::Path(origin), name("dup.gguf"))
            .await;

        let err = second.expect_err("second link must be rejected");
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
        assert_eq!(library.store.external_models().len(), 1);
    }

    #[tokio::test]
    async fn test_link_name_collides_with_library_file() {
        let tmp = TempDir::new().expect("Failed to create temp dir");
        let library = library(&tmp);
        library.dirs().ensure_library().await.unwrap();
        std::fs::write(library.dirs().library_dir().join("taken.gguf"), b"x").unwrap();
        let origin = tmp.path().join("other.bin");
        std::fs::write(&origin, b"y").unwrap();

        let result = library
            .link_external(ModelSource::Path(origin), name("taken.gguf"))
            .await;
        assert!(matches!(result, Err(DepotError::NameTaken(_))));
    }

    #[tokio::test]
    async fn test_stream_copy_becomes_library_file() {
        let tmp = TempDir::new().expect("Failed to create temp dir");
        let library = library(&tmp);
        let mut events = library.bus.subscribe();

        let bytes: &'static [u8] = b"streamed model bytes";
        let model = library
            .link_external(
                ModelSource::Stream {
                    reader: Box::new(bytes),
                    size_hint: Some(bytes.len() as u64),
                },
                name("copied.gguf"),
            )
            .await
            .expect("copy in");

        assert!(!model.is_external);
        assert_eq!(std::fs::read(&model.path).unwrap(), bytes);
        assert!(library.store.external_models().is_empty());

        let topics: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| match e {
                DepotEvent::ImportProgress(p) => format!("import:{:?}", p.status),
                other => other.topic().to_string(),
            })
            .collect();
        assert_eq!(topics, vec!["import:Importing", "import:Completed", "modelsChanged"]);

        // A copied model is a plain library file: deleting removes it
        let outcome = library.delete_model(&model.path).await.expect("delete");
        assert!(matches!(outcome, DeleteOutcome::Deleted(_)));
        assert!(!model.path.exists());
    }

    #[tokio::test]
    async fn test_failed_copy_rolls_back() {
        let tmp = TempDir::new().expect("Failed to create temp dir");
        let library = library(&tmp);

        let result = library
            .link_external(
                ModelSource::Stream {
                    reader: Box::new(FailingReader { sent: false }),
                    size_hint: None,
                },
                name("broken.gguf"),
            )
            .await;

        assert!(result.is_err());
        assert!(!library.dirs().library_dir().join("broken.gguf").exists());
        assert!(library.store.external_models().is_empty());
        assert!(library.stored_models().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_refuses_paths_outside_library() {
        let tmp = TempDir::new().expect("Failed to create temp dir");
        let library = library(&tmp);
        library.dirs().ensure_library().await.unwrap();
        let stray = tmp.path().join("stray.gguf");
        std::fs::write(&stray, b"keep me").unwrap();

        let result = library.delete_model(&stray).await;
        assert!(matches!(result, Err(DepotError::OutsideLibrary(_))));
        assert!(stray.exists());

        let missing = library.dirs().library_dir().join("ghost.gguf");
        assert!(matches!(
            library.delete_model(&missing).await,
            Err(DepotError::UnknownPath(_))
        ));
    }
}
