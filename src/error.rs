// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error taxonomy for the download engine, plus consistent formatting
//! of user-facing error messages.
//!
//! Nothing in this crate retries automatically. A [`DepotError`] is
//! either surfaced synchronously to the caller (conflicts, invalid
//! input) or converted into a terminal `failed` event on the bus
//! (transfer and integrity failures).

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Hint appended to every formatted error.
pub const DEBUG_HINT: &str = "Re-run with RUST_LOG=modeldepot=debug for details.";

/// Coarse classification of a [`DepotError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network or transport-reported failure
    Transfer,
    /// Staged file missing or empty when the transfer reported success
    Integrity,
    /// Duplicate model name on start or link
    Conflict,
    /// stat/move/copy/delete/list failure
    Filesystem,
    /// State document could not be read or written
    Persistence,
    /// Caller passed something unusable
    InvalidInput,
    /// Referenced entry does not exist
    NotFound,
}

/// Errors produced by the download engine.
#[derive(Debug, thiserror::Error)]
pub enum DepotError {
    #[error("transfer of {model} failed: {reason}")]
    Transfer { model: String, reason: String },

    #[error("downloaded file for {model} is unusable: {reason}")]
    Integrity { model: String, reason: String },

    #[error("a download for {0} is already active")]
    AlreadyDownloading(String),

    #[error("a model named {0} already exists")]
    NameTaken(String),

    #[error("failed to {op} {}: {source}", path.display())]
    Filesystem {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("state store error: {0:#}")]
    Persistence(anyhow::Error),

    #[error("invalid model name {0:?}")]
    InvalidName(String),

    #[error("{} is not a registered model path", .0.display())]
    UnknownPath(PathBuf),

    #[error("{} is outside the model library", .0.display())]
    OutsideLibrary(PathBuf),

    #[error("unsupported model source {0:?}")]
    UnsupportedSource(String),
}

impl DepotError {
    /// Build a filesystem error for the given operation and path.
    pub fn fs(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Filesystem {
            op,
            path: path.into(),
            source,
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transfer { .. } => ErrorKind::Transfer,
            Self::Integrity { .. } => ErrorKind::Integrity,
            Self::AlreadyDownloading(_) | Self::NameTaken(_) => ErrorKind::Conflict,
            Self::Filesystem { .. } => ErrorKind::Filesystem,
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::InvalidName(_) | Self::OutsideLibrary(_) | Self::UnsupportedSource(_) => {
                ErrorKind::InvalidInput
            }
            Self::UnknownPath(_) => ErrorKind::NotFound,
        }
    }

    /// Render this error for a terminal user, with likely causes and fixes.
    pub fn to_user_message(&self) -> String {
        let builder = ErrorBuilder::new(self.to_string());
        let builder = match self.kind() {
            ErrorKind::Transfer => builder
                .cause("The network dropped or the server rejected the request")
                .fix("Check the URL and your connection, then download again"),
            ErrorKind::Integrity => builder
                .cause("The transfer ended without writing any data")
                .fix("Download the model again"),
            ErrorKind::Conflict => builder
                .cause("Model names must be unique across downloads, the library and linked files")
                .fix("Pick another name or delete the existing model first: modeldepot list"),
            ErrorKind::Filesystem => builder
                .cause("The disk is full or the directory is not writable")
                .fix("Check free space and permissions on the model directories"),
            ErrorKind::Persistence => builder
                .cause("The state file is corrupt or locked by another instance")
                .fix("Close other modeldepot instances and retry"),
            ErrorKind::InvalidInput => builder
                .cause("Names may not be empty, start with '.', or contain path separators")
                .cause("Only files inside the model library or linked models can be deleted"),
            ErrorKind::NotFound => builder.fix("List known models: modeldepot list"),
        };
        builder.build()
    }
}

impl From<anyhow::Error> for DepotError {
    fn from(err: anyhow::Error) -> Self {
        Self::Persistence(err)
    }
}

/// Result alias used throughout the crate.
pub type DepotResult<T> = Result<T, DepotError>;

/// Formats an error message with title, causes, fixes, and a debug hint.
///
/// # Example
///
/// ```
/// use modeldepot::error::format_error;
///
/// let msg = format_error(
///     "Failed to promote m.gguf",
///     &["Library directory is read-only"],
///     &["Check permissions on ~/.modeldepot/models"],
/// );
/// assert!(msg.contains("Possible causes:"));
/// ```
pub fn format_error(title: &str, causes: &[&str], fixes: &[&str]) -> String {
    let mut output = format!("[✗] {}\n\n", title);

    if !causes.is_empty() {
        output.push_str("Possible causes:\n");
        for cause in causes {
            output.push_str(&format!("  - {}\n", cause));
        }
        output.push('\n');
    }

    if !fixes.is_empty() {
        output.push_str("Try these fixes:\n");
        for (i, fix) in fixes.iter().enumerate() {
            output.push_str(&format!("  {}. {}\n", i + 1, fix));
        }
        output.push('\n');
    }

    output.push_str(DEBUG_HINT);
    output
}

/// Builder for constructing formatted error messages.
#[derive(Debug, Clone)]
pub struct ErrorBuilder {
    title: String,
    causes: Vec<String>,
    fixes: Vec<String>,
}

impl ErrorBuilder {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            causes: Vec::new(),
            fixes: Vec::new(),
        }
    }

    pub fn cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    pub fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fixes.push(fix.into());
        self
    }

    pub fn build(self) -> String {
        let causes: Vec<&str> = self.causes.iter().map(String::as_str).collect();
        let fixes: Vec<&str> = self.fixes.iter().map(String::as_str).collect();
        format_error(&self.title, &causes, &fixes)
    }
}

impl fmt::Display for ErrorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.clone().build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_error() {
        let error = format_error("Test Error", &["Cause 1", "Cause 2"], &["Fix 1", "Fix 2"]);

        assert!(error.contains("[✗] Test Error"));
        assert!(error.contains("  - Cause 1"));
        assert!(error.contains("  - Cause 2"));
        assert!(error.contains("  1. Fix 1"));
        assert!(error.contains("  2. Fix 2"));
        assert!(error.ends_with(DEBUG_HINT));
    }

    #[test]
    fn test_empty_causes_and_fixes() {
        let error = format_error("Empty test", &[], &[]);
        assert!(!error.contains("Possible causes:"));
        assert!(!error.contains("Try these fixes:"));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            DepotError::AlreadyDownloading("m.gguf".into()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(DepotError::NameTaken("m.gguf".into()).kind(), ErrorKind::Conflict);
        assert_eq!(
            DepotError::fs("move", "/tmp/x", io::Error::other("boom")).kind(),
            ErrorKind::Filesystem
        );
        assert_eq!(
            DepotError::from(anyhow::anyhow!("bad json")).kind(),
            ErrorKind::Persistence
        );
    }

    #[test]
    fn test_user_message_mentions_title_and_fix() {
        let msg = DepotError::NameTaken("llama.gguf".into()).to_user_message();
        assert!(msg.contains("[✗] a model named llama.gguf already exists"));
        assert!(msg.contains("Try these fixes:"));
    }
}
