// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Transfer tasks and the transports that create them.
//!
//! A transport starts one background transfer per request and reports
//! on an unbounded channel, in emission order:
//!
//! ```text
//! Begin { expected_bytes } -> Progress { .. }* -> Done | Error { .. }
//! ```
//!
//! The returned [`TransferTask`] is the only handle the manager keeps:
//! it can ask the transfer to stop and, where the transport supports
//! it, to pause and resume. Requests are fire-and-forget; nothing waits
//! for the underlying connection to actually wind down.
//!
//! Two transports ship with the crate:
//!
//! - [`HttpTransport`] streams the body with reqwest into the staging
//!   file, resuming with a `Range` request when reattached.
//! - [`BridgeTransport`] hands each transfer to the host application,
//!   for platforms whose background transfer service lives outside Rust.

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, watch, Notify};

use super::types::{DownloadId, ModelName};
use crate::sync::resilient_write;
use crate::utils::redact_url;

/// Minimum number of bytes between two `Progress` events from the HTTP transport.
const PROGRESS_STEP_BYTES: u64 = 1024 * 1024;

/// Write buffer for the staging file.
const WRITE_BUFFER_BYTES: usize = 1024 * 1024;

/// Events emitted by a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// Headers received; `expected_bytes` is 0 when unknown
    Begin { expected_bytes: u64 },
    Progress { bytes_downloaded: u64, bytes_total: u64 },
    /// All bytes written to the destination
    Done,
    Error { error: String, error_code: Option<i32> },
}

pub type EventSender = mpsc::UnboundedSender<TransferEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransferEvent>;

/// Everything a transport needs to run one transfer.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub download_id: DownloadId,
    pub model_name: ModelName,
    pub url: String,
    /// Staging path the bytes must land at
    pub destination: PathBuf,
}

/// Handle to one running transfer.
pub trait TransferTask: Send + Sync {
    /// Ask the transfer to stop. Does not wait for it to wind down.
    fn stop(&self);

    fn supports_pause(&self) -> bool {
        false
    }

    fn pause(&self) {}

    fn resume(&self) {}
}

/// Creates transfer tasks.
pub trait Transport: Send + Sync {
    fn spawn(&self, request: TransferRequest, events: EventSender) -> Arc<dyn TransferTask>;

    /// Pick up a transfer that was running before the process restarted.
    ///
    /// `request.destination` already holds the bytes written so far.
    /// Returning `None` leaves the download to the sweeper's stale-entry
    /// handling.
    fn reattach(
        &self,
        _request: TransferRequest,
        _events: EventSender,
    ) -> Option<Arc<dyn TransferTask>> {
        None
    }
}

/// Requested run state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferControl {
    Run,
    Pause,
    Stop,
}

/// [`TransferTask`] backed by a watch channel the transfer observes.
pub struct ControlHandle {
    tx: watch::Sender<TransferControl>,
    pausable: bool,
}

impl ControlHandle {
    pub fn new(pausable: bool) -> (Self, watch::Receiver<TransferControl>) {
        let (tx, rx) = watch::channel(TransferControl::Run);
        (Self { tx, pausable }, rx)
    }

    pub fn state(&self) -> TransferControl {
        *self.tx.borrow()
    }
}

impl TransferTask for ControlHandle {
    fn stop(&self) {
        self.tx.send_replace(TransferControl::Stop);
    }

    fn supports_pause(&self) -> bool {
        self.pausable
    }

    fn pause(&self) {
        if self.pausable {
            self.tx.send_if_modified(|state| {
                let changed = *state == TransferControl::Run;
                if changed {
                    *state = TransferControl::Pause;
                }
                changed
            });
        }
    }

    fn resume(&self) {
        if self.pausable {
            self.tx.send_if_modified(|state| {
                let changed = *state == TransferControl::Pause;
                if changed {
                    *state = TransferControl::Run;
                }
                changed
            });
        }
    }
}

// =============================================================================
// HTTP TRANSPORT
// =============================================================================

/// Streams model files over HTTP(S) with reqwest.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .tcp_nodelay(true)
            .connect_timeout(connect_timeout)
            .user_agent(user_agent)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }

    fn start(&self, request: TransferRequest, events: EventSender, resume: bool) -> Arc<dyn TransferTask> {
        let (handle, control) = ControlHandle::new(true);
        let client = self.client.clone();
        tokio::spawn(async move {
            run_http_transfer(client, request, events, control, resume).await;
        });
        Arc::new(handle)
    }
}

impl Transport for HttpTransport {
    fn spawn(&self, request: TransferRequest, events: EventSender) -> Arc<dyn TransferTask> {
        self.start(request, events, false)
    }

    fn reattach(&self, request: TransferRequest, events: EventSender) -> Option<Arc<dyn TransferTask>> {
        if request.url.is_empty() {
            return None;
        }
        Some(self.start(request, events, true))
    }
}

#[derive(Debug)]
struct TransferFailure {
    message: String,
    code: Option<i32>,
}

impl From<reqwest::Error> for TransferFailure {
    fn from(err: reqwest::Error) -> Self {
        let code = err.status().map(|s| i32::from(s.as_u16()));
        Self {
            message: err.without_url().to_string(),
            code,
        }
    }
}

impl From<io::Error> for TransferFailure {
    fn from(err: io::Error) -> Self {
        Self {
            message: err.to_string(),
            code: err.raw_os_error(),
        }
    }
}

async fn run_http_transfer(
    client: Client,
    request: TransferRequest,
    events: EventSender,
    mut control: watch::Receiver<TransferControl>,
    resume: bool,
) {
    tracing::debug!(
        model = %request.model_name,
        download_id = %request.download_id,
        url = %redact_url(&request.url),
        resume,
        "HTTP transfer starting"
    );
    match drive_http_transfer(&client, &request, &events, &mut control, resume).await {
        Ok(true) => {
            let _ = events.send(TransferEvent::Done);
        }
        Ok(false) => {
            tracing::debug!(model = %request.model_name, "HTTP transfer stopped");
        }
        Err(failure) => {
            let _ = events.send(TransferEvent::Error {
                error: failure.message,
                error_code: failure.code,
            });
        }
    }
}

/// Returns `Ok(true)` when the body was fully written, `Ok(false)` when stopped.
async fn drive_http_transfer(
    client: &Client,
    request: &TransferRequest,
    events: &EventSender,
    control: &mut watch::Receiver<TransferControl>,
    resume: bool,
) -> Result<bool, TransferFailure> {
    let existing = if resume {
        tokio::fs::metadata(&request.destination)
            .await
            .map(|m| m.len())
            .unwrap_or(0)
    } else {
        0
    };

    let mut builder = client.get(&request.url);
    if existing > 0 {
        builder = builder.header(RANGE, format!("bytes={}-", existing));
    }
    let response = builder.send().await?;

    let status = response.status();
    if !status.is_success() {
        return Err(TransferFailure {
            message: format!("server responded with HTTP {}", status),
            code: Some(i32::from(status.as_u16())),
        });
    }

    if *control.borrow() == TransferControl::Stop {
        return Ok(false);
    }

    let resuming = existing > 0 && status == StatusCode::PARTIAL_CONTENT;
    if existing > 0 && !resuming {
        tracing::warn!(model = %request.model_name, "Server ignored range request, restarting from zero");
    }
    let offset = if resuming { existing } else { 0 };
    let total = response.content_length().map_or(0, |len| len + offset);

    let file = if resuming {
        OpenOptions::new()
            .append(true)
            .open(&request.destination)
            .await?
    } else {
        File::create(&request.destination).await?
    };
    let mut writer = BufWriter::with_capacity(WRITE_BUFFER_BYTES, file);

    let _ = events.send(TransferEvent::Begin { expected_bytes: total });
    if offset > 0 {
        let _ = events.send(TransferEvent::Progress {
            bytes_downloaded: offset,
            bytes_total: total,
        });
    }

    let mut stream = response.bytes_stream();
    let mut downloaded = offset;
    let mut last_reported = offset;

    loop {
        let requested = *control.borrow_and_update();
        match requested {
            TransferControl::Stop => return Ok(false),
            TransferControl::Pause => {
                writer.flush().await?;
                if control.changed().await.is_err() {
                    return Ok(false);
                }
                continue;
            }
            TransferControl::Run => {}
        }

        tokio::select! {
            chunk = stream.next() => match chunk {
                Some(chunk) => {
                    let chunk = chunk?;
                    writer.write_all(&chunk).await?;
                    downloaded += chunk.len() as u64;
                    if downloaded - last_reported >= PROGRESS_STEP_BYTES {
                        last_reported = downloaded;
                        let _ = events.send(TransferEvent::Progress {
                            bytes_downloaded: downloaded,
                            bytes_total: total,
                        });
                    }
                }
                None => break,
            },
            changed = control.changed() => {
                if changed.is_err() {
                    // Handle dropped: nobody is listening any more
                    return Ok(false);
                }
            }
        }
    }

    writer.flush().await?;
    writer.into_inner().sync_all().await?;

    if downloaded != last_reported {
        let _ = events.send(TransferEvent::Progress {
            bytes_downloaded: downloaded,
            bytes_total: total.max(downloaded),
        });
    }
    Ok(true)
}

// =============================================================================
// BRIDGE TRANSPORT
// =============================================================================

/// A transfer handed to the host application by [`BridgeTransport`].
///
/// The host forwards its platform callbacks into `events` and watches
/// `controls` for stop/pause/resume requests.
pub struct BridgedTransfer {
    pub request: TransferRequest,
    pub events: EventSender,
    pub controls: watch::Receiver<TransferControl>,
    /// True when created through [`Transport::reattach`]
    pub reattached: bool,
}

impl BridgedTransfer {
    pub fn begin(&self, expected_bytes: u64) {
        let _ = self.events.send(TransferEvent::Begin { expected_bytes });
    }

    pub fn progress(&self, bytes_downloaded: u64, bytes_total: u64) {
        let _ = self.events.send(TransferEvent::Progress {
            bytes_downloaded,
            bytes_total,
        });
    }

    pub fn done(&self) {
        let _ = self.events.send(TransferEvent::Done);
    }

    pub fn fail(&self, error: impl Into<String>, error_code: Option<i32>) {
        let _ = self.events.send(TransferEvent::Error {
            error: error.into(),
            error_code,
        });
    }

    /// Latest control request from the manager.
    pub fn control(&self) -> TransferControl {
        *self.controls.borrow()
    }
}

/// Transport whose transfers are carried out by the host application.
pub struct BridgeTransport {
    pausable: bool,
    accept_reattach: bool,
    pending: RwLock<VecDeque<BridgedTransfer>>,
    notify: Notify,
}

impl BridgeTransport {
    /// `pausable` states whether the platform service can pause transfers.
    pub fn new(pausable: bool) -> Self {
        Self {
            pausable,
            accept_reattach: false,
            pending: RwLock::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Also accept transfers that survived a restart.
    pub fn accepting_reattach(mut self) -> Self {
        self.accept_reattach = true;
        self
    }

    /// Drain every transfer spawned since the last call.
    pub fn take_pending(&self) -> Vec<BridgedTransfer> {
        resilient_write(&self.pending).drain(..).collect()
    }

    /// Wait for the next spawned transfer.
    pub async fn next_transfer(&self) -> BridgedTransfer {
        loop {
            if let Some(transfer) = resilient_write(&self.pending).pop_front() {
                return transfer;
            }
            self.notify.notified().await;
        }
    }

    fn enqueue(&self, request: TransferRequest, events: EventSender, reattached: bool) -> Arc<dyn TransferTask> {
        let (handle, controls) = ControlHandle::new(self.pausable);
        resilient_write(&self.pending).push_back(BridgedTransfer {
            request,
            events,
            controls,
            reattached,
        });
        self.notify.notify_one();
        Arc::new(handle)
    }
}

impl Transport for BridgeTransport {
    fn spawn(&self, request: TransferRequest, events: EventSender) -> Arc<dyn TransferTask> {
        self.enqueue(request, events, false)
    }

    fn reattach(&self, request: TransferRequest, events: EventSender) -> Option<Arc<dyn TransferTask>> {
        self.accept_reattach
            .then(|| self.enqueue(request, events, true))
    }
}
