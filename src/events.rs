//! Events emitted to the caller of a single download invocation

use crate::error::{DownloadError, ErrorCode};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// One step in the ordered, finite event sequence of a download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownloadEvent {
    Started {
        model_id: String,
        model_name: String,
    },
    Info {
        message: String,
    },
    Warning {
        message: String,
    },
    Progress {
        progress: u8,
        speed_mbps: f64,
        eta_seconds: u64,
        method: String,
        /// Seconds since the session started, on a monotonic clock
        elapsed_secs: f64,
    },
    Completed {
        progress: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        method: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Cancelled,
    Error {
        message: String,
        code: ErrorCode,
    },
}

impl DownloadEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self::Info {
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::Warning {
            message: message.into(),
        }
    }

    pub fn completed(method: impl Into<String>) -> Self {
        Self::Completed {
            progress: 100,
            method: Some(method.into()),
            message: None,
        }
    }

    pub fn already_downloaded() -> Self {
        Self::Completed {
            progress: 100,
            method: None,
            message: Some("Already downloaded".to_string()),
        }
    }

    /// Terminal error event for a surfaced error
    pub fn error(err: &DownloadError) -> Self {
        Self::Error {
            message: err.to_string(),
            code: err.code(),
        }
    }

    /// True for completed, cancelled and error events
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Cancelled | Self::Error { .. }
        )
    }
}

/// Ordered sender for one invocation's events
///
/// If the receiving side has gone away the download has no audience left,
/// so a failed send cancels the session. Sends never outlive a cancellation:
/// a consumer that stops reading cannot hold up the attempt loop.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<DownloadEvent>,
    cancel: CancellationToken,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<DownloadEvent>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    /// Send a non-terminal event, waiting for capacity until the session is cancelled
    ///
    /// Returns false if the receiver is gone or the session was cancelled
    /// before the event could be queued.
    pub async fn emit(&self, event: DownloadEvent) -> bool {
        let sent = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return false,
            sent = self.tx.send(event) => sent,
        };
        if sent.is_err() {
            self.receiver_gone();
            return false;
        }
        true
    }

    /// Queue a progress event without waiting
    ///
    /// Progress is superseded by the next report, so when the consumer is
    /// behind and the channel is full the event is dropped.
    pub fn emit_progress(&self, event: DownloadEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::trace!("Event channel full, dropping progress update");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.receiver_gone();
                false
            }
        }
    }

    /// Send the final event of the sequence
    ///
    /// Runs after the session has been torn down, so waiting for a slow
    /// consumer here holds nothing but the channel.
    pub async fn emit_terminal(&self, event: DownloadEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::debug!("Event receiver dropped before the terminal event");
        }
    }

    fn receiver_gone(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!("Event receiver dropped, cancelling download");
            self.cancel.cancel();
        }
    }
}

/// Stream of events handed to the caller of `download`
pub type EventStream = ReceiverStream<DownloadEvent>;

/// A stream holding exactly one event
pub fn single_event(event: DownloadEvent) -> EventStream {
    let (tx, rx) = mpsc::channel(1);
    // Capacity 1 and a fresh channel: cannot fail
    let _ = tx.try_send(event);
    ReceiverStream::new(rx)
}
