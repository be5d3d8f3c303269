//! Progress events and cooperative cancellation.
//!
//! The orchestration core never talks to a presentation layer directly. It
//! pushes [`ProgressEvent`]s into an unbounded channel; whoever holds the
//! receiver (CLI, GUI, test) decides how to render them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressKind {
    /// Human-readable status line.
    Line(String),
    /// Raw chunk of remote command output, not line-buffered.
    Output(String),
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub at: DateTime<Utc>,
    pub kind: ProgressKind,
}

/// A cloneable handle for publishing progress.
///
/// Sends to a dropped receiver are silently discarded.
#[derive(Clone, Default)]
pub struct Progress {
    sender: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl Progress {
    /// Create a progress handle and the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { sender: Some(tx) }, rx)
    }

    /// A handle that only mirrors lines to `tracing`.
    pub fn silent() -> Self {
        Self::default()
    }

    /// Publish a status line. Also logged at `info`.
    pub fn line(&self, message: impl Into<String>) {
        let message = message.into();
        info!(target: "progress", "{message}");
        self.send(ProgressKind::Line(message));
    }

    /// Publish a raw output chunk from a running command.
    pub fn output(&self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.send(ProgressKind::Output(chunk.to_owned()));
    }

    fn send(&self, kind: ProgressKind) {
        if let Some(tx) = &self.sender {
            let _ = tx.send(ProgressEvent {
                at: Utc::now(),
                kind,
            });
        }
    }
}

/// Cooperative cancellation flag shared between the caller and one attempt.
#[derive(Clone, Default, Debug)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Error::Cancelled)` once [`cancel`](Self::cancel) has been called.
    pub fn check(&self) -> crate::error::Result<()> {
        if self.is_cancelled() {
            Err(crate::error::Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
