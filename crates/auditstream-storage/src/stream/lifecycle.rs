//! Stream Lifecycle
//!
//! A stream moves through a small, monotone state machine published on a
//! `watch` channel. Producers, the event loop and upload tasks all observe the
//! same value.
//!
//! ```text
//!             complete(Complete | Flush)
//!  Running ─────────────────────────────► Draining(mode)
//!     │                                        │
//!     │ cancel()                      cancel() │
//!     ▼                                        ▼
//!  Cancelled ◄─────────────────────────────────┘
//!     │
//!     │ event loop exits (from any state)
//!     ▼
//!  Terminated
//! ```
//!
//! - `complete` only leaves `Running`. Once a stream is draining or cancelled,
//!   further completion requests change nothing, and a cancel that arrives
//!   while draining wins.
//! - `Terminated` is set exactly when the event loop has exited and is final.

use tokio::sync::watch;

/// What `complete` asked the event loop to do with the upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Upload the last slice and complete the multipart upload
    Complete,
    /// Upload the last slice but leave the multipart upload open for resuming
    Flush,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Running,
    Draining(CompletionMode),
    Cancelled,
    Terminated,
}

impl Lifecycle {
    /// The stream stopped abruptly or its event loop is gone.
    pub fn is_done(&self) -> bool {
        matches!(self, Lifecycle::Cancelled | Lifecycle::Terminated)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Lifecycle::Running)
    }
}

/// Owner side of the lifecycle channel.
#[derive(Debug)]
pub(crate) struct LifecycleHandle {
    tx: watch::Sender<Lifecycle>,
}

impl LifecycleHandle {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(Lifecycle::Running);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Lifecycle> {
        self.tx.subscribe()
    }

    pub(crate) fn current(&self) -> Lifecycle {
        *self.tx.borrow()
    }

    /// Ask the event loop to drain. Returns false if the stream already left
    /// `Running`.
    pub(crate) fn complete(&self, mode: CompletionMode) -> bool {
        self.tx.send_if_modified(|state| {
            if state.is_running() {
                *state = Lifecycle::Draining(mode);
                true
            } else {
                false
            }
        })
    }

    /// Stop the stream abruptly. Returns false if it was already stopped.
    pub(crate) fn cancel(&self) -> bool {
        self.tx.send_if_modified(|state| match state {
            Lifecycle::Running | Lifecycle::Draining(_) => {
                *state = Lifecycle::Cancelled;
                true
            }
            Lifecycle::Cancelled | Lifecycle::Terminated => false,
        })
    }

    /// Mark the event loop as exited.
    pub(crate) fn terminate(&self) {
        self.tx.send_if_modified(|state| {
            if *state == Lifecycle::Terminated {
                false
            } else {
                *state = Lifecycle::Terminated;
                true
            }
        });
    }
}

/// Resolves once the stream is cancelled or its event loop exited.
pub(crate) async fn cancelled(rx: &mut watch::Receiver<Lifecycle>) {
    // A dropped sender means the stream is gone
    let _ = rx.wait_for(Lifecycle::is_done).await;
}

/// Resolves once the event loop exited.
pub(crate) async fn terminated(rx: &mut watch::Receiver<Lifecycle>) {
    let _ = rx.wait_for(|state| *state == Lifecycle::Terminated).await;
}

/// Observer returned by `AuditStream::done`.
#[derive(Debug, Clone)]
pub struct Done {
    rx: watch::Receiver<Lifecycle>,
}

impl Done {
    pub(crate) fn new(rx: watch::Receiver<Lifecycle>) -> Self {
        Self { rx }
    }

    /// The stream was cancelled or has finished.
    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_done()
    }

    /// Wait until the stream is cancelled or has finished.
    pub async fn wait(&mut self) {
        cancelled(&mut self.rx).await
    }
}
