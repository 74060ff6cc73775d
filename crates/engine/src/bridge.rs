//! Event bridge between a background calculation and the foreground context.
//!
//! The calculation thread posts [`ForegroundMessage`]s on an unbounded channel;
//! the foreground drains them in order and applies them to its
//! [`ForegroundUi`]. Prompt messages carry a oneshot reply channel: the
//! calculation thread blocks on it while the foreground keeps running its own
//! loop.
//!
//! ```text
//! calc thread                    foreground
//!     │ Progress ───────────────────►│ on_progress
//!     │ UndefinedVariable{reply} ───►│ on_undefined_variable (async)
//!     │◄──────────────────── reply ──┤
//!     │ Completed(outcome) ─────────►│ on_complete
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::events::{ErrorObserver, Observers, ProgressObserver, UndefinedVariableObserver};
use crate::traits::{EngineError, EngineResult};
use crate::types::{
    CalculationError, CalculationResult, ErrorDecision, EventKind, EventSet, ProgressControl,
    ProgressEvent,
};

#[derive(Debug)]
pub enum ForegroundMessage {
    Progress(ProgressEvent),
    UndefinedVariable {
        name: String,
        reply: oneshot::Sender<Option<String>>,
    },
    Error {
        error: CalculationError,
        reply: oneshot::Sender<ErrorDecision>,
    },
    Completed(EngineResult<CalculationResult>),
}

/// The caller's foreground context. Every method runs on the foreground.
#[async_trait::async_trait]
pub trait ForegroundUi: Send {
    fn on_busy_changed(&mut self, _busy: bool) {}

    fn on_progress(&mut self, _event: &ProgressEvent) -> ProgressControl {
        ProgressControl::Continue
    }

    /// `None` is "no value": the engine receives an empty string.
    async fn on_undefined_variable(&mut self, _name: &str) -> Option<String> {
        None
    }

    async fn on_error(&mut self, _error: &CalculationError) -> ErrorDecision {
        ErrorDecision::Continue
    }

    fn on_complete(&mut self, _outcome: &EngineResult<CalculationResult>) {}
}

/// Foreground that takes every default: no prompt answers, errors continue.
#[derive(Debug, Default)]
pub struct HeadlessUi;

#[async_trait::async_trait]
impl ForegroundUi for HeadlessUi {}

/// Observer implementation that forwards every engine event to the foreground.
#[derive(Clone)]
pub struct ChannelBridge {
    tx: mpsc::UnboundedSender<ForegroundMessage>,
    abort_requested: Arc<AtomicBool>,
}

impl ChannelBridge {
    pub fn new(tx: mpsc::UnboundedSender<ForegroundMessage>) -> Self {
        Self {
            tx,
            abort_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Build observers for exactly the subscribed event kinds.
    pub fn observers(&self, events: EventSet) -> Observers {
        let mut observers = Observers::none();
        if events.contains(EventKind::Progress) {
            observers = observers.with_progress(Arc::new(self.clone()));
        }
        if events.contains(EventKind::UndefinedVariable) {
            observers = observers.with_undefined_variable(Arc::new(self.clone()));
        }
        if events.contains(EventKind::Error) {
            observers = observers.with_error(Arc::new(self.clone()));
        }
        observers
    }

    /// Flag set from the foreground; the next progress callback returns `Abort`.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.abort_requested.clone()
    }

    pub fn complete(&self, outcome: EngineResult<CalculationResult>) {
        if self.tx.send(ForegroundMessage::Completed(outcome)).is_err() {
            tracing::warn!("foreground gone before completion was delivered");
        }
    }
}

impl ProgressObserver for ChannelBridge {
    fn on_progress(&self, event: ProgressEvent) -> ProgressControl {
        if self.tx.send(ForegroundMessage::Progress(event)).is_err() {
            tracing::debug!("progress dropped: foreground gone");
        }
        if self.abort_requested.load(Ordering::SeqCst) {
            ProgressControl::Abort
        } else {
            ProgressControl::Continue
        }
    }
}

impl UndefinedVariableObserver for ChannelBridge {
    fn on_undefined_variable(&self, name: &str) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        let msg = ForegroundMessage::UndefinedVariable {
            name: name.to_string(),
            reply,
        };
        if self.tx.send(msg).is_err() {
            return None;
        }
        rx.blocking_recv().ok().flatten()
    }
}

impl ErrorObserver for ChannelBridge {
    fn on_error(&self, error: &CalculationError) -> ErrorDecision {
        let (reply, rx) = oneshot::channel();
        let msg = ForegroundMessage::Error {
            error: error.clone(),
            reply,
        };
        if self.tx.send(msg).is_err() {
            return ErrorDecision::Abort;
        }
        // Anything but an explicit answer counts as abort.
        rx.blocking_recv().unwrap_or(ErrorDecision::Abort)
    }
}

/// Drain messages until the calculation completes, applying each to `ui`.
///
/// Returns the completion outcome without invoking `on_complete`; the
/// dispatcher does that once it has decided the final outcome.
pub async fn drain_until_complete<U: ForegroundUi + ?Sized>(
    rx: &mut mpsc::UnboundedReceiver<ForegroundMessage>,
    ui: &mut U,
    abort: &AtomicBool,
) -> EngineResult<CalculationResult> {
    while let Some(msg) = rx.recv().await {
        match msg {
            ForegroundMessage::Progress(event) => {
                if ui.on_progress(&event) == ProgressControl::Abort {
                    abort.store(true, Ordering::SeqCst);
                }
            }
            ForegroundMessage::UndefinedVariable { name, reply } => {
                let value = ui.on_undefined_variable(&name).await;
                if reply.send(value).is_err() {
                    tracing::warn!(name = %name, "calculation stopped waiting for variable value");
                }
            }
            ForegroundMessage::Error { error, reply } => {
                let decision = ui.on_error(&error).await;
                if reply.send(decision).is_err() {
                    tracing::warn!(code = error.code, "calculation stopped waiting for error decision");
                }
            }
            ForegroundMessage::Completed(outcome) => return outcome,
        }
    }
    Err(EngineError::fault(
        "calculation worker exited without reporting completion",
    ))
}
