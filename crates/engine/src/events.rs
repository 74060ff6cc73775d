//! Engine-fired notifications and the observers a session fans them out to.
//!
//! Each capability is attached independently and is a no-op when absent, so
//! engine implementations call [`Observers`] unconditionally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::types::{CalculationError, ErrorDecision, EventSet, ProgressControl, ProgressEvent};

pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, event: ProgressEvent) -> ProgressControl;
}

/// Blocking round-trip: `None` means "no value".
pub trait UndefinedVariableObserver: Send + Sync {
    fn on_undefined_variable(&self, name: &str) -> Option<String>;
}

/// Blocking round-trip deciding whether an engine error aborts the calculation.
pub trait ErrorObserver: Send + Sync {
    fn on_error(&self, error: &CalculationError) -> ErrorDecision;
}

/// Latched once any observer decides to abort.
#[derive(Debug, Clone, Default)]
pub struct AbortLatch(Arc<AtomicBool>);

impl AbortLatch {
    pub fn trip(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_tripped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Default)]
pub struct Observers {
    progress: Option<Arc<dyn ProgressObserver>>,
    undefined_variable: Option<Arc<dyn UndefinedVariableObserver>>,
    error: Option<Arc<dyn ErrorObserver>>,
    abort: AbortLatch,
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("progress", &self.progress.is_some())
            .field("undefined_variable", &self.undefined_variable.is_some())
            .field("error", &self.error.is_some())
            .field("aborted", &self.abort.is_tripped())
            .finish()
    }
}

impl Observers {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_progress(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.progress = Some(observer);
        self
    }

    pub fn with_undefined_variable(mut self, observer: Arc<dyn UndefinedVariableObserver>) -> Self {
        self.undefined_variable = Some(observer);
        self
    }

    pub fn with_error(mut self, observer: Arc<dyn ErrorObserver>) -> Self {
        self.error = Some(observer);
        self
    }

    /// Which event kinds currently have an observer.
    pub fn subscribed(&self) -> EventSet {
        EventSet {
            progress: self.progress.is_some(),
            undefined_variable: self.undefined_variable.is_some(),
            error: self.error.is_some(),
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.subscribed().any()
    }

    pub fn progress(&self, event: ProgressEvent) -> ProgressControl {
        let control = match &self.progress {
            Some(observer) => observer.on_progress(event),
            None => ProgressControl::Continue,
        };
        if control == ProgressControl::Abort {
            self.abort.trip();
        }
        control
    }

    /// Value to hand to the engine; "no value" becomes the empty string.
    pub fn undefined_variable(&self, name: &str) -> String {
        self.undefined_variable
            .as_ref()
            .and_then(|observer| observer.on_undefined_variable(name))
            .unwrap_or_default()
    }

    /// Non-expression errors always continue. For expression errors the
    /// observer's decision governs; without one the calculation continues.
    pub fn error(&self, error: &CalculationError) -> ErrorDecision {
        let Some(observer) = &self.error else {
            return ErrorDecision::Continue;
        };
        let decision = observer.on_error(error);
        if !error.is_expression() {
            return ErrorDecision::Continue;
        }
        if decision == ErrorDecision::Abort {
            self.abort.trip();
        }
        decision
    }

    /// True once an observer decided to abort.
    pub fn aborted(&self) -> bool {
        self.abort.is_tripped()
    }
}
