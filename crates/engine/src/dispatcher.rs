//! Execution dispatcher – picks in-caller or background execution.
//!
//! With no event subscriptions a calculation runs directly in the caller's
//! context. With any subscription it runs on a dedicated worker thread so the
//! blocking round-trips cannot deadlock the foreground, and every event plus
//! the final outcome is marshaled back through the bridge channel.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::bridge::{drain_until_complete, ChannelBridge, ForegroundUi};
use crate::events::Observers;
use crate::orchestrator::Orchestrator;
use crate::traits::{EngineError, EngineResult};
use crate::types::{CalcStatus, CalculationRequest, CalculationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    InCaller,
    Background,
}

impl ExecutionMode {
    pub fn for_request(request: &CalculationRequest) -> Self {
        if request.subscribed_events.any() {
            ExecutionMode::Background
        } else {
            ExecutionMode::InCaller
        }
    }
}

/// Foreground "busy" state. True for the whole span of a calculation.
#[derive(Debug, Clone, Default)]
pub struct BusyFlag(Arc<AtomicBool>);

impl BusyFlag {
    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn acquire(&self) -> EngineResult<BusyGuard> {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| EngineError::Busy)?;
        Ok(BusyGuard(self.0.clone()))
    }
}

/// Releases the busy flag on every exit path, unwinding included.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Dispatcher {
    orchestrator: Arc<Orchestrator>,
    busy: BusyFlag,
}

impl Dispatcher {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            busy: BusyFlag::default(),
        }
    }

    pub fn busy_flag(&self) -> BusyFlag {
        self.busy.clone()
    }

    /// Run in the caller's context. Event subscriptions are rejected here:
    /// a blocking round-trip would wait on the very context running it.
    pub fn calculate(&self, request: &CalculationRequest) -> EngineResult<CalculationResult> {
        if request.subscribed_events.any() {
            return Err(EngineError::InvalidRequest(
                "event subscriptions require background execution".into(),
            ));
        }
        let _busy = self.busy.acquire()?;
        run_caught(&self.orchestrator, request, Observers::none())
    }

    /// Run on a worker thread, applying marshaled events to `ui` until the
    /// calculation completes. `ui.on_complete` runs on the foreground.
    pub async fn calculate_async<U: ForegroundUi + ?Sized>(
        &self,
        request: CalculationRequest,
        ui: &mut U,
    ) -> EngineResult<CalculationResult> {
        let busy = self.busy.acquire()?;
        ui.on_busy_changed(true);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let bridge = ChannelBridge::new(tx);
        let abort = bridge.abort_handle();
        let observers = bridge.observers(request.subscribed_events);
        let orchestrator = self.orchestrator.clone();
        let parent = tracing::Span::current();

        let spawned = std::thread::Builder::new()
            .name("calc-worker".into())
            .spawn(move || {
                let _span = parent.enter();
                let outcome = run_caught(&orchestrator, &request, observers);
                bridge.complete(outcome);
            });

        let outcome = match spawned {
            // The worker has released its sessions before posting completion.
            Ok(_worker) => drain_until_complete(&mut rx, ui, &abort)
                .await
                .map(|result| fold_late_abort(result, &abort)),
            Err(e) => Err(EngineError::Io(e)),
        };

        ui.on_complete(&outcome);
        drop(busy);
        ui.on_busy_changed(false);
        outcome
    }

    /// Pick the execution mode from the request's subscriptions and run.
    pub async fn dispatch<U: ForegroundUi + ?Sized>(
        &self,
        request: CalculationRequest,
        ui: &mut U,
    ) -> EngineResult<CalculationResult> {
        match ExecutionMode::for_request(&request) {
            ExecutionMode::Background => self.calculate_async(request, ui).await,
            ExecutionMode::InCaller => {
                let busy = self.busy.acquire()?;
                ui.on_busy_changed(true);
                let outcome = run_caught(&self.orchestrator, &request, Observers::none());
                ui.on_complete(&outcome);
                drop(busy);
                ui.on_busy_changed(false);
                outcome
            }
        }
    }
}

/// Run one calculation, turning a panic anywhere below into an engine fault.
fn run_caught(
    orchestrator: &Orchestrator,
    request: &CalculationRequest,
    observers: Observers,
) -> EngineResult<CalculationResult> {
    std::panic::catch_unwind(AssertUnwindSafe(|| orchestrator.run(request, observers)))
        .unwrap_or_else(|_| {
            tracing::error!("calculation panicked");
            Err(EngineError::fault("calculation panicked"))
        })
}

/// An abort asked for after the engine's last progress callback still
/// holds: the result is downgraded and carries no output.
fn fold_late_abort(mut result: CalculationResult, abort: &AtomicBool) -> CalculationResult {
    if abort.load(Ordering::SeqCst) && result.final_status.is_usable() {
        tracing::info!("abort requested after the last progress event");
        result.final_status = CalcStatus::Aborted;
        result.output_variables = None;
        result.rendered_text = None;
        result.rendered_binary = None;
    }
    result
}
