//! Calculation orchestrator – drives the fast and full engine protocols.
//!
//! ```text
//! Idle → Initializing → (Resolving →)? Evaluating → (Rendering)? → Completed | Interrupted | Aborted | Faulted
//! ```
//!
//! Fast path (no rendered output): one session, `EvalItem` then read back the
//! variables. Full path: a first session fetches the item's document text and,
//! when the engine UI is hidden, refines the seed variables; a second session
//! is initialised with both and calculates. Output is read only when the final
//! status is `Ok` or `Interrupted`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::events::Observers;
use crate::expression::{self, UI_OPTION};
use crate::session::SessionScope;
use crate::traits::{EngineError, EngineProvider, EngineResult, EngineSession};
use crate::types::{CalcStatus, CalculationRequest, CalculationResult, OutputFormat};

/// License login applied to every session right after it is opened.
#[derive(Clone, Default)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalcPhase {
    Idle,
    Initializing,
    Resolving,
    Evaluating,
    Rendering,
    Completed,
    Interrupted,
    Aborted,
    Faulted,
}

impl CalcPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            CalcPhase::Idle => "idle",
            CalcPhase::Initializing => "initializing",
            CalcPhase::Resolving => "resolving",
            CalcPhase::Evaluating => "evaluating",
            CalcPhase::Rendering => "rendering",
            CalcPhase::Completed => "completed",
            CalcPhase::Interrupted => "interrupted",
            CalcPhase::Aborted => "aborted",
            CalcPhase::Faulted => "faulted",
        }
    }

    pub fn terminal(status: CalcStatus) -> Self {
        match status {
            CalcStatus::Ok => CalcPhase::Completed,
            CalcStatus::Interrupted => CalcPhase::Interrupted,
            CalcStatus::Aborted => CalcPhase::Aborted,
            CalcStatus::Faulted => CalcPhase::Faulted,
        }
    }
}

struct PhaseTracker {
    phase: CalcPhase,
    started: Instant,
    timings: HashMap<String, u64>,
}

impl PhaseTracker {
    fn new() -> Self {
        Self {
            phase: CalcPhase::Idle,
            started: Instant::now(),
            timings: HashMap::new(),
        }
    }

    fn enter(&mut self, next: CalcPhase) {
        if self.phase != CalcPhase::Idle {
            self.timings.insert(
                self.phase.as_str().to_string(),
                self.started.elapsed().as_millis() as u64,
            );
        }
        tracing::debug!(from = self.phase.as_str(), to = next.as_str(), "phase transition");
        self.phase = next;
        self.started = Instant::now();
    }

    fn finish(mut self, status: CalcStatus) -> HashMap<String, u64> {
        self.enter(CalcPhase::terminal(status));
        self.timings
    }
}

/// Marks the orchestrator busy for the lifetime of one calculation.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn enter(flag: &'a AtomicBool) -> EngineResult<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| EngineError::Busy)?;
        Ok(Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runs one calculation at a time against sessions from its provider.
pub struct Orchestrator {
    provider: Arc<dyn EngineProvider>,
    credentials: Option<Credentials>,
    in_flight: AtomicBool,
}

impl Orchestrator {
    pub fn new(provider: Arc<dyn EngineProvider>) -> Self {
        Self {
            provider,
            credentials: None,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials).filter(|c| !c.is_empty());
        self
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run one calculation. Every session opened is released before this
    /// returns, whichever way it returns.
    pub fn run(
        &self,
        request: &CalculationRequest,
        observers: Observers,
    ) -> EngineResult<CalculationResult> {
        request.validate()?;
        let _flight = InFlight::enter(&self.in_flight)?;

        let span = tracing::info_span!(
            "calculation",
            library = %request.library_ref,
            item = %request.item_ref,
            render = request.produce_rendered_output,
        );
        let _entered = span.enter();

        let mut tracker = PhaseTracker::new();
        let outcome = {
            let mut scope = SessionScope::new(self.provider.as_ref());
            if request.produce_rendered_output {
                self.full_path(&mut scope, request, &observers, &mut tracker)
            } else {
                self.fast_path(&mut scope, request, &observers, &mut tracker)
            }
        };

        match outcome {
            Ok(mut result) => {
                result.timings = tracker.finish(result.final_status);
                tracing::info!(status = %result.final_status, "calculation finished");
                Ok(result)
            }
            Err(e) => {
                tracing::error!(error = %e, "calculation failed");
                Err(e)
            }
        }
    }

    fn fast_path(
        &self,
        scope: &mut SessionScope<'_>,
        request: &CalculationRequest,
        observers: &Observers,
        tracker: &mut PhaseTracker,
    ) -> EngineResult<CalculationResult> {
        let slot = scope.open_observed(observers)?;
        let session = scope.get(slot);
        self.login(session)?;

        tracker.enter(CalcPhase::Initializing);
        session.initialize(None, request.seed_variables())?;
        session.set_option(
            UI_OPTION,
            expression::ui_option_value(request.show_engine_ui),
        )?;

        tracker.enter(CalcPhase::Evaluating);
        session.evaluate(&expression::eval_item(
            &request.library_ref,
            &request.item_ref,
        ))?;

        let status = final_status(session.status(), observers);
        let mut result = CalculationResult::empty(status);
        if status.is_usable() {
            result.output_variables = Some(session.variables()?);
        }
        Ok(result)
    }

    fn full_path(
        &self,
        scope: &mut SessionScope<'_>,
        request: &CalculationRequest,
        observers: &Observers,
        tracker: &mut PhaseTracker,
    ) -> EngineResult<CalculationResult> {
        let first = scope.open()?;
        let (document, seed) = {
            let session = scope.get(first);
            self.login(session)?;

            tracker.enter(CalcPhase::Initializing);
            let seed = if request.show_engine_ui {
                session.initialize(None, None)?;
                request.seed_variables().map(str::to_string)
            } else {
                session.initialize(None, request.seed_variables())?;
                tracker.enter(CalcPhase::Resolving);
                session.set_option(UI_OPTION, expression::ui_option_value(false))?;
                Some(session.variables()?).filter(|v| !v.is_empty())
            };

            let item_text = session.evaluate(&expression::get_item_text(
                &request.library_ref,
                &request.item_ref,
            ))?;
            (expression::decode_text(&item_text), seed)
        };

        let second = scope.open_observed(observers)?;
        let session = scope.get(second);
        self.login(session)?;

        tracker.enter(CalcPhase::Evaluating);
        session.initialize(Some(&document), seed.as_deref())?;

        let status = final_status(session.status(), observers);
        let mut result = CalculationResult::empty(status);
        if status.is_usable() {
            tracker.enter(CalcPhase::Rendering);
            result.output_variables = Some(session.variables()?);
            result.rendered_text = Some(session.output(OutputFormat::Rtf)?.into_text());
            result.rendered_binary = Some(session.output(OutputFormat::Pdf)?.into_bytes());
        }
        Ok(result)
    }

    fn login(&self, session: &mut dyn EngineSession) -> EngineResult<()> {
        match &self.credentials {
            Some(c) => session.login(&c.user, &c.password),
            None => Ok(()),
        }
    }
}

/// An observer's abort decision overrides an optimistic engine status.
fn final_status(engine: CalcStatus, observers: &Observers) -> CalcStatus {
    if observers.aborted() {
        engine.worst(CalcStatus::Aborted)
    } else {
        engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ErrorObserver, UndefinedVariableObserver};
    use crate::testing::{EngineScript, ScriptStep, ScriptedProvider};
    use crate::types::{CalcErrorKind, CalculationError, ErrorDecision};
    use std::sync::Mutex;

    fn orchestrator(script: EngineScript) -> (Orchestrator, Arc<ScriptedProvider>) {
        let provider = Arc::new(ScriptedProvider::new(script));
        (Orchestrator::new(provider.clone()), provider)
    }

    #[test]
    fn test_fast_path_scenario() {
        let (orch, provider) = orchestrator(EngineScript::default());
        let request = CalculationRequest::new("Lib.ted", "Beam;Design").with_input_variables("");
        let result = orch.run(&request, Observers::none()).unwrap();

        assert_eq!(result.final_status, CalcStatus::Ok);
        assert!(result.output_variables.is_some());
        assert!(!result.has_rendered_output());

        let journal = provider.journal();
        assert_eq!(journal.count(r#"evaluate#1 EvalItem("Lib.ted","Beam\;Design")"#), 1);
        assert_eq!(journal.count("initialize#1 doc=- vars=-"), 1);
        assert_eq!(journal.count("set_option#1 _CalcUI=0"), 1);
        assert_eq!(provider.opened(), 1);
        assert_eq!(provider.live_sessions(), 0);
    }

    #[test]
    fn test_fast_path_never_renders_whatever_the_status() {
        for status in [
            CalcStatus::Ok,
            CalcStatus::Interrupted,
            CalcStatus::Aborted,
            CalcStatus::Faulted,
        ] {
            let (orch, provider) = orchestrator(EngineScript::default().with_status(status));
            let result = orch
                .run(&CalculationRequest::new("Lib.ted", "Beam"), Observers::none())
                .unwrap();
            assert_eq!(result.final_status, status);
            assert!(result.rendered_text.is_none());
            assert!(result.rendered_binary.is_none());
            assert_eq!(result.output_variables.is_some(), status.is_usable());
            assert!(!provider.journal().contains_prefix("output#"));
        }
    }

    #[test]
    fn test_full_path_output_follows_status() {
        for status in [
            CalcStatus::Ok,
            CalcStatus::Interrupted,
            CalcStatus::Aborted,
            CalcStatus::Faulted,
        ] {
            let (orch, provider) = orchestrator(EngineScript::default().with_status(status));
            let request = CalculationRequest::new("Lib.ted", "Beam").with_rendered_output(true);
            let result = orch.run(&request, Observers::none()).unwrap();

            let usable = status.is_usable();
            assert_eq!(result.final_status, status);
            assert_eq!(result.output_variables.is_some(), usable);
            assert_eq!(result.rendered_text.is_some(), usable);
            assert_eq!(result.rendered_binary.is_some(), usable);
            assert_eq!(provider.opened(), 2);
            assert_eq!(provider.live_sessions(), 0);
        }
    }

    #[test]
    fn test_full_path_refines_seed_when_ui_hidden() {
        let script = EngineScript::default().with_refined_variables("<refined/>");
        let (orch, provider) = orchestrator(script);
        let request = CalculationRequest::new("Lib.ted", "Beam")
            .with_input_variables("<seed/>")
            .with_rendered_output(true);
        let result = orch.run(&request, Observers::none()).unwrap();
        assert_eq!(result.rendered_text.as_deref(), Some(r"{\rtf1 output}"));
        assert_eq!(result.rendered_binary.as_deref(), Some(&b"%PDF-1.7 scripted"[..]));

        let entries = provider.journal().entries();
        assert!(entries.contains(&"initialize#1 doc=- vars=<seed/>".to_string()));
        assert!(entries.contains(&"set_option#1 _CalcUI=0".to_string()));
        assert!(entries.contains(&"variables#1".to_string()));
        assert!(entries.contains(&r#"evaluate#1 GetCalcItemText("Lib.ted","Beam")"#.to_string()));
        // Document text is decoded before it seeds the second session.
        assert!(entries
            .contains(&r#"initialize#2 doc={\rtf1 Beam "design"; check} vars=<refined/>"#.to_string()));
    }

    #[test]
    fn test_full_path_passes_seed_through_when_ui_shown() {
        let script = EngineScript::default().with_refined_variables("<refined/>");
        let (orch, provider) = orchestrator(script);
        let request = CalculationRequest::new("Lib.ted", "Beam")
            .with_input_variables("<seed/>")
            .with_engine_ui(true)
            .with_rendered_output(true);
        orch.run(&request, Observers::none()).unwrap();

        let journal = provider.journal();
        assert_eq!(journal.count("initialize#1 doc=- vars=-"), 1);
        assert_eq!(journal.count("variables#1"), 0);
        assert!(journal.contains_prefix("initialize#2 doc="));
        assert!(journal
            .entries()
            .iter()
            .any(|e| e.starts_with("initialize#2") && e.ends_with("vars=<seed/>")));
    }

    #[test]
    fn test_fault_releases_both_sessions() {
        let (orch, provider) = orchestrator(EngineScript::default().failing_on("output"));
        let request = CalculationRequest::new("Lib.ted", "Beam").with_rendered_output(true);
        let err = orch.run(&request, Observers::none()).unwrap_err();
        assert!(matches!(err, EngineError::Fault { .. }));
        assert_eq!(provider.live_sessions(), 0);
        assert_eq!(provider.journal().count("close#1"), 1);
        assert_eq!(provider.journal().count("close#2"), 1);
        assert!(!orch.is_in_flight());
    }

    #[test]
    fn test_second_open_failure_releases_first_session() {
        let provider = Arc::new(ScriptedProvider::new(EngineScript::default()).fail_open_at(2));
        let orch = Orchestrator::new(provider.clone());
        let request = CalculationRequest::new("Lib.ted", "Beam").with_rendered_output(true);
        assert!(orch.run(&request, Observers::none()).is_err());
        assert_eq!(provider.live_sessions(), 0);
    }

    struct AbortOnExpression;

    impl ErrorObserver for AbortOnExpression {
        fn on_error(&self, _error: &CalculationError) -> ErrorDecision {
            ErrorDecision::Abort
        }
    }

    #[test]
    fn test_expression_abort_yields_no_variables() {
        let script = EngineScript::default().with_steps(vec![ScriptStep::Error(
            CalculationError::new(CalcErrorKind::Expression, 3, "Beam", "bad", "x/0"),
        )]);
        for render in [false, true] {
            let (orch, provider) = orchestrator(script.clone());
            let observers = Observers::none().with_error(Arc::new(AbortOnExpression));
            let request = CalculationRequest::new("Lib.ted", "Beam").with_rendered_output(render);
            let result = orch.run(&request, observers).unwrap();

            assert_eq!(result.final_status, CalcStatus::Aborted);
            assert!(result.output_variables.is_none());
            assert!(!result.has_rendered_output());
            let calc_session = if render { 2 } else { 1 };
            assert_eq!(provider.journal().count(&format!("variables#{}", calc_session)), 0);
        }
    }

    #[test]
    fn test_login_applied_to_every_session() {
        let provider = Arc::new(ScriptedProvider::new(EngineScript::default()));
        let orch = Orchestrator::new(provider.clone()).with_credentials(Credentials::new("eng", "pw"));
        let request = CalculationRequest::new("Lib.ted", "Beam").with_rendered_output(true);
        orch.run(&request, Observers::none()).unwrap();
        assert_eq!(provider.journal().count("login#1 eng"), 1);
        assert_eq!(provider.journal().count("login#2 eng"), 1);
        assert!(!format!("{:?}", Credentials::new("eng", "pw")).contains("pw\""));
    }

    #[test]
    fn test_empty_credentials_skip_login() {
        let provider = Arc::new(ScriptedProvider::new(EngineScript::default()));
        let orch = Orchestrator::new(provider.clone()).with_credentials(Credentials::default());
        orch.run(&CalculationRequest::new("Lib.ted", "Beam"), Observers::none())
            .unwrap();
        assert!(!provider.journal().contains_prefix("login"));
    }

    #[test]
    fn test_invalid_request_opens_nothing() {
        let (orch, provider) = orchestrator(EngineScript::default());
        let err = orch
            .run(&CalculationRequest::new("Lib.ted", ""), Observers::none())
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
        assert_eq!(provider.opened(), 0);
    }

    struct Reentrant {
        orch: Mutex<Option<Arc<Orchestrator>>>,
        nested: Mutex<Option<bool>>,
    }

    impl UndefinedVariableObserver for Reentrant {
        fn on_undefined_variable(&self, _name: &str) -> Option<String> {
            let orch = self.orch.lock().unwrap().take()?;
            let nested = orch.run(&CalculationRequest::new("Lib.ted", "Other"), Observers::none());
            *self.nested.lock().unwrap() = Some(matches!(nested, Err(EngineError::Busy)));
            Some("1".into())
        }
    }

    #[test]
    fn test_not_reentrant() {
        let script = EngineScript::default().with_steps(vec![ScriptStep::Prompt("Load".into())]);
        let provider = Arc::new(ScriptedProvider::new(script));
        let orch = Arc::new(Orchestrator::new(provider));
        let observer = Arc::new(Reentrant {
            orch: Mutex::new(Some(orch.clone())),
            nested: Mutex::new(None),
        });
        let result = orch
            .run(
                &CalculationRequest::new("Lib.ted", "Beam"),
                Observers::none().with_undefined_variable(observer.clone()),
            )
            .unwrap();
        assert_eq!(result.final_status, CalcStatus::Ok);
        assert_eq!(*observer.nested.lock().unwrap(), Some(true));
        assert!(!orch.is_in_flight());
    }

    #[test]
    fn test_phase_timings_recorded() {
        let (orch, _provider) = orchestrator(EngineScript::default());
        let request = CalculationRequest::new("Lib.ted", "Beam").with_rendered_output(true);
        let result = orch.run(&request, Observers::none()).unwrap();
        for phase in ["initializing", "resolving", "evaluating", "rendering"] {
            assert!(result.timings.contains_key(phase), "missing {}", phase);
        }
    }
}
