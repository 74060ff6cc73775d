//! Terminal foreground – progress on stderr, prompts via dialoguer.

use std::collections::HashMap;
use std::io::IsTerminal;

use calc_engine::bridge::ForegroundUi;
use calc_engine::types::{
    CalculationError, CalculationResult, ErrorDecision, ProgressControl, ProgressEvent,
    ProgressKind,
};
use calc_engine::EngineResult;
use dialoguer::{Confirm, Input};

use crate::config::OnErrorPolicy;

/// Parse a `NAME=VALUE` pre-answer for an undefined-variable prompt.
pub fn parse_answer(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {:?}", s))?;
    let name = name.trim();
    if name.is_empty() {
        return Err("variable name must not be empty".into());
    }
    Ok((name.to_string(), value.to_string()))
}

pub struct ConsoleUi {
    answers: HashMap<String, String>,
    on_error: OnErrorPolicy,
    interactive: bool,
    show_progress: bool,
}

impl ConsoleUi {
    pub fn new(answers: Vec<(String, String)>, on_error: OnErrorPolicy) -> Self {
        Self {
            answers: answers.into_iter().collect(),
            on_error,
            interactive: std::io::stdin().is_terminal() && std::io::stderr().is_terminal(),
            show_progress: std::io::stderr().is_terminal(),
        }
    }

    /// Never prompts; unanswered variables get no value.
    pub fn non_interactive(mut self) -> Self {
        self.interactive = false;
        self
    }

    async fn ask_value(&self, name: &str) -> Option<String> {
        let prompt = format!("Value for undefined variable {}", name);
        let value: String = blocking_prompt(move || {
            Input::new()
                .with_prompt(prompt)
                .allow_empty(true)
                .interact_text()
        })
        .await?;
        Some(value).filter(|v| !v.is_empty())
    }

    async fn ask_continue(&self, error: &CalculationError) -> ErrorDecision {
        let prompt = format!(
            "Expression error {} in {}: {}\n  {}\nContinue the calculation?",
            error.code, error.context, error.message, error.expression
        );
        match blocking_prompt(move || Confirm::new().with_prompt(prompt).default(false).interact()).await {
            Some(true) => ErrorDecision::Continue,
            Some(false) | None => ErrorDecision::Abort,
        }
    }
}

/// Run a terminal prompt on the blocking pool so the runtime thread keeps
/// serving the bridge while the user types. Failures are logged and yield
/// `None`.
async fn blocking_prompt<T, E, F>(prompt: F) -> Option<T>
where
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
    F: FnOnce() -> Result<T, E> + Send + 'static,
{
    match tokio::task::spawn_blocking(prompt).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "prompt failed");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "prompt task failed");
            None
        }
    }
}

#[async_trait::async_trait]
impl ForegroundUi for ConsoleUi {
    fn on_busy_changed(&mut self, busy: bool) {
        tracing::debug!(busy, "foreground busy state changed");
    }

    fn on_progress(&mut self, event: &ProgressEvent) -> ProgressControl {
        if self.show_progress {
            match event.kind {
                ProgressKind::SetPosition => eprint!("\r[{:>3}%] {}", event.value, event.text),
                ProgressKind::SetText | ProgressKind::AppendOutput => eprintln!("\r{}", event.text),
                ProgressKind::Finished => eprintln!("\r[done]"),
                ProgressKind::Reset | ProgressKind::Show | ProgressKind::Hide => {}
            }
        }
        tracing::trace!(kind = ?event.kind, value = event.value, "progress");
        ProgressControl::Continue
    }

    async fn on_undefined_variable(&mut self, name: &str) -> Option<String> {
        if let Some(value) = self.answers.get(name) {
            tracing::info!(name, "undefined variable answered from --answer");
            return Some(value.clone());
        }
        if self.interactive {
            return self.ask_value(name).await;
        }
        tracing::warn!(name, "undefined variable left empty; pass --answer NAME=VALUE");
        None
    }

    async fn on_error(&mut self, error: &CalculationError) -> ErrorDecision {
        tracing::warn!(code = error.code, context = %error.context, "{}", error.message);
        if !error.is_expression() {
            return ErrorDecision::Continue;
        }
        match self.on_error {
            OnErrorPolicy::Continue => ErrorDecision::Continue,
            OnErrorPolicy::Abort => ErrorDecision::Abort,
            OnErrorPolicy::Ask if self.interactive => self.ask_continue(error).await,
            OnErrorPolicy::Ask => ErrorDecision::Abort,
        }
    }

    fn on_complete(&mut self, outcome: &EngineResult<CalculationResult>) {
        match outcome {
            Ok(result) => tracing::info!(status = %result.final_status, "calculation complete"),
            Err(e) => tracing::error!(error = %e, "calculation failed"),
        }
    }
}
