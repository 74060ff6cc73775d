use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::traits::EngineError;

/// Longest expression excerpt carried by a [`CalculationError`].
pub const MAX_EXPRESSION_LEN: usize = 1024;

// ---------------------------------------------------------------------------
// Calculation request / result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalculationRequest {
    /// Seed variables in the engine's XML interchange format. `None` means engine defaults.
    #[serde(default)]
    pub input_variables: Option<String>,
    pub library_ref: String,
    /// Raw item name. Delimiters are escaped when the expression is built.
    pub item_ref: String,
    #[serde(default)]
    pub show_engine_ui: bool,
    #[serde(default)]
    pub produce_rendered_output: bool,
    #[serde(default)]
    pub subscribed_events: EventSet,
}

impl CalculationRequest {
    pub fn new(library_ref: impl Into<String>, item_ref: impl Into<String>) -> Self {
        Self {
            library_ref: library_ref.into(),
            item_ref: item_ref.into(),
            ..Self::default()
        }
    }

    pub fn with_input_variables(mut self, xml: impl Into<String>) -> Self {
        self.input_variables = Some(xml.into());
        self
    }

    pub fn with_engine_ui(mut self, show: bool) -> Self {
        self.show_engine_ui = show;
        self
    }

    pub fn with_rendered_output(mut self, render: bool) -> Self {
        self.produce_rendered_output = render;
        self
    }

    pub fn with_events(mut self, events: EventSet) -> Self {
        self.subscribed_events = events;
        self
    }

    /// Library and item references must both be non-empty before submission.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.library_ref.trim().is_empty() {
            return Err(EngineError::InvalidRequest(
                "library reference must not be empty".into(),
            ));
        }
        if self.item_ref.trim().is_empty() {
            return Err(EngineError::InvalidRequest(
                "item reference must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Seed variables with the empty string treated as absent.
    pub fn seed_variables(&self) -> Option<&str> {
        self.input_variables.as_deref().filter(|s| !s.is_empty())
    }
}

/// Outcome of one orchestrated calculation. Absent fields were not requested
/// (or not produced because the final status forbids output), never "failed".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalculationResult {
    pub output_variables: Option<String>,
    pub rendered_text: Option<String>,
    pub rendered_binary: Option<Vec<u8>>,
    pub final_status: CalcStatus,
    /// Elapsed milliseconds per phase.
    pub timings: HashMap<String, u64>,
}

impl CalculationResult {
    pub fn empty(final_status: CalcStatus) -> Self {
        Self {
            output_variables: None,
            rendered_text: None,
            rendered_binary: None,
            final_status,
            timings: HashMap::new(),
        }
    }

    pub fn has_rendered_output(&self) -> bool {
        self.rendered_text.is_some() || self.rendered_binary.is_some()
    }
}

/// Engine-reported status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalcStatus {
    #[default]
    Ok,
    Interrupted,
    Aborted,
    Faulted,
}

impl CalcStatus {
    /// `Ok` and `Interrupted` results carry output; `Aborted` and `Faulted` never do.
    pub fn is_usable(self) -> bool {
        matches!(self, CalcStatus::Ok | CalcStatus::Interrupted)
    }

    /// The more severe of two statuses.
    pub fn worst(self, other: CalcStatus) -> CalcStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    fn severity(self) -> u8 {
        match self {
            CalcStatus::Ok => 0,
            CalcStatus::Interrupted => 1,
            CalcStatus::Aborted => 2,
            CalcStatus::Faulted => 3,
        }
    }
}

impl fmt::Display for CalcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CalcStatus::Ok => "ok",
            CalcStatus::Interrupted => "interrupted",
            CalcStatus::Aborted => "aborted",
            CalcStatus::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

impl FromStr for CalcStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ok" => Ok(CalcStatus::Ok),
            "interrupted" => Ok(CalcStatus::Interrupted),
            "aborted" => Ok(CalcStatus::Aborted),
            "faulted" => Ok(CalcStatus::Faulted),
            other => Err(format!("unknown calculation status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Rtf,
    Pdf,
}

/// Rendered document as returned by a session: RTF is text, PDF is bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderedOutput {
    Text(String),
    Binary(Vec<u8>),
}

impl RenderedOutput {
    pub fn into_text(self) -> String {
        match self {
            RenderedOutput::Text(t) => t,
            RenderedOutput::Binary(b) => String::from_utf8_lossy(&b).into_owned(),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            RenderedOutput::Text(t) => t.into_bytes(),
            RenderedOutput::Binary(b) => b,
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Progress,
    UndefinedVariable,
    Error,
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "progress" => Ok(EventKind::Progress),
            "undefined-variable" => Ok(EventKind::UndefinedVariable),
            "error" => Ok(EventKind::Error),
            other => Err(format!(
                "unknown event kind: {} (available: progress, undefined-variable, error)",
                other
            )),
        }
    }
}

/// Per-event-kind subscription flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSet {
    #[serde(default)]
    pub progress: bool,
    #[serde(default)]
    pub undefined_variable: bool,
    #[serde(default)]
    pub error: bool,
}

impl EventSet {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            progress: true,
            undefined_variable: true,
            error: true,
        }
    }

    pub fn from_kinds<I: IntoIterator<Item = EventKind>>(kinds: I) -> Self {
        let mut set = Self::none();
        for kind in kinds {
            set.insert(kind);
        }
        set
    }

    pub fn insert(&mut self, kind: EventKind) {
        match kind {
            EventKind::Progress => self.progress = true,
            EventKind::UndefinedVariable => self.undefined_variable = true,
            EventKind::Error => self.error = true,
        }
    }

    pub fn contains(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Progress => self.progress,
            EventKind::UndefinedVariable => self.undefined_variable,
            EventKind::Error => self.error,
        }
    }

    pub fn any(&self) -> bool {
        self.progress || self.undefined_variable || self.error
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    Reset,
    SetPosition,
    SetText,
    AppendOutput,
    Show,
    Hide,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    #[serde(default)]
    pub value: u32,
    #[serde(default)]
    pub text: String,
}

impl ProgressEvent {
    pub fn new(kind: ProgressKind, value: u32, text: impl Into<String>) -> Self {
        Self {
            kind,
            value,
            text: text.into(),
        }
    }
}

/// What a progress handler asks of the engine after a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressControl {
    #[default]
    Continue,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalcErrorKind {
    Expression,
    Other,
}

/// Engine-reported evaluation problem delivered through the error round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalculationError {
    pub kind: CalcErrorKind,
    pub code: u32,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub expression: String,
}

impl CalculationError {
    pub fn new(
        kind: CalcErrorKind,
        code: u32,
        context: impl Into<String>,
        message: impl Into<String>,
        expression: &str,
    ) -> Self {
        Self {
            kind,
            code,
            context: context.into(),
            message: message.into(),
            expression: truncate_chars(expression, MAX_EXPRESSION_LEN),
        }
    }

    pub fn is_expression(&self) -> bool {
        self.kind == CalcErrorKind::Expression
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorDecision {
    Continue,
    Abort,
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

// ---------------------------------------------------------------------------
// Run report – the stable output contract of every caller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub command: String,
    pub target: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calc_status: Option<CalcStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub timing_ms: TimingInfo,
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Command-specific payload returned on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pass,
    Fail,
    Error,
}

impl From<CalcStatus> for Status {
    fn from(status: CalcStatus) -> Self {
        match status {
            CalcStatus::Ok | CalcStatus::Interrupted => Status::Pass,
            CalcStatus::Aborted => Status::Fail,
            CalcStatus::Faulted => Status::Error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl From<&EngineError> for ErrorInfo {
    fn from(err: &EngineError) -> Self {
        ErrorInfo {
            code: err.error_code(),
            message: err.to_string(),
            details: err
                .detail()
                .map(|d| serde_json::Value::String(d.to_string()))
                .unwrap_or(serde_json::Value::Null),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidInput,
    EngineFault,
    ExpressionError,
    UserAborted,
    IoError,
    Busy,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| format!("{:?}", self));
        f.write_str(&s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TimingInfo {
    pub total: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub steps: HashMap<String, u64>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Generate a new run ID (UUIDv4).
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Build the report for a finished calculation.
pub fn report_calculation(
    command: &str,
    target: &str,
    run_id: &str,
    total_ms: u64,
    result: &CalculationResult,
) -> RunReport {
    let error = match result.final_status {
        CalcStatus::Aborted => Some(ErrorInfo {
            code: ErrorCode::UserAborted,
            message: "calculation aborted; no output produced".into(),
            details: serde_json::Value::Null,
        }),
        CalcStatus::Faulted => Some(ErrorInfo {
            code: ErrorCode::EngineFault,
            message: "engine reported a fault; no output produced".into(),
            details: serde_json::Value::Null,
        }),
        CalcStatus::Ok | CalcStatus::Interrupted => None,
    };
    RunReport {
        run_id: run_id.to_string(),
        command: command.to_string(),
        target: target.to_string(),
        status: result.final_status.into(),
        calc_status: Some(result.final_status),
        error,
        timing_ms: TimingInfo {
            total: total_ms,
            steps: result.timings.clone(),
        },
        artifacts: vec![],
        data: Some(serde_json::json!({
            "output_variables": result.output_variables.is_some(),
            "rendered_text": result.rendered_text.is_some(),
            "rendered_binary_bytes": result.rendered_binary.as_ref().map(|b| b.len()),
        })),
    }
}

/// Build a successful report shell (caller fills in data).
pub fn report_ok(command: &str, target: &str, run_id: &str, total_ms: u64) -> RunReport {
    RunReport {
        run_id: run_id.to_string(),
        command: command.to_string(),
        target: target.to_string(),
        status: Status::Pass,
        calc_status: None,
        error: None,
        timing_ms: TimingInfo {
            total: total_ms,
            steps: HashMap::new(),
        },
        artifacts: vec![],
        data: None,
    }
}

/// Build an error report from an [`EngineError`].
pub fn report_err(
    command: &str,
    target: &str,
    run_id: &str,
    total_ms: u64,
    err: &EngineError,
) -> RunReport {
    RunReport {
        run_id: run_id.to_string(),
        command: command.to_string(),
        target: target.to_string(),
        status: Status::Error,
        calc_status: None,
        error: Some(err.into()),
        timing_ms: TimingInfo {
            total: total_ms,
            steps: HashMap::new(),
        },
        artifacts: vec![],
        data: None,
    }
}
