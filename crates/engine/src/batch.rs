//! Batch runner – execute a sequence of calculations from a YAML file.
//!
//! ```yaml
//! name: beam checks
//! steps:
//!   - library: "$(SysLbrDir)\\Steel.lib"
//!     item: "Beam;Design"
//!     input: inputs/beam.xml
//!   - library: "$(SysLbrDir)\\Steel.lib"
//!     item: "Connection"
//!     chain: true
//!     render: true
//!     expect_status: interrupted
//! ```

use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::bridge::ForegroundUi;
use crate::context::ClientContext;
use crate::dispatcher::Dispatcher;
use crate::traits::{EngineError, EngineResult};
use crate::types::*;

#[derive(Debug, Clone, Deserialize)]
pub struct Batch {
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<BatchStep>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchStep {
    #[serde(default)]
    pub name: Option<String>,
    pub library: String,
    pub item: String,
    /// Seed variables file.
    #[serde(default)]
    pub input: Option<PathBuf>,
    /// Seed with the previous step's output variables.
    #[serde(default)]
    pub chain: bool,
    #[serde(default)]
    pub show_ui: bool,
    #[serde(default)]
    pub render: bool,
    #[serde(default)]
    pub expect_status: CalcStatus,
}

impl BatchStep {
    fn label(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}#{}", self.item, index + 1))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub index: usize,
    pub name: String,
    pub status: Status,
    pub expected: CalcStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calc_status: Option<CalcStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub timing_ms: TimingInfo,
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub name: Option<String>,
    pub overall_status: Status,
    pub steps: Vec<StepOutcome>,
}

/// Parse a batch from YAML.
pub fn load_batch(yaml: &str) -> EngineResult<Batch> {
    let batch: Batch = serde_yaml::from_str(yaml)
        .map_err(|e| EngineError::InvalidRequest(format!("failed to parse batch YAML: {}", e)))?;
    if batch.steps.is_empty() {
        return Err(EngineError::InvalidRequest("batch has no steps".into()));
    }
    if let Some(first) = batch.steps.first().filter(|s| s.chain) {
        return Err(EngineError::InvalidRequest(format!(
            "first step {} cannot chain: there is no previous output",
            first.label(0)
        )));
    }
    Ok(batch)
}

/// Run every step in order through `dispatcher`. Relative input paths are
/// resolved against `base_dir`; artifacts go to `artifacts_dir` when given.
pub async fn run_batch<U: ForegroundUi + ?Sized>(
    batch: &Batch,
    ctx: &ClientContext,
    dispatcher: &Dispatcher,
    events: EventSet,
    ui: &mut U,
    base_dir: &Path,
    artifacts_dir: Option<&Path>,
) -> BatchReport {
    let materializer = ctx.materializer();
    let mut previous: Option<String> = None;
    let mut overall = Status::Pass;
    let mut steps = Vec::with_capacity(batch.steps.len());

    for (index, step) in batch.steps.iter().enumerate() {
        let start = Instant::now();
        let name = step.label(index);
        let mut outcome = StepOutcome {
            index,
            name: name.clone(),
            status: Status::Pass,
            expected: step.expect_status,
            calc_status: None,
            error: None,
            timing_ms: TimingInfo::default(),
            artifacts: vec![],
        };

        let seed = match seed_for(step, previous.take(), ctx, base_dir) {
            Ok(seed) => seed,
            Err(e) => {
                tracing::warn!(step = %name, error = %e, "batch step could not be prepared");
                outcome.status = Status::Error;
                outcome.error = Some(ErrorInfo::from(&e));
                overall = Status::Fail;
                steps.push(outcome);
                continue;
            }
        };

        let mut request = CalculationRequest::new(&step.library, &step.item)
            .with_engine_ui(step.show_ui)
            .with_rendered_output(step.render)
            .with_events(events);
        if let Some(xml) = seed {
            request = request.with_input_variables(xml);
        }

        match dispatcher.dispatch(request, ui).await {
            Ok(result) => {
                outcome.calc_status = Some(result.final_status);
                outcome.timing_ms.steps = result.timings.clone();
                if result.final_status != step.expect_status {
                    tracing::warn!(
                        step = %name,
                        expected = %step.expect_status,
                        actual = %result.final_status,
                        "batch step status mismatch"
                    );
                    outcome.status = Status::Fail;
                    overall = Status::Fail;
                }
                if let Some(dir) = artifacts_dir {
                    let stem = format!("step-{:02}", index + 1);
                    match materializer.save_result(dir, &stem, &result) {
                        Ok(paths) => {
                            outcome.artifacts =
                                paths.iter().map(|p| p.display().to_string()).collect()
                        }
                        Err(e) => {
                            tracing::warn!(step = %name, error = %e, "saving step artifacts failed")
                        }
                    }
                }
                previous = result.output_variables;
            }
            Err(e) => {
                tracing::warn!(step = %name, error = %e, "batch step failed");
                outcome.status = Status::Error;
                outcome.error = Some(ErrorInfo::from(&e));
                overall = Status::Fail;
            }
        }

        outcome.timing_ms.total = start.elapsed().as_millis() as u64;
        steps.push(outcome);
    }

    BatchReport {
        name: batch.name.clone(),
        overall_status: overall,
        steps,
    }
}

fn seed_for(
    step: &BatchStep,
    previous: Option<String>,
    ctx: &ClientContext,
    base_dir: &Path,
) -> EngineResult<Option<String>> {
    if step.chain {
        return previous.map(Some).ok_or_else(|| {
            EngineError::InvalidRequest("previous step produced no variables to chain".into())
        });
    }
    match &step.input {
        Some(path) => {
            let path = base_dir.join(path);
            let bytes = ctx.fs().read_file(&path)?;
            Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::HeadlessUi;
    use crate::testing::{EngineScript, MemoryFilesystem, ScriptedProvider};
    use crate::traits::FilesystemOps;
    use std::sync::Arc;

    fn context(script: EngineScript) -> (ClientContext, Arc<ScriptedProvider>, Arc<MemoryFilesystem>) {
        let provider = Arc::new(ScriptedProvider::new(script));
        let fs = Arc::new(MemoryFilesystem::new());
        (ClientContext::new(provider.clone(), fs.clone()), provider, fs)
    }

    #[test]
    fn test_parse_batch() {
        let yaml = r#"
name: beam checks
steps:
  - library: "Lib.ted"
    item: "Beam;Design"
    input: beam.xml
  - library: "Lib.ted"
    item: "Connection"
    chain: true
    render: true
    expect_status: interrupted
"#;
        let batch = load_batch(yaml).unwrap();
        assert_eq!(batch.name.as_deref(), Some("beam checks"));
        assert_eq!(batch.steps.len(), 2);
        assert_eq!(batch.steps[0].expect_status, CalcStatus::Ok);
        assert_eq!(batch.steps[1].expect_status, CalcStatus::Interrupted);
        assert!(batch.steps[1].chain && batch.steps[1].render);
    }

    #[test]
    fn test_parse_rejects_empty_and_leading_chain() {
        assert!(load_batch("steps: []").is_err());
        let yaml = "steps:\n  - library: Lib.ted\n    item: Beam\n    chain: true\n";
        assert!(matches!(load_batch(yaml), Err(EngineError::InvalidRequest(_))));
        assert!(load_batch("steps: [").is_err());
    }

    #[tokio::test]
    async fn test_chain_feeds_previous_output() {
        let (ctx, provider, fs) = context(EngineScript::default());
        fs.write_file(Path::new("/work/beam.xml"), b"<seed/>").unwrap();
        let batch = load_batch(
            "steps:\n  - library: Lib.ted\n    item: Beam\n    input: beam.xml\n  - library: Lib.ted\n    item: Column\n    chain: true\n",
        )
        .unwrap();

        let dispatcher = ctx.dispatcher();
        let report = run_batch(
            &batch,
            &ctx,
            &dispatcher,
            EventSet::none(),
            &mut HeadlessUi,
            Path::new("/work"),
            Some(Path::new("/work/out")),
        )
        .await;

        assert_eq!(report.overall_status, Status::Pass);
        let journal = provider.journal();
        assert_eq!(journal.count("initialize#1 doc=- vars=<seed/>"), 1);
        assert_eq!(
            journal.count("initialize#2 doc=- vars=<variables><var name=\"M\">12 kNm</var></variables>"),
            1
        );
        assert_eq!(report.steps[1].artifacts, vec!["/work/out/step-02.xml".to_string()]);
        assert!(fs.exists(Path::new("/work/out/step-01.xml")));
    }

    #[tokio::test]
    async fn test_status_mismatch_fails_batch() {
        let (ctx, _, _) = context(EngineScript::default().with_status(CalcStatus::Interrupted));
        let batch = load_batch(
            "steps:\n  - library: Lib.ted\n    item: Beam\n  - library: Lib.ted\n    item: Beam\n    expect_status: interrupted\n",
        )
        .unwrap();
        let dispatcher = ctx.dispatcher();
        let report = run_batch(
            &batch,
            &ctx,
            &dispatcher,
            EventSet::none(),
            &mut HeadlessUi,
            Path::new("."),
            None,
        )
        .await;
        assert_eq!(report.overall_status, Status::Fail);
        assert_eq!(report.steps[0].status, Status::Fail);
        assert_eq!(report.steps[1].status, Status::Pass);
    }

    #[tokio::test]
    async fn test_missing_input_is_step_error_and_breaks_chain() {
        let (ctx, provider, _) = context(EngineScript::default());
        let batch = load_batch(
            "steps:\n  - library: Lib.ted\n    item: Beam\n    input: missing.xml\n  - library: Lib.ted\n    item: Column\n    chain: true\n  - library: Lib.ted\n    item: Slab\n",
        )
        .unwrap();
        let dispatcher = ctx.dispatcher();
        let report = run_batch(
            &batch,
            &ctx,
            &dispatcher,
            EventSet::none(),
            &mut HeadlessUi,
            Path::new("/work"),
            None,
        )
        .await;

        assert_eq!(report.overall_status, Status::Fail);
        assert_eq!(report.steps[0].error.as_ref().unwrap().code, ErrorCode::IoError);
        assert_eq!(report.steps[1].error.as_ref().unwrap().code, ErrorCode::InvalidInput);
        assert_eq!(report.steps[2].status, Status::Pass);
        assert_eq!(provider.opened(), 1);
    }

    #[tokio::test]
    async fn test_engine_fault_recorded_per_step() {
        let (ctx, provider, _) = context(EngineScript::default().failing_on("evaluate"));
        let batch = load_batch("steps:\n  - library: Lib.ted\n    item: Beam\n").unwrap();
        let dispatcher = ctx.dispatcher();
        let report = run_batch(
            &batch,
            &ctx,
            &dispatcher,
            EventSet::all(),
            &mut HeadlessUi,
            Path::new("."),
            None,
        )
        .await;
        assert_eq!(report.steps[0].status, Status::Error);
        assert_eq!(report.steps[0].error.as_ref().unwrap().code, ErrorCode::EngineFault);
        assert_eq!(provider.live_sessions(), 0);
        assert!(!dispatcher.busy_flag().is_busy());
    }
}
