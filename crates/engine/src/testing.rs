//! In-memory collaborators for exercising orchestration without an engine host.
//!
//! [`ScriptedProvider`] hands out sessions that replay an [`EngineScript`]
//! and write every call into a shared [`Journal`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::events::{Observers, ProgressObserver};
use crate::expression::EVAL_ITEM;
use crate::traits::*;
use crate::types::*;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Ordered log of calls made against scripted collaborators.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        lock(&self.0).push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.0).clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        lock(&self.0).iter().filter(|e| *e == entry).count()
    }

    pub fn contains_prefix(&self, prefix: &str) -> bool {
        lock(&self.0).iter().any(|e| e.starts_with(prefix))
    }
}

// ===========================================================================
// Scripted engine
// ===========================================================================

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Progress(ProgressEvent),
    Prompt(String),
    Error(CalculationError),
}

/// What the scripted engine does when asked to calculate.
#[derive(Debug, Clone)]
pub struct EngineScript {
    pub steps: Vec<ScriptStep>,
    pub final_status: CalcStatus,
    /// Encoded document text returned for `GetCalcItemText`.
    pub item_text: String,
    /// Variables reported by a session that has not calculated. Defaults to the seed.
    pub refined_variables: Option<String>,
    pub output_variables: String,
    pub rtf: String,
    pub pdf: Vec<u8>,
    /// Method name that fails with an engine fault.
    pub fail_on: Option<&'static str>,
}

impl Default for EngineScript {
    fn default() -> Self {
        Self {
            steps: Vec::new(),
            final_status: CalcStatus::Ok,
            item_text: r#"{\rtf1 Beam \"design\"\; check}"#.to_string(),
            refined_variables: None,
            output_variables: "<variables><var name=\"M\">12 kNm</var></variables>".to_string(),
            rtf: r"{\rtf1 output}".to_string(),
            pdf: b"%PDF-1.7 scripted".to_vec(),
            fail_on: None,
        }
    }
}

impl EngineScript {
    pub fn with_steps(mut self, steps: Vec<ScriptStep>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_status(mut self, status: CalcStatus) -> Self {
        self.final_status = status;
        self
    }

    pub fn with_refined_variables(mut self, xml: impl Into<String>) -> Self {
        self.refined_variables = Some(xml.into());
        self
    }

    pub fn failing_on(mut self, method: &'static str) -> Self {
        self.fail_on = Some(method);
        self
    }
}

pub struct ScriptedProvider {
    script: EngineScript,
    journal: Journal,
    opened: AtomicUsize,
    live: Arc<AtomicUsize>,
    fail_open_at: Option<usize>,
}

impl ScriptedProvider {
    pub fn new(script: EngineScript) -> Self {
        Self {
            script,
            journal: Journal::default(),
            opened: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            fail_open_at: None,
        }
    }

    /// Make the n-th `open` (1-based) fail.
    pub fn fail_open_at(mut self, n: usize) -> Self {
        self.fail_open_at = Some(n);
        self
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    /// Sessions opened and not yet closed.
    pub fn live_sessions(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl EngineProvider for ScriptedProvider {
    fn open(&self) -> EngineResult<Box<dyn EngineSession>> {
        let id = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_open_at == Some(id) {
            self.journal.record(format!("open-failed#{}", id));
            return Err(EngineError::fault_with_detail(
                "cannot attach to engine",
                format!("scripted failure on open #{}", id),
            ));
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        self.journal.record(format!("open#{}", id));
        Ok(Box::new(ScriptedSession {
            id,
            script: self.script.clone(),
            journal: self.journal.clone(),
            live: self.live.clone(),
            observers: Observers::none(),
            seed_variables: None,
            status: CalcStatus::Ok,
            calculated: false,
            closed: false,
        }))
    }
}

pub struct ScriptedSession {
    id: usize,
    script: EngineScript,
    journal: Journal,
    live: Arc<AtomicUsize>,
    observers: Observers,
    seed_variables: Option<String>,
    status: CalcStatus,
    calculated: bool,
    closed: bool,
}

impl ScriptedSession {
    fn check(&self, method: &'static str) -> EngineResult<()> {
        if self.closed {
            return Err(EngineError::fault(format!("{} on a closed session", method)));
        }
        if self.script.fail_on == Some(method) {
            return Err(EngineError::fault_with_detail(
                format!("engine faulted during {}", method),
                format!("session #{}", self.id),
            ));
        }
        Ok(())
    }

    fn run_calculation(&mut self) {
        self.calculated = true;
        let mut status = self.script.final_status;
        for step in self.script.steps.clone() {
            match step {
                ScriptStep::Progress(event) => {
                    if self.observers.progress(event) == ProgressControl::Abort {
                        status = CalcStatus::Aborted;
                        break;
                    }
                }
                ScriptStep::Prompt(name) => {
                    let value = self.observers.undefined_variable(&name);
                    self.journal
                        .record(format!("answer#{} {}={}", self.id, name, value));
                }
                ScriptStep::Error(error) => {
                    let decision = self.observers.error(&error);
                    self.journal
                        .record(format!("decision#{} {:?}", self.id, decision));
                    if decision == ErrorDecision::Abort {
                        status = CalcStatus::Aborted;
                        break;
                    }
                }
            }
        }
        self.status = status;
    }
}

impl EngineSession for ScriptedSession {
    fn login(&mut self, user: &str, _password: &str) -> EngineResult<()> {
        self.check("login")?;
        self.journal.record(format!("login#{} {}", self.id, user));
        Ok(())
    }

    fn initialize(
        &mut self,
        seed_document: Option<&str>,
        seed_variables: Option<&str>,
    ) -> EngineResult<()> {
        self.check("initialize")?;
        self.journal.record(format!(
            "initialize#{} doc={} vars={}",
            self.id,
            seed_document.unwrap_or("-"),
            seed_variables.unwrap_or("-")
        ));
        self.seed_variables = seed_variables.map(str::to_string);
        if seed_document.is_some() {
            self.run_calculation();
        }
        Ok(())
    }

    fn set_option(&mut self, name: &str, value: &str) -> EngineResult<()> {
        self.check("set_option")?;
        self.journal
            .record(format!("set_option#{} {}={}", self.id, name, value));
        Ok(())
    }

    fn evaluate(&mut self, expression: &str) -> EngineResult<String> {
        self.check("evaluate")?;
        self.journal
            .record(format!("evaluate#{} {}", self.id, expression));
        if expression.starts_with(EVAL_ITEM) {
            self.run_calculation();
            return Ok(String::new());
        }
        Ok(self.script.item_text.clone())
    }

    fn variables(&mut self) -> EngineResult<String> {
        self.check("variables")?;
        self.journal.record(format!("variables#{}", self.id));
        if self.calculated {
            return Ok(self.script.output_variables.clone());
        }
        Ok(self
            .script
            .refined_variables
            .clone()
            .or_else(|| self.seed_variables.clone())
            .unwrap_or_else(|| "<variables/>".to_string()))
    }

    fn output(&mut self, format: OutputFormat) -> EngineResult<RenderedOutput> {
        self.check("output")?;
        self.journal
            .record(format!("output#{} {:?}", self.id, format));
        Ok(match format {
            OutputFormat::Rtf => RenderedOutput::Text(self.script.rtf.clone()),
            OutputFormat::Pdf => RenderedOutput::Binary(self.script.pdf.clone()),
        })
    }

    fn status(&self) -> CalcStatus {
        self.status
    }

    fn attach(&mut self, observers: Observers) {
        self.journal.record(format!("attach#{}", self.id));
        self.observers = observers;
    }

    fn detach(&mut self) {
        self.journal.record(format!("detach#{}", self.id));
        self.observers = Observers::none();
    }

    fn close(&mut self) -> EngineResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.journal.record(format!("close#{}", self.id));
        Ok(())
    }
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Progress observer that keeps every event it sees.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<ProgressEvent> {
        lock(&self.events).clone()
    }
}

impl ProgressObserver for RecordingObserver {
    fn on_progress(&self, event: ProgressEvent) -> ProgressControl {
        lock(&self.events).push(event);
        ProgressControl::Continue
    }
}

// ===========================================================================
// Authoring service
// ===========================================================================

#[derive(Default)]
pub struct RecordingAuthoring {
    journal: Journal,
    visible: bool,
    fail_on: Option<&'static str>,
    live: Arc<AtomicUsize>,
}

impl RecordingAuthoring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visible(mut self, visible: bool) -> Self {
        self.visible = visible;
        self
    }

    pub fn failing_on(mut self, method: &'static str) -> Self {
        self.fail_on = Some(method);
        self
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    pub fn live_handles(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl AuthoringService for RecordingAuthoring {
    fn open(&self) -> EngineResult<Box<dyn AuthoringApp>> {
        if self.fail_on == Some("open") {
            return Err(EngineError::fault("authoring service unavailable"));
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        self.journal.record("authoring.open");
        Ok(Box::new(RecordingApp {
            journal: self.journal.clone(),
            visible: self.visible,
            fail_on: self.fail_on,
            live: self.live.clone(),
            next_document: 0,
            released: false,
        }))
    }
}

struct RecordingApp {
    journal: Journal,
    visible: bool,
    fail_on: Option<&'static str>,
    live: Arc<AtomicUsize>,
    next_document: u64,
    released: bool,
}

impl RecordingApp {
    fn check(&self, method: &'static str) -> EngineResult<()> {
        if self.fail_on == Some(method) {
            return Err(EngineError::fault(format!("authoring {} failed", method)));
        }
        Ok(())
    }
}

impl AuthoringApp for RecordingApp {
    fn is_visible(&self) -> bool {
        self.visible
    }

    fn add_document(&mut self, spec: &DocumentSpec) -> EngineResult<DocumentHandle> {
        self.check("add_document")?;
        self.next_document += 1;
        self.journal.record(format!(
            "authoring.add {} {} {}",
            spec.name, spec.library_ref, spec.item_ref
        ));
        Ok(DocumentHandle(self.next_document))
    }

    fn save_as(
        &mut self,
        document: DocumentHandle,
        path: &Path,
        format: DocumentFormat,
    ) -> EngineResult<()> {
        self.check("save_as")?;
        self.journal.record(format!(
            "authoring.save#{} {:?} {}",
            document.0,
            format,
            path.display()
        ));
        Ok(())
    }

    fn close_document(&mut self, document: DocumentHandle) -> EngineResult<()> {
        self.journal
            .record(format!("authoring.close#{}", document.0));
        Ok(())
    }

    fn release(&mut self) -> EngineResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.journal.record("authoring.release");
        Ok(())
    }
}

impl Drop for RecordingApp {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

// ===========================================================================
// Filesystem
// ===========================================================================

#[derive(Default)]
pub struct MemoryFilesystem {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    read_only: bool,
}

impl MemoryFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_only() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            read_only: true,
        }
    }

    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        lock(&self.files).get(path).cloned()
    }
}

impl FilesystemOps for MemoryFilesystem {
    fn read_file(&self, path: &Path) -> EngineResult<Vec<u8>> {
        self.contents(path).ok_or_else(|| {
            EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            ))
        })
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> EngineResult<()> {
        if self.read_only {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("cannot write {}", path.display()),
            )));
        }
        lock(&self.files).insert(path.to_path_buf(), data.to_vec());
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        lock(&self.files).contains_key(path)
    }
}
