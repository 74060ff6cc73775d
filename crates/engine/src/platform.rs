//! Real implementations of the collaborator traits.
//!
//! - [`StdFilesystem`]: std::fs operations
//! - [`ProcessEngineProvider`]: engine sessions hosted by an external process
//! - [`ProcessAuthoringService`]: document authoring host over the same wire

use std::path::{Path, PathBuf};

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::events::Observers;
use crate::traits::*;
use crate::types::{CalcStatus, OutputFormat, RenderedOutput};
use crate::wire::{HostConnection, HostResponse};

// ===========================================================================
// Filesystem – wraps std::fs
// ===========================================================================

pub struct StdFilesystem;

impl FilesystemOps for StdFilesystem {
    fn read_file(&self, path: &Path) -> EngineResult<Vec<u8>> {
        std::fs::read(path).map_err(EngineError::Io)
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> EngineResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, data).map_err(EngineError::Io)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

// ===========================================================================
// Host endpoints
// ===========================================================================

/// Where a host process lives: started per session, or already listening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostEndpoint {
    Spawn {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Socket {
        path: PathBuf,
    },
}

impl HostEndpoint {
    pub fn connect(&self) -> EngineResult<HostConnection> {
        match self {
            HostEndpoint::Spawn { program, args } => HostConnection::spawn(program, args),
            #[cfg(unix)]
            HostEndpoint::Socket { path } => HostConnection::connect(path),
            #[cfg(not(unix))]
            HostEndpoint::Socket { path } => Err(EngineError::fault(format!(
                "socket endpoints are not supported on this platform: {}",
                path.display()
            ))),
        }
    }
}

fn string_result(response: HostResponse, method: &str) -> EngineResult<String> {
    match response.result {
        Value::String(s) => Ok(s),
        Value::Null => Ok(String::new()),
        other => Err(EngineError::Protocol(format!(
            "{} returned {} where text was expected",
            method, other
        ))),
    }
}

// ===========================================================================
// Engine – one host connection per session
// ===========================================================================

pub struct ProcessEngineProvider {
    endpoint: HostEndpoint,
}

impl ProcessEngineProvider {
    pub fn new(endpoint: HostEndpoint) -> Self {
        Self { endpoint }
    }
}

impl EngineProvider for ProcessEngineProvider {
    fn open(&self) -> EngineResult<Box<dyn EngineSession>> {
        let mut conn = self.endpoint.connect()?;
        conn.call("open", Value::Null, &Observers::none())?;
        Ok(Box::new(ProcessSession::from_connection(conn)))
    }
}

pub struct ProcessSession {
    conn: HostConnection,
    observers: Observers,
    status: CalcStatus,
    closed: bool,
}

impl ProcessSession {
    pub fn from_connection(conn: HostConnection) -> Self {
        Self {
            conn,
            observers: Observers::none(),
            status: CalcStatus::Ok,
            closed: false,
        }
    }

    fn call(&mut self, method: &str, params: Value) -> EngineResult<HostResponse> {
        if self.closed {
            return Err(EngineError::fault(format!("{} on a closed session", method)));
        }
        let response = self.conn.call(method, params, &self.observers)?;
        if let Some(status) = response.status {
            self.status = status;
        }
        Ok(response)
    }
}

impl EngineSession for ProcessSession {
    fn login(&mut self, user: &str, password: &str) -> EngineResult<()> {
        self.call("login", json!({ "user": user, "password": password }))?;
        Ok(())
    }

    fn initialize(
        &mut self,
        seed_document: Option<&str>,
        seed_variables: Option<&str>,
    ) -> EngineResult<()> {
        self.call(
            "initialize",
            json!({ "document": seed_document, "variables": seed_variables }),
        )?;
        Ok(())
    }

    fn set_option(&mut self, name: &str, value: &str) -> EngineResult<()> {
        self.call("set_option", json!({ "name": name, "value": value }))?;
        Ok(())
    }

    fn evaluate(&mut self, expression: &str) -> EngineResult<String> {
        let response = self.call("evaluate", json!({ "expression": expression }))?;
        string_result(response, "evaluate")
    }

    fn variables(&mut self) -> EngineResult<String> {
        let response = self.call("variables", Value::Null)?;
        string_result(response, "variables")
    }

    fn output(&mut self, format: OutputFormat) -> EngineResult<RenderedOutput> {
        let response = self.call("output", json!({ "format": format }))?;
        let text = string_result(response, "output")?;
        match format {
            OutputFormat::Rtf => Ok(RenderedOutput::Text(text)),
            OutputFormat::Pdf => base64::engine::general_purpose::STANDARD
                .decode(text.as_bytes())
                .map(RenderedOutput::Binary)
                .map_err(|e| EngineError::Protocol(format!("PDF output is not base64: {}", e))),
        }
    }

    fn status(&self) -> CalcStatus {
        self.status
    }

    fn attach(&mut self, observers: Observers) {
        self.observers = observers;
    }

    fn detach(&mut self) {
        self.observers = Observers::none();
    }

    fn close(&mut self) -> EngineResult<()> {
        if self.closed {
            return Ok(());
        }
        let outcome = self.call("close", Value::Null).map(|_| ());
        self.closed = true;
        outcome
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

// ===========================================================================
// Authoring – document assembly host
// ===========================================================================

pub struct ProcessAuthoringService {
    endpoint: HostEndpoint,
    visible: bool,
}

impl ProcessAuthoringService {
    pub fn new(endpoint: HostEndpoint, visible: bool) -> Self {
        Self { endpoint, visible }
    }
}

impl AuthoringService for ProcessAuthoringService {
    fn open(&self) -> EngineResult<Box<dyn AuthoringApp>> {
        let mut conn = self.endpoint.connect()?;
        conn.call("open", json!({ "visible": self.visible }), &Observers::none())?;
        Ok(Box::new(ProcessAuthoringApp::from_connection(conn, self.visible)))
    }
}

pub struct ProcessAuthoringApp {
    conn: HostConnection,
    visible: bool,
    released: bool,
}

impl ProcessAuthoringApp {
    pub fn from_connection(conn: HostConnection, visible: bool) -> Self {
        Self {
            conn,
            visible,
            released: false,
        }
    }

    fn call(&mut self, method: &str, params: Value) -> EngineResult<HostResponse> {
        self.conn.call(method, params, &Observers::none())
    }
}

impl AuthoringApp for ProcessAuthoringApp {
    fn is_visible(&self) -> bool {
        self.visible
    }

    fn add_document(&mut self, spec: &DocumentSpec) -> EngineResult<DocumentHandle> {
        let response = self.call(
            "documents.add",
            json!({
                "name": spec.name,
                "library": spec.library_ref,
                "item": spec.item_ref,
                "variables": spec.variables_xml,
                "rendered_text": spec.rendered_text,
            }),
        )?;
        response
            .result
            .get("document")
            .and_then(Value::as_u64)
            .map(DocumentHandle)
            .ok_or_else(|| EngineError::Protocol("documents.add returned no document id".into()))
    }

    fn save_as(
        &mut self,
        document: DocumentHandle,
        path: &Path,
        format: DocumentFormat,
    ) -> EngineResult<()> {
        let method = match format {
            DocumentFormat::Native => "document.save_as",
            DocumentFormat::Pdf => "document.save_as_pdf",
        };
        let path = path.to_str().ok_or_else(|| {
            EngineError::InvalidRequest(format!(
                "document path is not valid UTF-8: {}",
                path.display()
            ))
        })?;
        self.call(method, json!({ "document": document.0, "path": path }))?;
        Ok(())
    }

    fn close_document(&mut self, document: DocumentHandle) -> EngineResult<()> {
        self.call("document.close", json!({ "document": document.0 }))?;
        Ok(())
    }

    fn release(&mut self) -> EngineResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.call("release", Value::Null).map(|_| ())
    }
}

impl Drop for ProcessAuthoringApp {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Sent(Arc<Mutex<Vec<u8>>>);

    impl Write for Sent {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Sent {
        fn methods(&self) -> Vec<String> {
            String::from_utf8(self.0.lock().unwrap().clone())
                .unwrap()
                .lines()
                .filter_map(|l| {
                    let v: Value = serde_json::from_str(l).ok()?;
                    v.get("method").and_then(Value::as_str).map(String::from)
                })
                .collect()
        }
    }

    fn host(lines: &[&str]) -> (HostConnection, Sent) {
        let mut out = lines.join("\n");
        out.push('\n');
        let sent = Sent::default();
        (HostConnection::new(Cursor::new(out.into_bytes()), sent.clone()), sent)
    }

    #[test]
    fn test_std_filesystem_creates_parent_dirs() {
        let dir = std::env::temp_dir().join(format!("calc-engine-test-{}", std::process::id()));
        let path = dir.join("nested").join("vars.xml");
        let fs = StdFilesystem;
        fs.write_file(&path, b"<variables/>").unwrap();
        assert!(fs.exists(&path));
        assert_eq!(fs.read_file(&path).unwrap(), b"<variables/>");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_session_tracks_status_and_decodes_pdf() {
        let (conn, sent) = host(&[
            r#"{"id":1,"status":"ok"}"#,
            r#"{"id":2,"result":"","status":"interrupted"}"#,
            r#"{"id":3,"result":"JVBERg=="}"#,
            r#"{"id":4}"#,
        ]);
        let mut session = ProcessSession::from_connection(conn);
        session.initialize(None, Some("<seed/>")).unwrap();
        session.evaluate("EvalItem(\"Lib.ted\",\"Beam\")").unwrap();
        assert_eq!(session.status(), CalcStatus::Interrupted);
        assert_eq!(
            session.output(OutputFormat::Pdf).unwrap(),
            RenderedOutput::Binary(b"%PDF".to_vec())
        );
        session.close().unwrap();
        session.close().unwrap();
        assert_eq!(sent.methods(), vec!["initialize", "evaluate", "output", "close"]);
    }

    #[test]
    fn test_session_rejects_non_text_result() {
        let (conn, _) = host(&[r#"{"id":1,"result":{"unexpected":true}}"#, r#"{"id":2}"#]);
        let mut session = ProcessSession::from_connection(conn);
        assert!(matches!(session.variables(), Err(EngineError::Protocol(_))));
    }

    #[test]
    fn test_authoring_app_methods() {
        let (conn, sent) = host(&[
            r#"{"id":1,"result":{"document":7}}"#,
            r#"{"id":2}"#,
            r#"{"id":3}"#,
            r#"{"id":4}"#,
        ]);
        let mut app = ProcessAuthoringApp::from_connection(conn, false);
        let spec = DocumentSpec {
            name: "Beam".into(),
            library_ref: "Lib.ted".into(),
            item_ref: "Beam".into(),
            variables_xml: "<variables/>".into(),
            rendered_text: String::new(),
        };
        let doc = app.add_document(&spec).unwrap();
        assert_eq!(doc, DocumentHandle(7));
        app.save_as(doc, Path::new("/out/beam.pdf"), DocumentFormat::Pdf)
            .unwrap();
        app.close_document(doc).unwrap();
        drop(app);
        assert_eq!(
            sent.methods(),
            vec!["documents.add", "document.save_as_pdf", "document.close", "release"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_save_as_rejects_non_utf8_path() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let (conn, sent) = host(&[r#"{"id":1}"#]);
        let mut app = ProcessAuthoringApp::from_connection(conn, false);
        let path = Path::new(OsStr::from_bytes(b"/tmp/out\xff.ted"));
        let err = app
            .save_as(DocumentHandle(1), path, DocumentFormat::Native)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
        assert!(sent.methods().is_empty());
    }

    #[test]
    fn test_endpoint_config_shape() {
        let spawn: HostEndpoint =
            serde_yaml::from_str("spawn:\n  program: calc-host\n  args: [\"--quiet\"]\n").unwrap();
        assert_eq!(
            spawn,
            HostEndpoint::Spawn {
                program: "calc-host".into(),
                args: vec!["--quiet".into()]
            }
        );
        let socket: HostEndpoint = serde_yaml::from_str("socket:\n  path: /run/calc.sock\n").unwrap();
        assert_eq!(
            socket,
            HostEndpoint::Socket {
                path: PathBuf::from("/run/calc.sock")
            }
        );
    }
}
