//! Engine host wire protocol – newline-delimited JSON over a byte stream.
//!
//! ```text
//! → {"id":1,"method":"evaluate","params":{"expression":"EvalItem(\"Lib.ted\",\"Beam\")"}}
//! ← {"event":"undefined_variable","name":"Load"}
//! → {"reply":1,"value":"10 kN"}
//! ← {"id":1,"result":"","status":"ok"}
//! ```
//!
//! Events may interleave before the response to the request that raised
//! them. Each event is answered with exactly one reply, in order.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::Observers;
use crate::traits::{EngineError, EngineResult};
use crate::types::{CalcStatus, CalculationError, ProgressControl, ProgressEvent};

#[derive(Debug, Serialize)]
pub struct HostRequest<'a> {
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
    Progress(ProgressEvent),
    UndefinedVariable { name: String },
    Error(CalculationError),
}

#[derive(Debug, Deserialize)]
pub struct HostFailure {
    pub message: String,
    #[serde(default)]
    pub detail: Option<String>,
    /// Present for engine-reported expression errors.
    #[serde(default)]
    pub code: Option<u32>,
}

impl From<HostFailure> for EngineError {
    fn from(failure: HostFailure) -> Self {
        match (failure.code, failure.detail) {
            (Some(code), _) => EngineError::Expression {
                code,
                message: failure.message,
            },
            (None, Some(detail)) => EngineError::fault_with_detail(failure.message, detail),
            (None, None) => EngineError::fault(failure.message),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HostResponse {
    pub id: u64,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub status: Option<CalcStatus>,
    #[serde(default)]
    pub error: Option<HostFailure>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum HostMessage {
    Event(HostEvent),
    Response(HostResponse),
}

#[derive(Debug, Serialize)]
pub struct HostReply {
    pub reply: u64,
    pub value: Value,
}

/// One connection to an engine or authoring host.
pub struct HostConnection {
    reader: Box<dyn BufRead + Send>,
    writer: Box<dyn Write + Send>,
    child: Option<Child>,
    next_id: u64,
}

impl std::fmt::Debug for HostConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostConnection")
            .field("child", &self.child)
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

impl HostConnection {
    pub fn new(
        reader: impl BufRead + Send + 'static,
        writer: impl Write + Send + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
            next_id: 0,
        }
    }

    /// Start `program` and talk to it over its stdin/stdout.
    pub fn spawn(program: &str, args: &[String]) -> EngineResult<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                EngineError::fault_with_detail(format!("cannot start host {}", program), e.to_string())
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::fault("host stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::fault("host stdout unavailable"))?;
        tracing::debug!(program, pid = child.id(), "host process started");
        let mut conn = Self::new(BufReader::new(stdout), stdin);
        conn.child = Some(child);
        Ok(conn)
    }

    /// Attach to a host already listening on a Unix domain socket.
    #[cfg(unix)]
    pub fn connect(path: &std::path::Path) -> EngineResult<Self> {
        let stream = std::os::unix::net::UnixStream::connect(path).map_err(|e| {
            EngineError::fault_with_detail(
                format!("cannot attach to host at {}", path.display()),
                e.to_string(),
            )
        })?;
        let reader = stream.try_clone()?;
        Ok(Self::new(BufReader::new(reader), stream))
    }

    /// Send one request and wait for its response, answering any events
    /// raised in between through `observers`.
    pub fn call(
        &mut self,
        method: &str,
        params: Value,
        observers: &Observers,
    ) -> EngineResult<HostResponse> {
        self.next_id += 1;
        let id = self.next_id;
        self.send(&HostRequest { id, method, params })?;
        loop {
            match self.receive()? {
                HostMessage::Event(event) => {
                    let value = answer_event(event, observers);
                    self.send(&HostReply { reply: id, value })?;
                }
                HostMessage::Response(response) => {
                    if response.id != id {
                        return Err(EngineError::Protocol(format!(
                            "response id {} does not match request {}",
                            response.id, id
                        )));
                    }
                    if let Some(failure) = response.error {
                        return Err(failure.into());
                    }
                    return Ok(response);
                }
            }
        }
    }

    fn send<T: Serialize>(&mut self, message: &T) -> EngineResult<()> {
        let mut line =
            serde_json::to_string(message).map_err(|e| EngineError::Protocol(e.to_string()))?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .and_then(|_| self.writer.flush())
            .map_err(|e| EngineError::fault_with_detail("host connection lost", e.to_string()))
    }

    fn receive(&mut self) -> EngineResult<HostMessage> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self
                .reader
                .read_line(&mut line)
                .map_err(|e| EngineError::fault_with_detail("host connection lost", e.to_string()))?;
            if read == 0 {
                return Err(EngineError::fault("host closed the connection"));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return serde_json::from_str(trimmed)
                .map_err(|e| EngineError::Protocol(format!("malformed host message: {}", e)));
        }
    }
}

/// How long a host gets to exit on its own once its stdin is closed.
const EXIT_GRACE: Duration = Duration::from_millis(500);

fn wait_for_exit(child: &mut Child, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(10)),
            _ => return false,
        }
    }
}

impl Drop for HostConnection {
    fn drop(&mut self) {
        // Closing stdin is the host's signal to exit.
        self.writer = Box::new(std::io::sink());
        if let Some(mut child) = self.child.take() {
            if !wait_for_exit(&mut child, EXIT_GRACE) {
                tracing::warn!(pid = child.id(), "host did not exit after stdin closed; killing");
                let _ = child.kill();
            }
            let _ = child.wait();
        }
    }
}

fn answer_event(event: HostEvent, observers: &Observers) -> Value {
    match event {
        HostEvent::Progress(progress) => match observers.progress(progress) {
            ProgressControl::Continue => Value::from("continue"),
            ProgressControl::Abort => Value::from("abort"),
        },
        HostEvent::UndefinedVariable { name } => Value::String(observers.undefined_variable(&name)),
        HostEvent::Error(raw) => {
            let error = CalculationError::new(
                raw.kind,
                raw.code,
                raw.context,
                raw.message,
                &raw.expression,
            );
            serde_json::to_value(observers.error(&error)).unwrap_or(Value::Null)
        }
    }
}
