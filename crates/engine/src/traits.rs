use std::path::Path;

use crate::events::Observers;
use crate::types::{CalcStatus, ErrorCode, OutputFormat, RenderedOutput};

/// Result type for every engine-facing operation.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Engine unreachable or internally faulted. Fatal to the current calculation.
    #[error("engine fault: {message}")]
    Fault {
        message: String,
        detail: Option<String>,
    },

    #[error("expression error {code}: {message}")]
    Expression { code: u32, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("a calculation is already in flight")]
    Busy,

    #[error("engine host protocol error: {0}")]
    Protocol(String),
}

impl EngineError {
    pub fn fault(message: impl Into<String>) -> Self {
        EngineError::Fault {
            message: message.into(),
            detail: None,
        }
    }

    pub fn fault_with_detail(message: impl Into<String>, detail: impl Into<String>) -> Self {
        EngineError::Fault {
            message: message.into(),
            detail: Some(detail.into()),
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            EngineError::Fault { .. } | EngineError::Protocol(_) => ErrorCode::EngineFault,
            EngineError::Expression { .. } => ErrorCode::ExpressionError,
            EngineError::Io(_) => ErrorCode::IoError,
            EngineError::InvalidRequest(_) => ErrorCode::InvalidInput,
            EngineError::Busy => ErrorCode::Busy,
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            EngineError::Fault { detail, .. } => detail.as_deref(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Calculation engine
// ---------------------------------------------------------------------------

/// Starts or attaches to an engine instance. Resolved once at startup.
pub trait EngineProvider: Send + Sync {
    /// Never fails silently: failure to attach is an [`EngineError::Fault`].
    fn open(&self) -> EngineResult<Box<dyn EngineSession>>;
}

/// One live handle to the calculation engine.
///
/// Higher-level operations (evaluate a calc item, fetch its document text)
/// are expressions submitted through [`EngineSession::evaluate`].
pub trait EngineSession: Send {
    fn login(&mut self, user: &str, password: &str) -> EngineResult<()>;

    /// Either argument may be absent, meaning engine defaults.
    fn initialize(
        &mut self,
        seed_document: Option<&str>,
        seed_variables: Option<&str>,
    ) -> EngineResult<()>;

    fn set_option(&mut self, name: &str, value: &str) -> EngineResult<()>;

    fn evaluate(&mut self, expression: &str) -> EngineResult<String>;

    fn variables(&mut self) -> EngineResult<String>;

    fn output(&mut self, format: OutputFormat) -> EngineResult<RenderedOutput>;

    fn status(&self) -> CalcStatus;

    /// Attach event observers. Replaces any previous attachment.
    fn attach(&mut self, observers: Observers);

    /// Drop every attached observer.
    fn detach(&mut self);

    /// Release the handle. Idempotent.
    fn close(&mut self) -> EngineResult<()>;
}

// ---------------------------------------------------------------------------
// Document authoring service
// ---------------------------------------------------------------------------

/// Opaque reference to a document held by an [`AuthoringApp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentHandle(pub u64);

/// The four inputs a distributable document is assembled from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSpec {
    pub name: String,
    pub library_ref: String,
    pub item_ref: String,
    pub variables_xml: String,
    pub rendered_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    /// The authoring service's own document format.
    Native,
    Pdf,
}

pub trait AuthoringService: Send + Sync {
    fn open(&self) -> EngineResult<Box<dyn AuthoringApp>>;
}

pub trait AuthoringApp: Send {
    fn is_visible(&self) -> bool;
    fn add_document(&mut self, spec: &DocumentSpec) -> EngineResult<DocumentHandle>;
    fn save_as(
        &mut self,
        document: DocumentHandle,
        path: &Path,
        format: DocumentFormat,
    ) -> EngineResult<()>;
    fn close_document(&mut self, document: DocumentHandle) -> EngineResult<()>;
    /// Release the service handle. Idempotent.
    fn release(&mut self) -> EngineResult<()>;
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

pub trait FilesystemOps: Send + Sync {
    fn read_file(&self, path: &Path) -> EngineResult<Vec<u8>>;
    fn write_file(&self, path: &Path, data: &[u8]) -> EngineResult<()>;
    fn exists(&self, path: &Path) -> bool;
}
