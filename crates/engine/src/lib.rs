//! Calculation engine client – shared orchestration logic for every caller.
//!
//! This crate drives an external calculation engine behind traits: session
//! lifecycles, the fast and full calculation protocols, event round-trips to
//! the foreground and the choice between in-caller and background execution.
//! It has no terminal or UI dependencies, so the CLI and tests share it.

pub mod batch;
pub mod bridge;
pub mod context;
pub mod dispatcher;
pub mod events;
pub mod expression;
pub mod materializer;
pub mod orchestrator;
pub mod platform;
pub mod session;
pub mod testing;
pub mod traits;
pub mod types;
pub mod wire;

// Re-exports for convenience
pub use bridge::{ForegroundUi, HeadlessUi};
pub use context::ClientContext;
pub use dispatcher::{BusyFlag, Dispatcher, ExecutionMode};
pub use orchestrator::{Credentials, Orchestrator};
pub use traits::{EngineError, EngineResult};
pub use types::{
    CalcStatus, CalculationRequest, CalculationResult, ErrorCode, ErrorInfo, EventSet, RunReport,
    Status,
};
