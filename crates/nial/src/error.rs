//! The non-local transfer taxonomy.
//!
//! Every transfer that bypasses normal expression flow is an `Err` unwound by
//! `?`: triggered faults, user interrupts, operand-stack overflow, heap
//! exhaustion, workspace save/load requests and a clean `bye`. Parse errors
//! are deliberately *not* here: they are returned to the caller as fault
//! values carrying a message plus token context.
//!
//! The single top-level recovery record is the `match` in
//! [`crate::session::Session::execute`]; catch/throw installs nested recovery
//! by catching `RunError::Fault` at a recorded operand-stack height.

use std::fmt;

use crate::intern::FaultId;

/// Result type alias for operations that can perform a non-local transfer.
pub type RunResult<T> = Result<T, RunError>;

/// A non-local transfer unwinding toward the nearest recovery record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    /// A fault atom was created while triggering is enabled. Unwinds to the
    /// nearest catch record, or to the top level if none is installed.
    Fault(FaultId),
    /// A user interrupt was observed at a `checksignal` point.
    Interrupt,
    /// The operand stack exceeded its configured depth (recoverable warning).
    StackOverflow,
    /// The heap could not grow within its configured cap (recoverable warning).
    HeapExhausted,
    /// Cooperative request to save the workspace to the named file.
    WsSave(String),
    /// Cooperative request to load the workspace from the named file.
    WsLoad(String),
    /// Clean exit requested by the program.
    Bye,
    /// An internal invariant of the core was violated.
    Fatal(String),
}

impl RunError {
    /// True for the recoverable warning exits (overflow, exhaustion, interrupt).
    #[must_use]
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::Interrupt | Self::StackOverflow | Self::HeapExhausted)
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fault(id) => write!(f, "triggered fault #{}", id.index()),
            Self::Interrupt => write!(f, "user interrupt"),
            Self::StackOverflow => write!(f, "operand stack overflow"),
            Self::HeapExhausted => write!(f, "heap exhausted"),
            Self::WsSave(name) => write!(f, "workspace save request: {name}"),
            Self::WsLoad(name) => write!(f, "workspace load request: {name}"),
            Self::Bye => write!(f, "bye"),
            Self::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

impl std::error::Error for RunError {}
