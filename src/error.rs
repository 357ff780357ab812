//! Error taxonomy for the addon host.

use std::path::PathBuf;

use crate::compiler::Diagnostics;
use crate::lifecycle::ScriptState;

/// Result alias for host operations.
pub type HostResult<T> = Result<T, HostError>;

/// Errors from addon host operations.
///
/// Every failed lifecycle transition surfaces one of these and leaves the
/// script in a well-defined [`ScriptState`] with its diagnostics retained.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The addon descriptor is missing or malformed. Fatal to the script
    /// instance: a script constructed from a bad descriptor refuses all
    /// further operations.
    #[error("bad addon descriptor {path}: {message}")]
    Config {
        /// Path to the descriptor file.
        path: PathBuf,
        /// What went wrong reading or parsing it.
        message: String,
    },

    /// Compilation produced errors. Recoverable: the script returns to
    /// `Unloaded` and may be recompiled after the sources change.
    #[error("compilation failed with {} error(s)", .0.errors.len())]
    Compile(Diagnostics),

    /// The compiler did not finish within the configured timeout.
    #[error("compilation timed out")]
    CompileTimeout,

    /// The security audit denied loading the compiled module. Recoverable
    /// only by compiling a different module.
    #[error("security audit denied load: {}", .0.join("; "))]
    AuditDenied(Vec<String>),

    /// The execution context rejected the compiled payload (malformed
    /// payload or unresolved dependencies). Treated like a compile failure.
    #[error("module load failed: {0}")]
    Load(String),

    /// An execution context with this name is already live in the process.
    /// A programming-contract violation, never swallowed.
    #[error("execution context name already in use: {0}")]
    DuplicateContext(String),

    /// A `LoadedModule` handle was used after its context was torn down.
    #[error("module handle is stale (context torn down)")]
    StaleHandle,

    /// The operation is not valid in the script's current state.
    #[error("cannot {op} while {state:?}")]
    BadState {
        /// The operation that was attempted.
        op: &'static str,
        /// The state the script was in.
        state: ScriptState,
    },

    /// The filesystem watcher could not be started.
    #[error("source watcher failed: {0}")]
    Watch(String),
}
