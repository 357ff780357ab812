//! Host runtime for compiling, sandboxing, and hot-reloading addon scripts.
//!
//! This crate turns a directory of addon source text into an executable
//! module, loads it into an isolated execution context, discovers the
//! module's tagged event handlers, and keeps the addon live-reloadable as
//! its source directory changes on disk.
//!
//! The compiler front-end and the concrete execution mechanism are external
//! collaborators: hosts plug them in via the [`CompilerService`] and
//! [`ModuleRuntime`] traits. This crate owns the lifecycle state machine,
//! the security audit that gates every load, the event-handler registry,
//! and the concurrency discipline around hot reload.

pub mod audit;
pub mod compiler;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod lifecycle;
pub mod registry;
pub mod watcher;

// Re-export commonly used types for host applications
pub use audit::{AuditOutcome, PermissionLevel, SecurityGate};
pub use compiler::{CompileUnit, CompiledModule, CompilerService, Diagnostic, Diagnostics};
pub use config::HostConfig;
pub use context::{
    ContextHub, EventArgs, EventValue, ExecutionContext, HandlerFault, HandlerTarget,
    LoadedModule, ModuleInstance, ModuleRuntime,
};
pub use descriptor::Descriptor;
pub use error::{HostError, HostResult};
pub use lifecycle::{Script, ScriptState, ScriptSupervisor};
pub use registry::{DispatchHandlerError, EventRegistry, HandlerResult};
pub use watcher::{ReloadRequest, SourceWatcher};
