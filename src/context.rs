//! Isolated execution contexts.
//!
//! A context is the sandbox boundary a compiled module runs inside: code in
//! one addon cannot reach the host's internals or another addon's loaded
//! code, and tearing the context down releases every resource and severs
//! every outstanding [`LoadedModule`] handle.
//!
//! The concrete execution mechanism (a WASM interpreter, a subprocess, a
//! dynamically loaded code unit) lives behind the [`ModuleRuntime`] trait;
//! this module only enforces the lifecycle contract around it, in
//! particular that teardown is a barrier: it blocks new invocations and
//! drains in-flight ones before resources go away.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::RwLock;
use tracing::debug;

use crate::compiler::{CompiledModule, ModuleManifest};
use crate::error::HostError;

/// A callable reference into a loaded module: one method of one type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerTarget {
    /// Fully qualified type name.
    pub type_name: String,
    /// Method name within the type.
    pub method_name: String,
}

impl std::fmt::Display for HandlerTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.type_name, self.method_name)
    }
}

/// Opaque argument payload passed through to handlers untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventArgs(pub Vec<u8>);

impl EventArgs {
    /// No arguments.
    pub fn none() -> Self {
        Self::default()
    }
}

/// Opaque value returned by a handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventValue(pub Vec<u8>);

/// A single handler's failure, reported by the execution mechanism.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerFault(pub String);

/// The pluggable execution mechanism behind a context.
pub trait ModuleRuntime: Send + Sync + 'static {
    /// Validate a compiled payload, resolve its declared dependencies, and
    /// make it executable.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Load`] if the payload is malformed or a
    /// dependency is unresolved.
    fn instantiate(&self, module: &CompiledModule) -> Result<Box<dyn ModuleInstance>, HostError>;
}

/// Executable form of a module inside its context.
pub trait ModuleInstance: Send + Sync {
    /// Invoke one method. A failure here is isolated to the handler; it
    /// must not poison the instance.
    fn invoke(&self, target: &HandlerTarget, args: &EventArgs) -> Result<EventValue, HandlerFault>;
}

/// Why an invocation through a [`LoadedModule`] handle did not produce a
/// value.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// The owning context was torn down; the handle is severed.
    #[error("module handle is stale (context torn down)")]
    Stale,
    /// The handler itself failed. The module stays usable.
    #[error(transparent)]
    Fault(#[from] HandlerFault),
}

// The loaded module's core. Handles hold this weakly: teardown drops the
// context's strong reference, which severs every handle by construction.
struct ModuleCore {
    instance: Box<dyn ModuleInstance>,
    manifest: ModuleManifest,
    // Teardown barrier. Invocations hold the read side for their full
    // duration; teardown's write acquisition drains them and flips the
    // flag so late upgraders fail cleanly.
    torn_down: RwLock<bool>,
}

/// Process-wide registry of live context names.
///
/// Context names must be unique among concurrently live contexts; creating
/// a duplicate fails. Clones share the same registry.
#[derive(Clone, Default)]
pub struct ContextHub {
    live: Arc<Mutex<HashSet<String>>>,
}

impl ContextHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context with a process-unique name.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::DuplicateContext`] if a live context already
    /// uses the name.
    pub fn create_context(
        &self,
        name: impl Into<String>,
        runtime: Arc<dyn ModuleRuntime>,
    ) -> Result<ExecutionContext, HostError> {
        let name = name.into();
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        if !live.insert(name.clone()) {
            return Err(HostError::DuplicateContext(name));
        }
        drop(live);

        debug!(target: "addon_host", context = %name, "Created execution context");
        Ok(ExecutionContext {
            name,
            hub: self.clone(),
            runtime,
            core: None,
        })
    }

    /// Number of currently live contexts.
    pub fn active_contexts(&self) -> usize {
        self.live.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn release(&self, name: &str) {
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }
}

/// One isolated execution context, holding at most one loaded module.
pub struct ExecutionContext {
    name: String,
    hub: ContextHub,
    runtime: Arc<dyn ModuleRuntime>,
    core: Option<Arc<ModuleCore>>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ExecutionContext {
    /// The context's process-unique name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Make a compiled module executable inside this context.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Load`] if the context already holds a module,
    /// the payload is malformed, or its dependencies are unresolved.
    pub fn load(&mut self, module: &CompiledModule) -> Result<LoadedModule, HostError> {
        if self.core.is_some() {
            return Err(HostError::Load(format!(
                "context '{}' already holds a module",
                self.name
            )));
        }
        if !module.is_success() {
            return Err(HostError::Load(
                "refusing to load a module with compile errors".to_string(),
            ));
        }

        let instance = self.runtime.instantiate(module)?;
        let core = Arc::new(ModuleCore {
            instance,
            manifest: module.manifest.clone(),
            torn_down: RwLock::new(false),
        });
        let handle = LoadedModule {
            context_name: self.name.clone(),
            core: Arc::downgrade(&core),
        };
        self.core = Some(core);

        debug!(target: "addon_host", context = %self.name, "Module loaded");
        Ok(handle)
    }

    /// Tear the context down, releasing the module and its resources.
    ///
    /// This is a barrier, not fire-and-forget: it blocks new invocations,
    /// waits for in-flight invocations to drain, and only then severs the
    /// outstanding [`LoadedModule`] handles. Safe to call with calls still
    /// in flight. The context name becomes available again once the
    /// context is dropped.
    pub async fn teardown(mut self) {
        if let Some(core) = self.core.take() {
            let mut torn_down = core.torn_down.write().await;
            *torn_down = true;
            drop(torn_down);
            // Dropping the only strong reference severs every handle.
            drop(core);
        }
        debug!(target: "addon_host", context = %self.name, "Context torn down");
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.hub.release(&self.name);
    }
}

/// Handle to code currently executable inside a context.
///
/// Cheap to clone. Holds its module weakly: after the owning context's
/// teardown every operation fails with a stale-handle error rather than
/// touching released state.
#[derive(Clone)]
pub struct LoadedModule {
    context_name: String,
    core: Weak<ModuleCore>,
}

impl LoadedModule {
    /// Name of the owning context.
    pub fn context_name(&self) -> &str {
        &self.context_name
    }

    /// Whether the handle still points at a live module.
    pub fn is_live(&self) -> bool {
        self.core.strong_count() > 0
    }

    /// The module's manifest.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::StaleHandle`] after teardown.
    pub fn manifest(&self) -> Result<ModuleManifest, HostError> {
        let core = self.core.upgrade().ok_or(HostError::StaleHandle)?;
        Ok(core.manifest.clone())
    }

    /// Invoke one method of the module.
    ///
    /// Holds the teardown barrier's read side for the full invocation: a
    /// call that begins while the module is live either completes against
    /// it or fails with [`InvokeError::Stale`], never observing a
    /// half-torn-down module.
    pub async fn invoke(
        &self,
        target: &HandlerTarget,
        args: &EventArgs,
    ) -> Result<EventValue, InvokeError> {
        let Some(core) = self.core.upgrade() else {
            return Err(InvokeError::Stale);
        };
        let torn_down = core.torn_down.read().await;
        if *torn_down {
            return Err(InvokeError::Stale);
        }
        let result = core.instance.invoke(target, args);
        drop(torn_down);
        result.map_err(InvokeError::Fault)
    }
}
