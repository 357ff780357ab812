//! Script lifecycle: the state machine that takes an addon from declared
//! to compiled to loaded to unloaded, and the supervisor that keeps it
//! hot-reloadable.
//!
//! # Reload policy
//!
//! Hot reload compiles the new version into a *new* execution context and
//! swaps only on success (compile-then-swap). The previous module keeps
//! serving dispatches for the whole cycle; a failed recompile, audit, or
//! load leaves it live and the failure diagnostics retained. The
//! alternative (unload first, then recompile) would leave the addon
//! unavailable for the window and unloaded on failure.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::audit::{AuditOutcome, PermissionLevel, SecurityGate};
use crate::compiler::{collect_sources, CompiledModule, CompilerService, Diagnostic, Diagnostics};
use crate::config::HostConfig;
use crate::context::{ContextHub, ExecutionContext, LoadedModule, ModuleRuntime};
use crate::descriptor::Descriptor;
use crate::error::{HostError, HostResult};
use crate::registry::{EventRegistry, HandlerResult};
use crate::watcher::{ReloadRequest, SourceWatcher};

/// Where a script is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptState {
    /// No module exists. Initial state; re-entered after unload or a
    /// failed compile.
    Unloaded,
    /// A compile is in progress.
    Compiling,
    /// A compiled module is held, not yet audited/loaded.
    Compiled,
    /// The security audit denied the last compiled module. Re-enterable:
    /// recompiling a changed source set starts over.
    AuditFailed,
    /// A module is live and dispatchable.
    Loaded,
    /// A reload cycle is replacing the live module.
    Reloading,
}

/// Diagnostics retained on the script after a failed (or warned) transition.
#[derive(Debug, Clone, Default)]
pub struct ScriptDiagnostics {
    /// Errors and warnings from the most recent compile.
    pub compile: Diagnostics,
    /// Reasons from the most recent audit denial.
    pub deny_reasons: Vec<String>,
    /// The most recent in-context load failure.
    pub load_error: Option<String>,
}

/// One addon's lifecycle manager.
///
/// Owns the descriptor, the state machine, the compiled-module slot, the
/// execution context, and the event registry. A script constructed from a
/// bad descriptor is permanently bad: every operation fails with the
/// retained config error.
pub struct Script {
    descriptor: Option<Descriptor>,
    descriptor_path: PathBuf,
    config_error: Option<String>,
    permission_level: PermissionLevel,
    config: HostConfig,
    compiler: Arc<dyn CompilerService>,
    runtime: Arc<dyn ModuleRuntime>,
    hub: ContextHub,
    gate: SecurityGate,
    state_tx: watch::Sender<ScriptState>,
    diagnostics: ScriptDiagnostics,
    /// Held between compile and load; superseded by each recompile.
    compiled: Option<CompiledModule>,
    context: Option<ExecutionContext>,
    module: Option<LoadedModule>,
    registry: Arc<EventRegistry>,
    /// Bumped per context so swap-in-progress contexts get distinct names.
    generation: u64,
}

impl Script {
    /// Construct a script from its descriptor file.
    ///
    /// A missing or malformed descriptor does not fail construction; it
    /// yields a permanently-bad script (`is_good() == false`) that refuses
    /// all further operations, matching how addon directories with broken
    /// metadata are surfaced rather than skipped.
    pub fn new(
        descriptor_path: impl Into<PathBuf>,
        permission_level: PermissionLevel,
        config: HostConfig,
        compiler: Arc<dyn CompilerService>,
        runtime: Arc<dyn ModuleRuntime>,
        hub: ContextHub,
    ) -> Self {
        let descriptor_path = descriptor_path.into();
        let (descriptor, config_error) = match Descriptor::load(&descriptor_path) {
            Ok(d) => (Some(d), None),
            Err(e) => {
                warn!(
                    target: "addon_host",
                    path = %descriptor_path.display(),
                    error = %e,
                    "Bad addon descriptor, script will refuse all operations"
                );
                (None, Some(e.to_string()))
            }
        };

        let (state_tx, _) = watch::channel(ScriptState::Unloaded);
        Self {
            descriptor,
            descriptor_path,
            config_error,
            permission_level,
            config,
            compiler,
            runtime,
            hub,
            gate: SecurityGate::new(),
            state_tx,
            diagnostics: ScriptDiagnostics::default(),
            compiled: None,
            context: None,
            module: None,
            registry: Arc::new(EventRegistry::new()),
            generation: 0,
        }
    }

    /// Replace the default security gate.
    pub fn with_gate(mut self, gate: SecurityGate) -> Self {
        self.gate = gate;
        self
    }

    /// Whether the descriptor parsed and the script accepts operations.
    pub fn is_good(&self) -> bool {
        self.descriptor.is_some()
    }

    /// The parsed descriptor, if construction succeeded.
    pub fn descriptor(&self) -> Option<&Descriptor> {
        self.descriptor.as_ref()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ScriptState {
        *self.state_tx.borrow()
    }

    /// Watch lifecycle state transitions.
    pub fn state_watch(&self) -> watch::Receiver<ScriptState> {
        self.state_tx.subscribe()
    }

    /// Diagnostics retained from the most recent transitions.
    pub fn diagnostics(&self) -> &ScriptDiagnostics {
        &self.diagnostics
    }

    /// The script's event registry, shareable with dispatchers.
    pub fn registry(&self) -> Arc<EventRegistry> {
        Arc::clone(&self.registry)
    }

    /// The permission level fixed at construction.
    pub fn permission_level(&self) -> PermissionLevel {
        self.permission_level
    }

    /// Host configuration this script runs under.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Whether a loaded module currently exists for this script.
    pub fn has_loaded_module(&self) -> bool {
        self.module.as_ref().is_some_and(LoadedModule::is_live)
    }

    fn set_state(&self, state: ScriptState) {
        self.state_tx.send_replace(state);
    }

    fn require_good(&self) -> HostResult<&Descriptor> {
        self.descriptor.as_ref().ok_or_else(|| HostError::Config {
            path: self.descriptor_path.clone(),
            message: self
                .config_error
                .clone()
                .unwrap_or_else(|| "descriptor unavailable".to_string()),
        })
    }

    /// Compile the addon's sources.
    ///
    /// `Unloaded → Compiling → Compiled` on success. On failure or timeout
    /// the script returns to `Unloaded` with diagnostics retained; it may
    /// be recompiled indefinitely.
    ///
    /// A live script is recompiled through [`reload()`](Self::reload), not
    /// here; that keeps the old module serving until the swap.
    pub async fn compile(&mut self) -> HostResult<()> {
        self.require_good()?;
        match self.state() {
            ScriptState::Loaded | ScriptState::Reloading | ScriptState::Compiling => {
                return Err(HostError::BadState {
                    op: "compile",
                    state: self.state(),
                });
            }
            ScriptState::Unloaded | ScriptState::Compiled | ScriptState::AuditFailed => {}
        }

        self.set_state(ScriptState::Compiling);
        match self.compile_once().await {
            Ok(module) => {
                self.compiled = Some(module);
                self.set_state(ScriptState::Compiled);
                Ok(())
            }
            Err(e) => {
                self.compiled = None;
                self.set_state(ScriptState::Unloaded);
                Err(e)
            }
        }
    }

    /// Audit the compiled module and, on approval, make it live.
    ///
    /// Runs the security gate, creates a fresh execution context, loads
    /// the module, and populates the event registry as part of the same
    /// transition. Audit denial parks the script in `AuditFailed`; an
    /// in-context load failure is treated like a compile failure.
    pub async fn load(&mut self) -> HostResult<()> {
        self.require_good()?;
        if self.state() != ScriptState::Compiled {
            return Err(HostError::BadState {
                op: "load",
                state: self.state(),
            });
        }
        let Some(compiled) = self.compiled.take() else {
            return Err(HostError::BadState {
                op: "load",
                state: self.state(),
            });
        };

        match self.load_into_new_context(&compiled) {
            Ok((ctx, module)) => {
                if let Err(e) = self.registry.rebuild(&module).await {
                    ctx.teardown().await;
                    self.set_state(ScriptState::Unloaded);
                    return Err(e);
                }
                info!(
                    target: "addon_host",
                    addon = %self.addon_name(),
                    context = ctx.name(),
                    "Addon loaded"
                );
                self.context = Some(ctx);
                self.module = Some(module);
                self.set_state(ScriptState::Loaded);
                Ok(())
            }
            Err(e @ HostError::AuditDenied(_)) => {
                self.set_state(ScriptState::AuditFailed);
                Err(e)
            }
            Err(e @ HostError::DuplicateContext(_)) => {
                // Contract violation at the context boundary; the compiled
                // module is still usable once the collision is resolved.
                self.compiled = Some(compiled);
                self.set_state(ScriptState::Compiled);
                Err(e)
            }
            Err(e) => {
                self.set_state(ScriptState::Unloaded);
                Err(e)
            }
        }
    }

    /// Unload the live module, if any.
    ///
    /// The registry is cleared before the context teardown begins, and the
    /// teardown drains in-flight dispatches before releasing resources.
    pub async fn unload(&mut self) -> HostResult<()> {
        self.require_good()?;

        self.registry.clear().await;
        self.module = None;
        self.compiled = None;
        if let Some(ctx) = self.context.take() {
            ctx.teardown().await;
        }
        self.set_state(ScriptState::Unloaded);
        debug!(target: "addon_host", addon = %self.addon_name(), "Addon unloaded");
        Ok(())
    }

    /// Run one reload cycle.
    ///
    /// From `Loaded`, this is the compile-then-swap path: the new version
    /// is compiled, audited, and loaded into a new context while the old
    /// module keeps serving; only then does the registry switch over and
    /// the old context tear down. Any failure leaves the old module live
    /// (state returns to `Loaded`) with the failure diagnostics retained.
    ///
    /// From any other state this is a cold start: plain compile + load,
    /// with those operations' usual failure states.
    pub async fn reload(&mut self) -> HostResult<()> {
        self.require_good()?;

        if self.state() != ScriptState::Loaded {
            self.compile().await?;
            return self.load().await;
        }

        self.set_state(ScriptState::Reloading);
        let result = self.swap_in_new_version().await;
        // Whatever happened, a module is live: the new one on success, the
        // previous one on failure.
        self.set_state(ScriptState::Loaded);
        result
    }

    async fn swap_in_new_version(&mut self) -> HostResult<()> {
        let compiled = self.compile_once().await?;
        let (ctx, module) = self.load_into_new_context(&compiled)?;

        if let Err(e) = self.registry.rebuild(&module).await {
            ctx.teardown().await;
            return Err(e);
        }

        info!(
            target: "addon_host",
            addon = %self.addon_name(),
            context = ctx.name(),
            "Addon reloaded"
        );

        let old_ctx = self.context.replace(ctx);
        self.module = Some(module);

        // Barrier: drains dispatches still running against the old module.
        if let Some(old) = old_ctx {
            old.teardown().await;
        }
        Ok(())
    }

    /// Compile the sources once, retaining diagnostics either way. Does
    /// not touch the state machine.
    async fn compile_once(&mut self) -> HostResult<CompiledModule> {
        let descriptor = self.require_good()?;
        let dir = descriptor.source_directory.clone();
        let language_version = self.config.language_version.clone();
        let compiler = Arc::clone(&self.compiler);

        // The compiler is synchronous and possibly slow; keep it off the
        // async workers and under the configured bound.
        let work = tokio::task::spawn_blocking(move || {
            let unit = collect_sources(&dir, &language_version).map_err(|e| {
                HostError::Compile(Diagnostics {
                    errors: vec![Diagnostic {
                        message: format!("failed to read sources: {e}"),
                        location: dir.display().to_string(),
                    }],
                    warnings: Vec::new(),
                })
            })?;
            Ok(compiler.compile(&unit))
        });

        let result = match tokio::time::timeout(self.config.compile_timeout(), work).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(HostError::Compile(Diagnostics {
                errors: vec![Diagnostic {
                    message: format!("compiler service panicked: {join_err}"),
                    location: String::new(),
                }],
                warnings: Vec::new(),
            })),
            Err(_elapsed) => Err(HostError::CompileTimeout),
        };

        match result {
            Ok(module) if module.is_success() => {
                self.diagnostics.compile = module.diagnostics.clone();
                Ok(module)
            }
            Ok(module) => {
                self.diagnostics.compile = module.diagnostics.clone();
                Err(HostError::Compile(module.diagnostics))
            }
            Err(e) => {
                match &e {
                    HostError::Compile(d) => self.diagnostics.compile = d.clone(),
                    HostError::CompileTimeout => {
                        self.diagnostics.compile = Diagnostics {
                            errors: vec![Diagnostic {
                                message: "compilation timed out".to_string(),
                                location: String::new(),
                            }],
                            warnings: Vec::new(),
                        };
                    }
                    _ => {}
                }
                Err(e)
            }
        }
    }

    /// Audit a compiled module and load it into a fresh context. Updates
    /// the audit/load diagnostics; does not touch the state machine.
    fn load_into_new_context(
        &mut self,
        compiled: &CompiledModule,
    ) -> HostResult<(ExecutionContext, LoadedModule)> {
        // Every compiled version is re-audited: a recompile may introduce
        // references its predecessor did not have.
        match self.gate.audit(compiled, self.permission_level) {
            AuditOutcome::Deny(reasons) => {
                self.diagnostics.deny_reasons = reasons.clone();
                return Err(HostError::AuditDenied(reasons));
            }
            AuditOutcome::Allow => self.diagnostics.deny_reasons.clear(),
        }

        let name = format!("{}.g{}", self.addon_name(), self.generation);
        self.generation += 1;

        let mut ctx = self.hub.create_context(name, Arc::clone(&self.runtime))?;
        match ctx.load(compiled) {
            Ok(module) => {
                self.diagnostics.load_error = None;
                Ok((ctx, module))
            }
            Err(e) => {
                self.diagnostics.load_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn addon_name(&self) -> &str {
        self.descriptor
            .as_ref()
            .map_or("<bad descriptor>", |d| d.name.as_str())
    }
}

/// Runs one script in its own task: performs the initial load, watches the
/// source directory, and serializes reload cycles.
///
/// Reload requests go through a depth-1 queue, so cycles for one script
/// never overlap and a burst of requests collapses to one queued cycle.
/// Dispatch stays available concurrently through the shared registry.
pub struct ScriptSupervisor {
    reload_tx: mpsc::Sender<ReloadRequest>,
    registry: Arc<EventRegistry>,
    state_rx: watch::Receiver<ScriptState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
    watcher_task: tokio::task::JoinHandle<()>,
}

impl ScriptSupervisor {
    /// Start supervising a script: spawn its worker task and its source
    /// watcher, then kick off the initial load.
    ///
    /// An initial load failure is logged, not fatal: the watcher stays
    /// up, so fixing the sources triggers a fresh cycle.
    ///
    /// # Errors
    ///
    /// Returns the retained config error for a bad script, or
    /// [`HostError::Watch`] if the source watcher cannot start.
    pub fn spawn(mut script: Script) -> HostResult<Self> {
        let descriptor = script.require_good()?;
        let source_dir = descriptor.source_directory.clone();

        let registry = script.registry();
        let state_rx = script.state_watch();
        let (reload_tx, mut reload_rx) = mpsc::channel::<ReloadRequest>(1);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let watcher = SourceWatcher::new(source_dir, script.config.debounce(), reload_tx.clone())?;
        let watcher_task = tokio::spawn(watcher.run());

        let task = tokio::spawn(async move {
            if let Err(e) = script.reload().await {
                warn!(
                    target: "addon_host",
                    addon = %script.addon_name(),
                    error = %e,
                    "Initial load failed"
                );
            }

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        if let Err(e) = script.unload().await {
                            warn!(
                                target: "addon_host",
                                addon = %script.addon_name(),
                                error = %e,
                                "Unload on shutdown failed"
                            );
                        }
                        break;
                    }
                    request = reload_rx.recv() => {
                        match request {
                            Some(ReloadRequest) => {
                                if let Err(e) = script.reload().await {
                                    warn!(
                                        target: "addon_host",
                                        addon = %script.addon_name(),
                                        error = %e,
                                        "Reload failed"
                                    );
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        Ok(Self {
            reload_tx,
            registry,
            state_rx,
            shutdown_tx: Some(shutdown_tx),
            task,
            watcher_task,
        })
    }

    /// The supervised script's event registry.
    pub fn registry(&self) -> Arc<EventRegistry> {
        Arc::clone(&self.registry)
    }

    /// Current lifecycle state of the supervised script.
    pub fn state(&self) -> ScriptState {
        *self.state_rx.borrow()
    }

    /// Watch the supervised script's state transitions.
    pub fn state_watch(&self) -> watch::Receiver<ScriptState> {
        self.state_rx.clone()
    }

    /// Queue a reload cycle. Returns `false` if an identical cycle is
    /// already queued (the request is dropped, not an error).
    pub fn request_reload(&self) -> bool {
        self.reload_tx.try_send(ReloadRequest).is_ok()
    }

    /// Dispatch an event through the supervised script's registry.
    pub async fn dispatch(
        &self,
        event_name: &str,
        args: &crate::context::EventArgs,
    ) -> HostResult<Vec<HandlerResult>> {
        self.registry.dispatch(event_name, args).await
    }

    /// Unload the script and stop the worker and watcher tasks.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
        // The worker dropped its reload receiver; the watcher loop exits
        // on the closed channel and releases the filesystem watch.
        drop(self.reload_tx);
        let _ = self.watcher_task.await;
    }
}
