//! Event-handler registry.
//!
//! Maps logical event names to the handler methods a loaded module tagged
//! for them. The mapping is set-valued: two modules or two methods may
//! legitimately register the same event name and all of them are kept and
//! dispatched in registration order.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;

use crate::context::{EventArgs, EventValue, HandlerFault, HandlerTarget, InvokeError, LoadedModule};
use crate::error::HostError;

/// One registered handler: an event name bound to a callable reference
/// into a specific loaded module.
///
/// Lifetime is bound to the module that produced it: entries are cleared
/// in full before an unload completes and rebuilt in full on the next load.
#[derive(Clone)]
pub struct EventHandlerEntry {
    /// The logical event name the handler is registered under.
    pub event_name: String,
    /// The method to invoke.
    pub target: HandlerTarget,
    /// Handle to the module the method lives in.
    pub module: LoadedModule,
}

/// A single handler's failure during dispatch, isolated per handler: it
/// never prevents the other handlers under the same event name from
/// running.
#[derive(Debug, thiserror::Error)]
#[error("handler {target} failed for event '{event_name}': {fault}")]
pub struct DispatchHandlerError {
    /// The event being dispatched.
    pub event_name: String,
    /// The handler that failed.
    pub target: HandlerTarget,
    /// What the execution mechanism reported.
    pub fault: HandlerFault,
}

/// Per-handler outcome of one dispatch.
pub type HandlerResult = Result<EventValue, DispatchHandlerError>;

/// The event name → handler-set mapping for one script.
///
/// Scan and clear take the write side of the lock, dispatch takes the read
/// side, so the mapping is never mutated under a reader.
#[derive(Default)]
pub struct EventRegistry {
    handlers: RwLock<HashMap<String, Vec<EventHandlerEntry>>>,
}

impl EventRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan a loaded module and append an entry for every eligible handler.
    ///
    /// Walks every type, then every method, exactly once. A method is
    /// eligible iff it is invocable without an instance and carries an
    /// event tag with a non-empty event name. Duplicate names within one
    /// module are all kept (fan-out dispatch), not an error.
    ///
    /// Returns the number of entries added.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::StaleHandle`] if the module was torn down.
    pub async fn scan(&self, module: &LoadedModule) -> Result<usize, HostError> {
        let manifest = module.manifest()?;
        let mut handlers = self.handlers.write().await;
        let added = populate(&mut handlers, &manifest, module);

        debug!(target: "addon_host", context = module.context_name(), added, "Registry scan complete");
        Ok(added)
    }

    /// Empty the mapping. Runs synchronously before any unload completes.
    pub async fn clear(&self) {
        self.handlers.write().await.clear();
    }

    /// Atomically replace the mapping with the scan of a new module.
    ///
    /// Used by hot reload so no dispatcher ever observes a half-built
    /// mapping.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::StaleHandle`] if the module was torn down; the
    /// mapping is left empty in that case.
    pub async fn rebuild(&self, module: &LoadedModule) -> Result<usize, HostError> {
        let manifest = module.manifest()?;
        let mut handlers = self.handlers.write().await;
        handlers.clear();
        Ok(populate(&mut handlers, &manifest, module))
    }

    /// Number of handlers registered under an event name.
    pub async fn handler_count(&self, event_name: &str) -> usize {
        self.handlers
            .read()
            .await
            .get(event_name)
            .map_or(0, Vec::len)
    }

    /// Total number of registered handlers.
    pub async fn len(&self) -> usize {
        self.handlers.read().await.values().map(Vec::len).sum()
    }

    /// Whether the registry holds no handlers.
    pub async fn is_empty(&self) -> bool {
        self.handlers.read().await.is_empty()
    }

    /// Invoke every handler registered under an event name, in
    /// registration order.
    ///
    /// One handler's failure is reported in its slot of the result and
    /// does not stop the remaining handlers. An unknown event name yields
    /// an empty result.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::StaleHandle`] if the handlers' module was torn
    /// down before the dispatch could complete against it.
    pub async fn dispatch(
        &self,
        event_name: &str,
        args: &EventArgs,
    ) -> Result<Vec<HandlerResult>, HostError> {
        let handlers = self.handlers.read().await;
        let Some(entries) = handlers.get(event_name) else {
            return Ok(Vec::new());
        };

        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.module.invoke(&entry.target, args).await {
                Ok(value) => results.push(Ok(value)),
                Err(InvokeError::Fault(fault)) => {
                    debug!(
                        target: "addon_host",
                        handler = %entry.target,
                        event = event_name,
                        "Handler failed during dispatch"
                    );
                    results.push(Err(DispatchHandlerError {
                        event_name: entry.event_name.clone(),
                        target: entry.target.clone(),
                        fault,
                    }));
                }
                Err(InvokeError::Stale) => return Err(HostError::StaleHandle),
            }
        }
        Ok(results)
    }
}

/// Append an entry for every eligible method of the manifest. Walks every
/// type, then every method, exactly once.
fn populate(
    handlers: &mut HashMap<String, Vec<EventHandlerEntry>>,
    manifest: &crate::compiler::ModuleManifest,
    module: &LoadedModule,
) -> usize {
    let mut added = 0;
    for ty in &manifest.types {
        for method in &ty.methods {
            if !method.is_static {
                continue;
            }
            let Some(tag) = method.event_tag() else {
                continue;
            };
            handlers
                .entry(tag.to_string())
                .or_default()
                .push(EventHandlerEntry {
                    event_name: tag.to_string(),
                    target: HandlerTarget {
                        type_name: ty.name.clone(),
                        method_name: method.name.clone(),
                    },
                    module: module.clone(),
                });
            added += 1;
        }
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{
        CompiledModule, Diagnostics, MethodInfo, ModuleManifest, TypeInfo, EVENT_ATTRIBUTE,
    };
    use crate::context::{ContextHub, ExecutionContext, ModuleInstance, ModuleRuntime};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn tagged(name: &str, event: &str, is_static: bool) -> MethodInfo {
        let mut attributes = BTreeMap::new();
        attributes.insert(EVENT_ATTRIBUTE.to_string(), event.to_string());
        MethodInfo {
            name: name.to_string(),
            is_static,
            attributes,
        }
    }

    fn untagged(name: &str) -> MethodInfo {
        MethodInfo {
            name: name.to_string(),
            is_static: true,
            attributes: BTreeMap::new(),
        }
    }

    fn module_with(types: Vec<TypeInfo>) -> CompiledModule {
        CompiledModule {
            payload: vec![1],
            diagnostics: Diagnostics::default(),
            manifest: ModuleManifest { types },
            external_refs: Some(vec![]),
        }
    }

    /// Instance that succeeds for every method except ones named "Broken".
    struct FlakyInstance;
    struct FlakyRuntime;

    impl ModuleRuntime for FlakyRuntime {
        fn instantiate(
            &self,
            _module: &CompiledModule,
        ) -> Result<Box<dyn ModuleInstance>, HostError> {
            Ok(Box::new(FlakyInstance))
        }
    }

    impl ModuleInstance for FlakyInstance {
        fn invoke(
            &self,
            target: &HandlerTarget,
            _args: &EventArgs,
        ) -> Result<EventValue, HandlerFault> {
            if target.method_name == "Broken" {
                Err(HandlerFault("deliberate failure".to_string()))
            } else {
                Ok(EventValue(target.method_name.clone().into_bytes()))
            }
        }
    }

    fn load(hub: &ContextHub, name: &str, module: &CompiledModule) -> (ExecutionContext, LoadedModule) {
        let mut ctx = hub.create_context(name, Arc::new(FlakyRuntime)).unwrap();
        let loaded = ctx.load(module).unwrap();
        (ctx, loaded)
    }

    #[tokio::test]
    async fn test_scan_registers_only_eligible_methods() {
        let module = module_with(vec![TypeInfo {
            name: "Mod".to_string(),
            methods: vec![
                tagged("OnTick", "tick", true),
                tagged("InstanceHandler", "tick", false), // not static
                tagged("EmptyTag", "", true),             // empty event name
                untagged("Helper"),
            ],
        }]);

        let hub = ContextHub::new();
        let (_ctx, loaded) = load(&hub, "scan", &module);

        let registry = EventRegistry::new();
        let added = registry.scan(&loaded).await.unwrap();
        assert_eq!(added, 1);
        assert_eq!(registry.handler_count("tick").await, 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_event_names_fan_out() {
        let module = module_with(vec![
            TypeInfo {
                name: "A".to_string(),
                methods: vec![tagged("First", "tick", true), tagged("Second", "tick", true)],
            },
            TypeInfo {
                name: "B".to_string(),
                methods: vec![tagged("Third", "tick", true)],
            },
        ]);

        let hub = ContextHub::new();
        let (_ctx, loaded) = load(&hub, "fanout", &module);

        let registry = EventRegistry::new();
        registry.scan(&loaded).await.unwrap();
        assert_eq!(registry.handler_count("tick").await, 3);

        let results = registry.dispatch("tick", &EventArgs::none()).await.unwrap();
        assert_eq!(results.len(), 3);
        // Registration order preserved.
        let names: Vec<_> = results
            .iter()
            .map(|r| String::from_utf8(r.as_ref().unwrap().0.clone()).unwrap())
            .collect();
        assert_eq!(names, vec!["First", "Second", "Third"]);
    }

    #[tokio::test]
    async fn test_handler_isolation() {
        let module = module_with(vec![TypeInfo {
            name: "Mod".to_string(),
            methods: vec![tagged("Broken", "tick", true), tagged("Works", "tick", true)],
        }]);

        let hub = ContextHub::new();
        let (_ctx, loaded) = load(&hub, "isolation", &module);

        let registry = EventRegistry::new();
        registry.scan(&loaded).await.unwrap();

        let results = registry.dispatch("tick", &EventArgs::none()).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_err());
        assert_eq!(results[1].as_ref().unwrap().0, b"Works");

        // The failure did not corrupt the registry.
        assert_eq!(registry.handler_count("tick").await, 2);
        let again = registry.dispatch("tick", &EventArgs::none()).await.unwrap();
        assert_eq!(again.len(), 2);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_event_is_empty() {
        let registry = EventRegistry::new();
        let results = registry.dispatch("nope", &EventArgs::none()).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_after_teardown_is_stale() {
        let module = module_with(vec![TypeInfo {
            name: "Mod".to_string(),
            methods: vec![tagged("OnTick", "tick", true)],
        }]);

        let hub = ContextHub::new();
        let (ctx, loaded) = load(&hub, "stale", &module);

        let registry = EventRegistry::new();
        registry.scan(&loaded).await.unwrap();

        ctx.teardown().await;
        let err = registry.dispatch("tick", &EventArgs::none()).await.unwrap_err();
        assert!(matches!(err, HostError::StaleHandle));
    }

    #[tokio::test]
    async fn test_clear_empties_mapping() {
        let module = module_with(vec![TypeInfo {
            name: "Mod".to_string(),
            methods: vec![tagged("OnTick", "tick", true)],
        }]);

        let hub = ContextHub::new();
        let (_ctx, loaded) = load(&hub, "clear", &module);

        let registry = EventRegistry::new();
        registry.scan(&loaded).await.unwrap();
        assert!(!registry.is_empty().await);

        registry.clear().await;
        assert!(registry.is_empty().await);
        assert_eq!(registry.handler_count("tick").await, 0);
    }

    #[tokio::test]
    async fn test_rebuild_replaces_old_entries() {
        let old = module_with(vec![TypeInfo {
            name: "Old".to_string(),
            methods: vec![tagged("OnTick", "tick", true)],
        }]);
        let new = module_with(vec![TypeInfo {
            name: "New".to_string(),
            methods: vec![tagged("OnSave", "save", true)],
        }]);

        let hub = ContextHub::new();
        let (_old_ctx, old_loaded) = load(&hub, "old", &old);
        let (_new_ctx, new_loaded) = load(&hub, "new", &new);

        let registry = EventRegistry::new();
        registry.scan(&old_loaded).await.unwrap();
        registry.rebuild(&new_loaded).await.unwrap();

        assert_eq!(registry.handler_count("tick").await, 0);
        assert_eq!(registry.handler_count("save").await, 1);
    }
}
