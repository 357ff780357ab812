//! Security gate: approves or denies a compiled module before it is loaded.
//!
//! Runs after every successful compile and before every load, including on
//! hot reload, since a recompiled module may declare references its
//! previous version did not.

use serde::Deserialize;
use tracing::debug;

use crate::compiler::CompiledModule;

/// Permission level configured per script at construction.
///
/// Never changes for the lifetime of a script. Higher levels admit more
/// capability namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
pub struct PermissionLevel(pub u8);

/// Result of auditing one compiled module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditOutcome {
    /// The module may be loaded.
    Allow,
    /// The module must not be loaded; every violation is listed.
    Deny(Vec<String>),
}

impl AuditOutcome {
    /// Whether the outcome permits loading.
    pub fn is_allow(&self) -> bool {
        matches!(self, AuditOutcome::Allow)
    }
}

/// Capability namespaces unlocked per permission level.
///
/// Level N admits the union of tiers `0..=N`. A declared reference is
/// admitted when some unlocked namespace is a dot-separated prefix of it.
const CAPABILITY_TIERS: &[&[&str]] = &[
    &["host.events", "host.log"],
    &["host.timers", "host.storage"],
    &["host.net", "host.fs"],
];

/// Decides whether a compiled module may be loaded under a permission level.
///
/// Policy is fail-closed: a module whose external references cannot be
/// fully enumerated is denied regardless of level.
#[derive(Debug, Clone)]
pub struct SecurityGate {
    tiers: Vec<Vec<String>>,
}

impl Default for SecurityGate {
    fn default() -> Self {
        Self {
            tiers: CAPABILITY_TIERS
                .iter()
                .map(|tier| tier.iter().map(|ns| ns.to_string()).collect())
                .collect(),
        }
    }
}

impl SecurityGate {
    /// Gate with the built-in capability tiers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate with custom capability tiers: `tiers[n]` lists the namespaces
    /// that become available at permission level `n`.
    pub fn with_tiers(tiers: Vec<Vec<String>>) -> Self {
        Self { tiers }
    }

    /// Audit a compiled-but-not-yet-loaded module.
    pub fn audit(&self, module: &CompiledModule, level: PermissionLevel) -> AuditOutcome {
        let Some(refs) = module.external_refs.as_ref() else {
            // Fail closed: unenumerable references are never trusted.
            return AuditOutcome::Deny(vec![
                "external references could not be enumerated".to_string(),
            ]);
        };

        let unlocked: Vec<&str> = self
            .tiers
            .iter()
            .take(usize::from(level.0) + 1)
            .flatten()
            .map(String::as_str)
            .collect();

        let reasons: Vec<String> = refs
            .iter()
            .filter(|r| !unlocked.iter().any(|ns| matches_namespace(ns, r)))
            .map(|r| format!("reference '{r}' not permitted at level {}", level.0))
            .collect();

        if reasons.is_empty() {
            debug!(target: "addon_host", refs = refs.len(), level = level.0, "Audit passed");
            AuditOutcome::Allow
        } else {
            debug!(target: "addon_host", violations = reasons.len(), level = level.0, "Audit denied");
            AuditOutcome::Deny(reasons)
        }
    }
}

/// Whether `namespace` is a dot-separated prefix of `reference`.
fn matches_namespace(namespace: &str, reference: &str) -> bool {
    reference == namespace
        || (reference.starts_with(namespace)
            && reference.as_bytes().get(namespace.len()) == Some(&b'.'))
}
