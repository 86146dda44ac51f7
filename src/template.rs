//! Named, inheritable configuration fragments and on-demand circuit
//! creation from them (§4.11).
//!
//! Grounded on §9's re-architecture guidance for "template inheritance
//! across class hierarchies": a name -> config-fragment map with explicit
//! parent-chain lookup (lexical resolution, not dynamic dispatch), stored
//! the same `DashMap` way `src/registry.rs` stores circuits.

use crate::circuit::Circuit;
use crate::config::CircuitBuilder;
use crate::error::{CircuitError, Result};
use crate::registry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::sync::{Arc, Weak};

type ConfigFragment = Arc<dyn Fn(CircuitBuilder) -> CircuitBuilder + Send + Sync>;

struct Template {
    parent: Option<String>,
    configure: ConfigFragment,
}

static TEMPLATES: Lazy<DashMap<String, Template>> = Lazy::new(DashMap::new);

/// Register a named template fragment, optionally inheriting from a parent
/// template by name. Re-registering a name replaces it.
///
/// `configure` receives the builder after the parent chain (root-first) has
/// already applied its own fragments, so a child's settings override its
/// ancestors', matching §3 Template: "child overrides parent."
pub fn register_template<F>(name: impl Into<String>, parent: Option<&str>, configure: F)
where
    F: Fn(CircuitBuilder) -> CircuitBuilder + Send + Sync + 'static,
{
    TEMPLATES.insert(name.into(), Template { parent: parent.map(str::to_string), configure: Arc::new(configure) });
}

/// Remove every registered template. Intended for test isolation.
pub fn clear_templates() {
    TEMPLATES.clear();
}

/// Apply `name`'s template chain (ancestors first, `name` itself last) to
/// `builder`. Unknown template names are a configuration error rather than a
/// silent no-op, since a typo'd template name would otherwise produce a
/// circuit with none of its intended defaults. A cycle in the parent chain
/// (a template naming an ancestor of itself) is likewise rejected rather
/// than looping forever.
fn resolve_template(name: &str, mut builder: CircuitBuilder) -> Result<CircuitBuilder> {
    let mut chain = Vec::new();
    let mut cursor = Some(name.to_string());
    let mut seen = std::collections::HashSet::new();
    while let Some(current) = cursor {
        if !seen.insert(current.clone()) {
            return Err(CircuitError::Configuration { message: format!("template cycle detected at '{current}'") });
        }
        let entry = TEMPLATES
            .get(&current)
            .ok_or_else(|| CircuitError::Configuration { message: format!("unknown template '{current}'") })?;
        cursor = entry.parent.clone();
        chain.push(current);
    }
    for template_name in chain.into_iter().rev() {
        let entry = TEMPLATES.get(&template_name).expect("presence checked above");
        builder = (entry.configure)(builder);
    }
    Ok(builder)
}

/// Where a dynamically-created circuit is stored and how long it lives
/// (§4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Stored in the caller-owned [`DynamicCircuits`] instance; lifetime
    /// follows that instance.
    Local,
    /// Stored in the process-wide registry under its own name; lifetime
    /// extends past the creating instance until explicitly removed via
    /// [`crate::registry::remove`].
    Global,
}

/// An instance-scoped map of dynamically-created circuits, for
/// `scope: Local` creations (§4.11). A host type that wants its own
/// per-instance dynamic circuits owns one of these (mirroring the
/// "builder/factory keyed by `(owner_identity, circuit_name)`" guidance in
/// §9 for re-homing mixin-style circuit attachment without polymorphic
/// inheritance).
#[derive(Default)]
pub struct DynamicCircuits {
    local: DashMap<String, Arc<Circuit>>,
}

impl DynamicCircuits {
    /// An empty instance-local dynamic circuit map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `template` (if any), apply `configure`'s overrides, and
    /// produce a circuit under `name`. `scope: Local` circuits are held by
    /// this instance (dropped when it is); `scope: Global` circuits are
    /// registered under their own name in the process registry and outlive
    /// this instance.
    pub fn dynamic_circuit<F>(&self, name: impl Into<String>, template: Option<&str>, scope: Scope, configure: F) -> Result<Arc<Circuit>>
    where
        F: FnOnce(CircuitBuilder) -> CircuitBuilder,
    {
        let name = name.into();
        let mut builder = CircuitBuilder::new(name.clone());
        if let Some(template_name) = template {
            builder = resolve_template(template_name, builder)?;
        }
        builder = configure(builder);
        let config = builder.build_config()?;
        let circuit = Circuit::new(config);

        match scope {
            Scope::Local => {
                self.local.insert(name, circuit.clone());
            }
            Scope::Global => {
                registry::mark_dynamic(&name);
            }
        }
        Ok(circuit)
    }

    /// Look up a previously-created local dynamic circuit by name.
    pub fn get(&self, name: &str) -> Option<Arc<Circuit>> {
        self.local.get(name).map(|entry| entry.clone())
    }

    /// Names of every circuit currently held locally by this instance.
    pub fn names(&self) -> Vec<String> {
        self.local.iter().map(|entry| entry.key().clone()).collect()
    }
}

/// Wrap a callback that closes over `owner` as a weak reference, so a
/// `scope: Global` dynamic circuit's callbacks/fallbacks don't pin their
/// creating instance alive (§4.11, §9 "Weak back-references to owners").
/// The wrapped callback upgrades the weak reference on every invocation and
/// is a no-op once `owner` has been dropped.
pub fn weak_callback<Owner, F>(owner: &Arc<Owner>, f: F) -> impl Fn(&str) + Send + Sync
where
    Owner: Send + Sync + 'static,
    F: Fn(&Owner, &str) + Send + Sync + 'static,
{
    let weak: Weak<Owner> = Arc::downgrade(owner);
    move |circuit_name: &str| {
        if let Some(owner) = weak.upgrade() {
            f(&owner, circuit_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::CircuitState;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn child_template_overrides_parent() {
        clear_templates();
        register_template("base", None, |b| b.failure_threshold(5).reset_timeout(std::time::Duration::from_secs(30)));
        register_template("child", Some("base"), |b| b.failure_threshold(1));

        let dynamic = DynamicCircuits::new();
        registry::clear();
        let circuit = dynamic.dynamic_circuit("tmpl-test", Some("child"), Scope::Local, |b| b).unwrap();
        assert!(matches!(circuit.config().trip_mode, crate::config::TripMode::Count { failure_threshold: 1 }));
        assert_eq!(circuit.config().reset_timeout, std::time::Duration::from_secs(30));
    }

    #[test]
    fn per_instantiation_override_beats_both_template_levels() {
        clear_templates();
        register_template("base", None, |b| b.failure_threshold(5));
        let dynamic = DynamicCircuits::new();
        registry::clear();
        let circuit = dynamic.dynamic_circuit("tmpl-override", Some("base"), Scope::Local, |b| b.failure_threshold(2)).unwrap();
        assert!(matches!(circuit.config().trip_mode, crate::config::TripMode::Count { failure_threshold: 2 }));
    }

    #[test]
    fn unknown_template_name_is_a_configuration_error() {
        clear_templates();
        let dynamic = DynamicCircuits::new();
        let err = dynamic.dynamic_circuit("tmpl-missing", Some("nonexistent"), Scope::Local, |b| b).unwrap_err();
        assert!(matches!(err, CircuitError::Configuration { .. }));
    }

    #[test]
    fn template_cycle_is_rejected() {
        clear_templates();
        register_template("a", Some("b"), |b| b);
        register_template("b", Some("a"), |b| b);
        let dynamic = DynamicCircuits::new();
        let err = dynamic.dynamic_circuit("tmpl-cycle", Some("a"), Scope::Local, |b| b).unwrap_err();
        assert!(matches!(err, CircuitError::Configuration { .. }));
    }

    #[test]
    fn local_scope_is_retrievable_from_the_owning_instance_only() {
        registry::clear();
        let dynamic = DynamicCircuits::new();
        dynamic.dynamic_circuit("tmpl-local", None, Scope::Local, |b| b).unwrap();
        assert!(dynamic.get("tmpl-local").is_some());
        assert_eq!(dynamic.names(), vec!["tmpl-local".to_string()]);
    }

    #[test]
    fn global_scope_is_tracked_by_the_process_registry() {
        registry::clear();
        let dynamic = DynamicCircuits::new();
        dynamic.dynamic_circuit("tmpl-global", None, Scope::Global, |b| b).unwrap();
        assert!(registry::dynamic_circuit_names().contains(&"tmpl-global".to_string()));
        assert!(registry::lookup("tmpl-global").is_some());
    }

    #[test]
    fn weak_callback_no_ops_once_owner_is_dropped() {
        struct Owner;
        let owner = Arc::new(Owner);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let callback = weak_callback(&owner, move |_owner: &Owner, _name: &str| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        callback("circuit-a");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(owner);
        callback("circuit-a");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn weak_callback_wires_into_a_circuit_on_open_hook() {
        registry::clear();
        struct Owner {
            opens_seen: AtomicU32,
        }
        let owner = Arc::new(Owner { opens_seen: AtomicU32::new(0) });
        let builder = CircuitBuilder::new("tmpl-owner-hook").failure_threshold(1).on_open(weak_callback(&owner, |owner, _name| {
            owner.opens_seen.fetch_add(1, Ordering::SeqCst);
        }));
        let circuit = Circuit::new(builder.build_config().unwrap());

        futures::executor::block_on(circuit.call(|| async { Err::<(), _>(anyhow::anyhow!("boom")) })).ok();
        assert_eq!(owner.opens_seen.load(Ordering::SeqCst), 1);
        assert_eq!(circuit.state(), CircuitState::Open);
    }
}
