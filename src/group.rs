//! Named collections of circuits sharing defaults and dependency wiring
//! (§4.10).
//!
//! Grounded on `riptide-utils::health_registry::InMemoryHealthRegistry`'s
//! `Arc<RwLock<HashMap<String, Arc<dyn _>>>>` shape, swapped to a
//! `DashMap<String, Arc<Circuit>>` for lock-free reads — the same
//! registry/map idiom `src/registry.rs` uses, scoped to one group's members
//! instead of the whole process.

use crate::circuit::Circuit;
use crate::config::CircuitBuilder;
use crate::error::Result;
use crate::event::CircuitState;
use crate::registry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

/// A named collection of circuits that share a config baseline, may declare
/// dependencies on one another, and may carry custom guard predicates beyond
/// the built-in dependency guard (§4.10).
///
/// Member circuits are registered process-wide under
/// `"{group_name}.{member_name}"` (their *effective name*), so they remain
/// independently resolvable through [`crate::registry`] for cascades and
/// cross-group dependencies.
pub struct CircuitGroup {
    group_name: String,
    defaults: Arc<dyn Fn(CircuitBuilder) -> CircuitBuilder + Send + Sync>,
    members: DashMap<String, Arc<Circuit>>,
    guards: DashMap<String, Arc<dyn Fn() -> bool + Send + Sync>>,
    /// Hint only: member circuits in this crate are always driven through
    /// Tokio regardless of this flag (§4.10: "purely a hint that member
    /// circuits should use whichever coordination primitive the host's
    /// scheduler prefers").
    async_mode: bool,
}

impl CircuitGroup {
    /// Start a new, empty group named `group_name`.
    pub fn new(group_name: impl Into<String>) -> Self {
        Self {
            group_name: group_name.into(),
            defaults: Arc::new(|builder| builder),
            members: DashMap::new(),
            guards: DashMap::new(),
            async_mode: false,
        }
    }

    /// Apply `configure` to every member's builder before its own
    /// per-member overrides, establishing the group's shared configuration
    /// baseline.
    pub fn with_defaults<F>(mut self, configure: F) -> Self
    where
        F: Fn(CircuitBuilder) -> CircuitBuilder + Send + Sync + 'static,
    {
        self.defaults = Arc::new(configure);
        self
    }

    /// Opt into "async mode" (§4.10: a scheduler-preference hint only).
    pub fn async_mode(mut self, enabled: bool) -> Self {
        self.async_mode = enabled;
        self
    }

    /// `true` if this group was built with `async_mode(true)`.
    pub fn is_async_mode(&self) -> bool {
        self.async_mode
    }

    /// The effective, registry/storage-key name for a member: `"{group_name}.{member_name}"`.
    pub fn qualify(&self, member_name: &str) -> String {
        format!("{}.{}", self.group_name, member_name)
    }

    /// Create (or replace) a member circuit, applying the group's shared
    /// defaults and then `configure`'s overrides. `depends_on` is resolved
    /// through [`Self::qualify`] when the named dependency is itself a
    /// member of this group, so callers can write bare member names for
    /// intra-group dependencies; names not found among members are passed
    /// through unqualified (they may be circuits outside the group).
    pub fn circuit<F>(
        &self,
        member_name: impl Into<String>,
        depends_on: impl IntoIterator<Item = impl Into<String>>,
        configure: F,
    ) -> Result<Arc<Circuit>>
    where
        F: FnOnce(CircuitBuilder) -> CircuitBuilder,
    {
        let member_name = member_name.into();
        let effective_name = self.qualify(&member_name);

        let qualified_deps: Vec<String> = depends_on
            .into_iter()
            .map(Into::into)
            .map(|dep| if self.members.contains_key(&dep) { self.qualify(&dep) } else { dep })
            .collect();

        let builder = CircuitBuilder::new(effective_name);
        let builder = (self.defaults)(builder).depends_on(qualified_deps);
        let builder = configure(builder);
        let config = builder.build_config()?;
        let circuit = Circuit::new(config);
        self.members.insert(member_name, circuit.clone());
        Ok(circuit)
    }

    /// Attach a custom guard predicate to a member, checked in addition to
    /// its ordinary dependency guard by [`Self::dependencies_met`].
    pub fn guard_with<F>(&self, member_name: impl Into<String>, predicate: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.guards.insert(member_name.into(), Arc::new(predicate));
    }

    /// Look up a member by its bare (unqualified) name.
    pub fn get(&self, member_name: &str) -> Option<Arc<Circuit>> {
        self.members.get(member_name).map(|entry| entry.clone())
    }

    /// Every member's current state, keyed by bare member name (§4.10
    /// `status`).
    pub fn status(&self) -> HashMap<String, CircuitState> {
        self.members.iter().map(|entry| (entry.key().clone(), entry.value().state())).collect()
    }

    /// `true` if every member is currently `Closed`.
    pub fn all_healthy(&self) -> bool {
        self.members.iter().all(|entry| entry.value().state() == CircuitState::Closed)
    }

    /// `true` if any member is currently `Open`.
    pub fn any_open(&self) -> bool {
        self.members.iter().any(|entry| entry.value().state() == CircuitState::Open)
    }

    /// Force every member open.
    pub fn trip_all(&self) {
        for entry in self.members.iter() {
            entry.value().force_open();
        }
    }

    /// Reset every member, subject to each member's own dependency guard.
    /// Returns the bare names of members whose reset was denied (e.g. an
    /// upstream dependency is still `Open`); a fully successful reset
    /// returns an empty vector.
    pub fn reset_all(&self) -> Vec<String> {
        self.members
            .iter()
            .filter_map(|entry| if entry.value().reset().is_err() { Some(entry.key().clone()) } else { None })
            .collect()
    }

    /// Whether `member_name`'s dependencies (its own configured
    /// `depends_on`, resolved through the process registry, AND this
    /// group's custom guard predicate if one is registered) are currently
    /// met. A member with no registered custom guard and no unmet
    /// dependency is trivially met; an unknown member name is vacuously met.
    pub fn dependencies_met(&self, member_name: &str) -> bool {
        let Some(circuit) = self.get(member_name) else { return true };
        let config_ok = circuit
            .config()
            .dependent_circuits
            .iter()
            .all(|dep| registry::lookup(dep).map(|c| c.state() != CircuitState::Open).unwrap_or(true));
        let guard_ok = self.guards.get(member_name).map(|g| g()).unwrap_or(true);
        config_ok && guard_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CircuitError;

    #[test]
    fn members_register_under_qualified_names() {
        registry::clear();
        let group = CircuitGroup::new("payments");
        let circuit = group.circuit("charge", Vec::<String>::new(), |b| b).unwrap();
        assert_eq!(circuit.name(), "payments.charge");
        assert!(registry::lookup("payments.charge").is_some());
    }

    #[test]
    fn shared_defaults_apply_to_every_member() {
        registry::clear();
        let group = CircuitGroup::new("grp-defaults").with_defaults(|b| b.failure_threshold(1));
        let circuit = group.circuit("a", Vec::<String>::new(), |b| b).unwrap();
        assert!(matches!(circuit.config().trip_mode, crate::config::TripMode::Count { failure_threshold: 1 }));
    }

    #[tokio::test]
    async fn status_and_health_reflect_member_state() {
        registry::clear();
        let group = CircuitGroup::new("grp-health").with_defaults(|b| b.failure_threshold(1));
        let a = group.circuit("a", Vec::<String>::new(), |b| b).unwrap();
        let _b = group.circuit("b", Vec::<String>::new(), |b| b).unwrap();
        assert!(group.all_healthy());
        assert!(!group.any_open());

        let _ = a.call(|| async { Err::<(), _>(anyhow::anyhow!("boom")) }).await;
        assert!(!group.all_healthy());
        assert!(group.any_open());
        assert_eq!(group.status().get("a"), Some(&CircuitState::Open));
    }

    #[test]
    fn bare_intra_group_dependency_names_are_qualified() {
        registry::clear();
        let group = CircuitGroup::new("grp-deps");
        let upstream = group.circuit("upstream", Vec::<String>::new(), |b| b.failure_threshold(1)).unwrap();
        let downstream = group.circuit("downstream", ["upstream"], |b| b).unwrap();
        assert_eq!(downstream.config().dependent_circuits, vec!["grp-deps.upstream".to_string()]);

        upstream.force_open();
        assert!(!group.dependencies_met("downstream"));
        let denied = group.reset_all();
        assert!(denied.contains(&"downstream".to_string()));
    }

    #[test]
    fn custom_guard_predicate_gates_dependencies_met() {
        registry::clear();
        let group = CircuitGroup::new("grp-guard");
        let _member = group.circuit("gated", Vec::<String>::new(), |b| b).unwrap();
        assert!(group.dependencies_met("gated"));
        group.guard_with("gated", || false);
        assert!(!group.dependencies_met("gated"));
    }

    #[test]
    fn trip_all_force_opens_every_member() {
        registry::clear();
        let group = CircuitGroup::new("grp-trip");
        let _a = group.circuit("a", Vec::<String>::new(), |b| b).unwrap();
        let _b = group.circuit("b", Vec::<String>::new(), |b| b).unwrap();
        group.trip_all();
        assert!(group.status().values().all(|s| *s == CircuitState::Open));
    }

    #[test]
    fn reset_all_reports_members_with_no_failure() {
        registry::clear();
        let group = CircuitGroup::new("grp-reset-clean");
        let _a = group.circuit("a", Vec::<String>::new(), |b| b).unwrap();
        let denied = group.reset_all();
        assert!(denied.is_empty());
    }

    #[test]
    fn member_reset_is_denied_while_intra_group_dependency_is_open() {
        registry::clear();
        let group = CircuitGroup::new("grp-err");
        let upstream = group.circuit("u", Vec::<String>::new(), |b| b.failure_threshold(1)).unwrap();
        let _downstream = group.circuit("d", ["u"], |b| b).unwrap();
        upstream.force_open();
        let err = group.get("d").unwrap().reset().unwrap_err();
        assert!(matches!(err, CircuitError::DependencyUnmet { .. }));
    }
}
