//! Process-global circuit directory, keyed by name (§4.7).
//!
//! Circuits are looked up by name rather than held as owning references so
//! that dependency graphs (`cascades_to` / `depends_on`) can name each other
//! freely without creating reference cycles. Entries are `Weak`: once every
//! `Arc<Circuit>` a caller holds is dropped, the circuit disappears from
//! lookups instead of being pinned alive by the registry itself.
//!
//! A weak-valued **multi-map**, per §3 Data Model: two circuits may share a
//! name (most commonly a short-lived old instance still draining in-flight
//! calls while its replacement has already been constructed), and `find`
//! resolves to "the first live circuit under that name" rather than
//! silently severing the still-alive older one the way a single-valued map
//! keyed by name would.

use crate::circuit::Circuit;
use crate::error::Result;
use crate::event::CircuitState;
use dashmap::{DashMap, DashSet};
use once_cell::sync::Lazy;
use std::sync::{Arc, Weak};

static REGISTRY: Lazy<DashMap<String, Vec<Weak<Circuit>>>> = Lazy::new(DashMap::new);

/// Names registered via [`crate::template::dynamic_circuit`] with
/// `scope=global` (§4.11). Tracked separately from `REGISTRY` itself so
/// `dynamic_circuit_names` can be answered without conflating
/// template-spawned circuits with ordinarily-constructed ones.
static DYNAMIC_NAMES: Lazy<DashSet<String>> = Lazy::new(DashSet::new);

/// Register the circuit under its own name, appending to any existing
/// entries sharing that name rather than replacing them (§3: multi-map).
pub(crate) fn register(circuit: Arc<Circuit>) {
    REGISTRY.entry(circuit.name().to_string()).or_default().push(Arc::downgrade(&circuit));
}

/// Mark `name` as having been created by [`crate::template::dynamic_circuit`]
/// with global scope.
pub(crate) fn mark_dynamic(name: &str) {
    DYNAMIC_NAMES.insert(name.to_string());
}

/// Resolve a circuit by name: the first still-alive circuit registered under
/// `name`, in registration order (§3: "`find(name)` returns the first live
/// circuit under that name").
pub fn lookup(name: &str) -> Option<Arc<Circuit>> {
    REGISTRY.get(name).and_then(|entries| entries.iter().find_map(Weak::upgrade))
}

/// Resolve a circuit by name. Alias of [`lookup`] matching the §4.7
/// `find(name)` operation name.
pub fn find(name: &str) -> Option<Arc<Circuit>> {
    lookup(name)
}

/// Every currently-alive registered circuit, across every name (including
/// every still-alive circuit sharing a name with another).
pub fn all() -> Vec<Arc<Circuit>> {
    REGISTRY.iter().flat_map(|entries| entries.value().iter().filter_map(Weak::upgrade).collect::<Vec<_>>()).collect()
}

/// Every currently-alive registered circuit. Alias of [`all`] matching the
/// §4.7 `all_circuits` operation name.
pub fn all_circuits() -> Vec<Arc<Circuit>> {
    all()
}

/// Names of circuits created through `dynamic_circuit(..., scope: Global)`
/// that are still alive (§4.7 `dynamic_circuit_names`).
pub fn dynamic_circuit_names() -> Vec<String> {
    DYNAMIC_NAMES
        .iter()
        .map(|entry| entry.key().clone())
        .filter(|name| REGISTRY.get(name).map(|e| e.iter().any(|w| w.upgrade().is_some())).unwrap_or(false))
        .collect()
}

/// Force-open the named circuit, if it is still alive. No-op (returns
/// `false`) if the name is not currently registered.
pub fn force_open(name: &str) -> bool {
    match lookup(name) {
        Some(circuit) => {
            circuit.force_open();
            true
        }
        None => false,
    }
}

/// Manually close the named circuit, if it is still alive, subject to its
/// dependency guard (§4.8). No-op (`Ok(())`) if the name is not registered.
pub fn force_close(name: &str) -> Result<()> {
    match lookup(name) {
        Some(circuit) => circuit.reset(),
        None => Ok(()),
    }
}

/// Alias of [`force_close`] matching the §4.7 `reset(name)` operation name.
pub fn reset(name: &str) -> Result<()> {
    force_close(name)
}

/// Drop every entry, both live circuits and dynamic-name bookkeeping.
/// Intended for test isolation between cases that use shared circuit names.
pub fn clear() {
    REGISTRY.clear();
    DYNAMIC_NAMES.clear();
}

/// Explicitly remove every circuit registered under `name`, whether or not
/// they are still alive. Global-scope dynamic circuits (§3, §4.11) have no
/// owning instance to drop them when no longer needed, so this is the only
/// way to reclaim one ahead of process exit. Returns `true` if any entry was
/// present and removed.
pub fn remove(name: &str) -> bool {
    let had_entry = REGISTRY.remove(name).is_some();
    DYNAMIC_NAMES.remove(name);
    had_entry
}

/// Drop entries whose circuit has already been collected, and forget
/// dynamic-name bookkeeping for names no longer registered at all. Returns
/// the number of dead entries removed. Enumeration (`all`, `find`) already
/// filters dead entries transparently; this exists so long-lived processes
/// can reclaim the `DashMap`/`DashSet` slots themselves instead of only ever
/// growing (§4.7 `cleanup_dead_references`).
pub fn cleanup_dead_references() -> usize {
    let mut removed = 0;
    let empty_names: Vec<String> = REGISTRY
        .iter_mut()
        .map(|mut entries| {
            let before = entries.value().len();
            entries.value_mut().retain(|w| w.upgrade().is_some());
            removed += before - entries.value().len();
            (entries.key().clone(), entries.value().is_empty())
        })
        .filter(|(_, empty)| *empty)
        .map(|(name, _)| name)
        .collect();
    for name in &empty_names {
        REGISTRY.remove(name);
    }
    DYNAMIC_NAMES.retain(|name| REGISTRY.contains_key(name));
    removed
}

/// A point-in-time snapshot of one circuit's observable status, as returned
/// by [`all_stats`].
#[derive(Debug, Clone)]
pub struct CircuitStats {
    /// Circuit name.
    pub name: String,
    /// Current state (after advancing Open -> HalfOpen if due).
    pub state: CircuitState,
    /// Current bulkhead occupancy, if this circuit has one configured.
    pub in_flight: Option<u32>,
}

/// A snapshot of every currently-alive registered circuit's status (§4.7
/// `all_stats`).
pub fn all_stats() -> Vec<CircuitStats> {
    all()
        .into_iter()
        .map(|circuit| CircuitStats { name: circuit.name().to_string(), state: circuit.state(), in_flight: circuit.in_flight() })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBuilder;

    #[test]
    fn lookup_resolves_live_circuits_by_name() {
        clear();
        let config = CircuitBuilder::new("registry-test-a").build_config().unwrap();
        let circuit = Circuit::new(config);
        assert!(lookup("registry-test-a").is_some());
        drop(circuit);
        assert!(lookup("registry-test-a").is_none());
    }

    #[test]
    fn first_live_registration_wins_lookup_until_it_drops() {
        clear();
        let first = Circuit::new(CircuitBuilder::new("registry-test-b").build_config().unwrap());
        let second = Circuit::new(CircuitBuilder::new("registry-test-b").build_config().unwrap());
        assert!(Arc::ptr_eq(&lookup("registry-test-b").unwrap(), &first));
        assert_eq!(all().iter().filter(|c| c.name() == "registry-test-b").count(), 2);

        drop(first);
        assert!(Arc::ptr_eq(&lookup("registry-test-b").unwrap(), &second));
    }

    #[test]
    fn force_open_and_reset_roundtrip_by_name() {
        clear();
        let circuit = Circuit::new(CircuitBuilder::new("registry-test-c").build_config().unwrap());
        assert!(force_open("registry-test-c"));
        assert_eq!(circuit.state(), CircuitState::Open);
        reset("registry-test-c").unwrap();
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[test]
    fn force_open_on_unknown_name_is_a_harmless_no_op() {
        clear();
        assert!(!force_open("registry-test-does-not-exist"));
    }

    #[test]
    fn cleanup_dead_references_compacts_the_map() {
        clear();
        let circuit = Circuit::new(CircuitBuilder::new("registry-test-d").build_config().unwrap());
        drop(circuit);
        assert_eq!(cleanup_dead_references(), 1);
        assert_eq!(cleanup_dead_references(), 0);
    }

    #[test]
    fn dynamic_names_filtered_to_live_entries() {
        clear();
        let circuit = Circuit::new(CircuitBuilder::new("registry-test-e").build_config().unwrap());
        mark_dynamic("registry-test-e");
        assert_eq!(dynamic_circuit_names(), vec!["registry-test-e".to_string()]);
        drop(circuit);
        assert!(dynamic_circuit_names().is_empty());
    }

    #[test]
    fn remove_drops_a_global_dynamic_circuit_ahead_of_owner_teardown() {
        clear();
        let circuit = Circuit::new(CircuitBuilder::new("registry-test-h").build_config().unwrap());
        mark_dynamic("registry-test-h");
        assert!(remove("registry-test-h"));
        assert!(lookup("registry-test-h").is_none());
        assert!(dynamic_circuit_names().is_empty());
        drop(circuit);
        assert!(!remove("registry-test-h"));
    }

    #[test]
    fn all_stats_reports_every_live_circuit() {
        clear();
        let _a = Circuit::new(CircuitBuilder::new("registry-test-f").build_config().unwrap());
        let _b = Circuit::new(CircuitBuilder::new("registry-test-g").max_concurrent(3).build_config().unwrap());
        let mut names: Vec<String> = all_stats().into_iter().map(|s| s.name).collect();
        names.sort();
        assert_eq!(names, vec!["registry-test-f".to_string(), "registry-test-g".to_string()]);
    }
}
