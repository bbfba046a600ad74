//! The policy resolver.
//!
//! Joins the active-policy match events with local endpoint state to compute
//! each endpoint's ordered list of applicable policies. The [`PolicySorter`]
//! owns the globally sorted "default" tier and re-sorts lazily; the resolver
//! filters the sorted tier down to each endpoint's matching set.

use crate::{dispatch::UpdateHandler, multidict::MultiMap, SharedCallbacks};
use ahash::AHashMap as HashMap;
use std::{collections::BTreeSet, sync::Arc};
use warden_policy_core::model::{Endpoint, EndpointKey, Policy, PolicyKey, Update};

/// A policy together with its key, in tier order.
#[derive(Clone, Debug, PartialEq)]
pub struct PolKV {
    pub key: PolicyKey,
    pub value: Arc<Policy>,
}

/// One tier's ordered policies as applied to a single endpoint. The
/// sequencer splits tracked from do-not-track policies when it renders
/// these for the dataplane.
#[derive(Clone, Debug, PartialEq)]
pub struct TierInfo {
    pub name: String,
    pub ordered_policies: Vec<PolKV>,
}

/// Owns the globally sorted policy list for the single "default" tier.
///
/// Sorted by `(order asc, name asc)`; a policy with no order sorts after
/// every numbered one. The sort is recomputed lazily after any addition,
/// deletion or order change.
#[derive(Default)]
pub struct PolicySorter {
    policies: HashMap<PolicyKey, Arc<Policy>>,
    sorted: Vec<PolKV>,
    dirty: bool,
}

// === impl PolicySorter ===

impl PolicySorter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a policy update; returns whether the tier's order changed.
    pub fn on_update(&mut self, key: &PolicyKey, value: Option<&Arc<Policy>>) -> bool {
        match value {
            Some(policy) => {
                let order_changed = match self.policies.get(key) {
                    None => true,
                    Some(old) => !same_order(old.order, policy.order),
                };
                self.policies.insert(key.clone(), policy.clone());
                if order_changed {
                    self.dirty = true;
                }
                order_changed
            }
            None => {
                let removed = self.policies.remove(key).is_some();
                if removed {
                    self.dirty = true;
                }
                removed
            }
        }
    }

    pub fn sorted(&mut self) -> &[PolKV] {
        if self.dirty {
            let mut sorted: Vec<PolKV> = self
                .policies
                .iter()
                .map(|(key, value)| PolKV {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect();
            sorted.sort_by(|a, b| {
                match (a.value.order, b.value.order) {
                    (None, None) => std::cmp::Ordering::Equal,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (Some(x), Some(y)) => x.total_cmp(&y),
                }
                .then_with(|| a.key.name.cmp(&b.key.name))
            });
            tracing::debug!(
                policies = ?sorted.iter().map(|kv| kv.key.name.as_str()).collect::<Vec<_>>(),
                "Re-sorted tier"
            );
            self.sorted = sorted;
            self.dirty = false;
        }
        &self.sorted
    }
}

fn same_order(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => x.total_cmp(&y).is_eq(),
        _ => false,
    }
}

pub struct PolicyResolver {
    callbacks: SharedCallbacks,
    sorter: PolicySorter,

    policy_id_to_endpoints: MultiMap<PolicyKey, EndpointKey>,
    endpoint_id_to_policies: MultiMap<EndpointKey, PolicyKey>,
    endpoints: HashMap<EndpointKey, Endpoint>,

    dirty_endpoints: BTreeSet<EndpointKey>,
    /// What was last emitted per endpoint, to avoid redundant updates.
    last_emitted: HashMap<EndpointKey, (Endpoint, Vec<PolKV>)>,
}

// === impl PolicyResolver ===

impl PolicyResolver {
    pub fn new(callbacks: SharedCallbacks) -> Self {
        Self {
            callbacks,
            sorter: PolicySorter::new(),
            policy_id_to_endpoints: MultiMap::new(),
            endpoint_id_to_policies: MultiMap::new(),
            endpoints: HashMap::default(),
            dirty_endpoints: BTreeSet::new(),
            last_emitted: HashMap::default(),
        }
    }

    fn update_endpoint(&mut self, key: EndpointKey, endpoint: Option<Endpoint>) {
        match endpoint {
            Some(endpoint) => {
                self.endpoints.insert(key.clone(), endpoint);
                self.dirty_endpoints.insert(key);
            }
            None => {
                self.endpoints.remove(&key);
                // Matches are cleaned up by the active-rules calculator's
                // stop events; emit the deletion now.
                self.dirty_endpoints.insert(key);
            }
        }
        self.flush_dirty();
    }

    fn send_endpoint_update(&mut self, key: &EndpointKey) {
        let endpoint = match self.endpoints.get(key) {
            Some(endpoint) => endpoint.clone(),
            None => {
                // Only emit a tombstone for endpoints we've actually
                // described downstream.
                if self.last_emitted.remove(key).is_some() {
                    self.callbacks
                        .borrow_mut()
                        .on_endpoint_tier_update(key, None, &[]);
                }
                return;
            }
        };
        let matching: BTreeSet<PolicyKey> =
            self.endpoint_id_to_policies.get(key).cloned().collect();
        let ordered_policies: Vec<PolKV> = self
            .sorter
            .sorted()
            .iter()
            .filter(|kv| matching.contains(&kv.key))
            .cloned()
            .collect();

        let current = (endpoint, ordered_policies);
        if self.last_emitted.get(key) == Some(&current) {
            return;
        }
        tracing::debug!(
            ?key,
            policies = current.1.len(),
            "Endpoint tier update"
        );
        let tiers = [TierInfo {
            name: "default".to_string(),
            ordered_policies: current.1.clone(),
        }];
        self.callbacks
            .borrow_mut()
            .on_endpoint_tier_update(key, Some(&current.0), &tiers);
        self.last_emitted.insert(key.clone(), current);
    }

    fn flush_dirty(&mut self) {
        let dirty = std::mem::take(&mut self.dirty_endpoints);
        for key in dirty {
            self.send_endpoint_update(&key);
        }
    }
}

impl crate::active_rules::PolicyMatchListener for PolicyResolver {
    fn on_policy_match_started(&mut self, policy: &PolicyKey, endpoint: &EndpointKey) {
        tracing::debug!(policy = %policy.name, ?endpoint, "Policy match started");
        self.policy_id_to_endpoints
            .insert(policy.clone(), endpoint.clone());
        self.endpoint_id_to_policies
            .insert(endpoint.clone(), policy.clone());
        self.dirty_endpoints.insert(endpoint.clone());
        self.flush_dirty();
    }

    fn on_policy_match_stopped(&mut self, policy: &PolicyKey, endpoint: &EndpointKey) {
        tracing::debug!(policy = %policy.name, ?endpoint, "Policy match stopped");
        self.policy_id_to_endpoints.remove(policy, endpoint);
        self.endpoint_id_to_policies.remove(endpoint, policy);
        self.dirty_endpoints.insert(endpoint.clone());
        self.flush_dirty();
    }
}

impl UpdateHandler for PolicyResolver {
    fn on_update(&mut self, update: &Update) -> bool {
        match update {
            Update::Policy(key, value) => {
                if self.sorter.on_update(key, value.as_ref()) {
                    // Ordering may have changed for every endpoint the
                    // policy applies (or applied) to.
                    let affected: Vec<EndpointKey> = self
                        .endpoints
                        .keys()
                        .filter(|&ep| self.endpoint_id_to_policies.contains(ep, key))
                        .cloned()
                        .collect();
                    self.dirty_endpoints.extend(affected);
                    self.flush_dirty();
                }
            }
            Update::WorkloadEndpoint(id, value) => {
                let endpoint = value.as_ref().map(|ep| Endpoint::Workload(ep.clone()));
                self.update_endpoint(EndpointKey::Workload(id.clone()), endpoint);
            }
            Update::HostEndpoint(id, value) => {
                let endpoint = value.as_ref().map(|ep| Endpoint::Host(ep.clone()));
                self.update_endpoint(EndpointKey::Host(id.clone()), endpoint);
            }
            _ => {}
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{active_rules::PolicyMatchListener, testutil::RecordingCallbacks};
    use std::{cell::RefCell, rc::Rc};
    use warden_policy_core::Selector;

    fn policy(order: Option<f64>) -> Arc<Policy> {
        Arc::new(Policy {
            order,
            selector: Selector::default(),
            in_rules: vec![],
            out_rules: vec![],
            do_not_track: false,
        })
    }

    fn key(name: &str) -> PolicyKey {
        PolicyKey {
            name: name.to_string(),
        }
    }

    #[test]
    fn sorter_orders_by_order_then_name_with_none_last() {
        let mut sorter = PolicySorter::new();
        sorter.on_update(&key("c"), Some(&policy(None)));
        sorter.on_update(&key("b"), Some(&policy(Some(10.0))));
        sorter.on_update(&key("a"), Some(&policy(Some(10.0))));
        sorter.on_update(&key("d"), Some(&policy(Some(5.0))));

        let names: Vec<&str> = sorter.sorted().iter().map(|kv| kv.key.name.as_str()).collect();
        assert_eq!(names, ["d", "a", "b", "c"]);
    }

    #[test]
    fn sorter_is_clean_until_an_order_changes() {
        let mut sorter = PolicySorter::new();
        assert!(sorter.on_update(&key("a"), Some(&policy(Some(10.0)))));
        // Same order: value stored but no re-sort needed.
        assert!(!sorter.on_update(&key("a"), Some(&policy(Some(10.0)))));
        assert!(sorter.on_update(&key("a"), Some(&policy(Some(5.0)))));
        assert!(sorter.on_update(&key("a"), None));
        assert!(!sorter.on_update(&key("a"), None));
    }

    #[test]
    fn endpoint_updates_carry_matching_policies_in_tier_order() {
        let callbacks = Rc::new(RefCell::new(RecordingCallbacks::default()));
        let mut resolver = PolicyResolver::new(callbacks.clone());
        let endpoint = crate::testutil::endpoint_key("w1");

        resolver.on_update(&Update::Policy(key("a"), Some(policy(Some(10.0)))));
        resolver.on_update(&Update::Policy(key("b"), Some(policy(Some(5.0)))));
        resolver.on_update(&crate::testutil::local_workload_update("w1"));

        resolver.on_policy_match_started(&key("a"), &endpoint);
        resolver.on_policy_match_started(&key("b"), &endpoint);

        let updates = &callbacks.borrow().tier_updates;
        let last = updates.last().unwrap();
        assert_eq!(last.0, endpoint);
        assert_eq!(
            last.1.as_ref().unwrap(),
            &vec![("b".to_string(), false), ("a".to_string(), false)]
        );
    }

    #[test]
    fn order_change_re_emits_affected_endpoints() {
        let callbacks = Rc::new(RefCell::new(RecordingCallbacks::default()));
        let mut resolver = PolicyResolver::new(callbacks.clone());
        let endpoint = crate::testutil::endpoint_key("w1");

        resolver.on_update(&Update::Policy(key("a"), Some(policy(Some(10.0)))));
        resolver.on_update(&Update::Policy(key("b"), Some(policy(Some(20.0)))));
        resolver.on_update(&crate::testutil::local_workload_update("w1"));
        resolver.on_policy_match_started(&key("a"), &endpoint);
        resolver.on_policy_match_started(&key("b"), &endpoint);

        // B jumps ahead of A.
        resolver.on_update(&Update::Policy(key("b"), Some(policy(Some(5.0)))));
        let updates = &callbacks.borrow().tier_updates;
        assert_eq!(
            updates.last().unwrap().1.as_ref().unwrap(),
            &vec![("b".to_string(), false), ("a".to_string(), false)]
        );
    }

    #[test]
    fn deletion_emits_a_tombstone() {
        let callbacks = Rc::new(RefCell::new(RecordingCallbacks::default()));
        let mut resolver = PolicyResolver::new(callbacks.clone());
        let endpoint = crate::testutil::endpoint_key("w1");

        resolver.on_update(&crate::testutil::local_workload_update("w1"));
        resolver.on_update(&crate::testutil::local_workload_delete("w1"));

        let updates = &callbacks.borrow().tier_updates;
        assert_eq!(updates.last().unwrap(), &(endpoint, None));
    }
}
