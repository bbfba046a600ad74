//! The active rules calculator.
//!
//! Decides which policies and profiles are active on this host: a policy is
//! active while its selector matches at least one local endpoint, a profile
//! while at least one local endpoint references it by ID. Transitions are
//! forwarded to the rule scanner (which materialises the rules' IP set
//! dependencies) and policy matches to the policy resolver.

use crate::{
    dispatch::UpdateHandler,
    label_index::{InheritIndex, MatchListener},
    multidict::MultiMap,
    rule_scanner::RuleScanner,
};
use ahash::AHashMap as HashMap;
use std::{cell::RefCell, rc::Rc, sync::Arc};
use warden_policy_core::model::{
    Endpoint, EndpointKey, Policy, PolicyKey, ProfileRules, Update,
};

/// Told about every policy↔local-endpoint match transition.
pub trait PolicyMatchListener {
    fn on_policy_match_started(&mut self, policy: &PolicyKey, endpoint: &EndpointKey);
    fn on_policy_match_stopped(&mut self, policy: &PolicyKey, endpoint: &EndpointKey);
}

pub struct ActiveRulesCalculator {
    all_policies: HashMap<PolicyKey, Arc<Policy>>,
    all_profile_rules: HashMap<String, Arc<ProfileRules>>,

    /// Which local endpoints match each policy's selector.
    policy_id_to_endpoints: MultiMap<PolicyKey, EndpointKey>,
    /// Which local endpoints reference each profile.
    profile_id_to_endpoints: MultiMap<String, EndpointKey>,
    profile_ids_by_endpoint: HashMap<EndpointKey, Vec<String>>,

    /// Matches policy selectors against local endpoints (with label
    /// inheritance from profiles). Selector IDs are policy names.
    label_index: InheritIndex,

    rule_scanner: Rc<RefCell<RuleScanner>>,
    policy_match_listener: Rc<RefCell<dyn PolicyMatchListener>>,
}

/// Buffers the label index's match transitions so they can be applied after
/// the index borrow ends.
#[derive(Default)]
struct MatchBuffer {
    events: Vec<(bool, String, EndpointKey)>,
}

impl MatchListener for MatchBuffer {
    fn match_started(&mut self, sel_id: &str, item: &EndpointKey) {
        self.events.push((true, sel_id.to_string(), item.clone()));
    }

    fn match_stopped(&mut self, sel_id: &str, item: &EndpointKey) {
        self.events.push((false, sel_id.to_string(), item.clone()));
    }
}

// === impl ActiveRulesCalculator ===

impl ActiveRulesCalculator {
    pub fn new(
        rule_scanner: Rc<RefCell<RuleScanner>>,
        policy_match_listener: Rc<RefCell<dyn PolicyMatchListener>>,
    ) -> Self {
        Self {
            all_policies: HashMap::default(),
            all_profile_rules: HashMap::default(),
            policy_id_to_endpoints: MultiMap::new(),
            profile_id_to_endpoints: MultiMap::new(),
            profile_ids_by_endpoint: HashMap::default(),
            label_index: InheritIndex::new(),
            rule_scanner,
            policy_match_listener,
        }
    }

    fn update_endpoint(&mut self, key: EndpointKey, endpoint: Option<&Endpoint>) {
        // Track profile references first so profiles activate before any
        // policy matches are reported for the endpoint.
        let new_profiles = endpoint
            .map(|ep| ep.profile_ids().to_vec())
            .unwrap_or_default();
        self.update_profile_refs(&key, new_profiles.clone());

        let mut buffer = MatchBuffer::default();
        match endpoint {
            Some(ep) => {
                self.label_index.update_labels(
                    key,
                    ep.labels().clone(),
                    new_profiles,
                    &mut buffer,
                );
            }
            None => self.label_index.delete_item(&key, &mut buffer),
        }
        self.apply_matches(buffer);
    }

    fn update_profile_refs(&mut self, key: &EndpointKey, new_profiles: Vec<String>) {
        let old_profiles = self
            .profile_ids_by_endpoint
            .remove(key)
            .unwrap_or_default();

        for profile in new_profiles.iter().filter(|&p| !old_profiles.contains(p)) {
            self.profile_id_to_endpoints
                .insert(profile.clone(), key.clone());
            if self.profile_id_to_endpoints.num_values(profile) == 1 {
                tracing::debug!(%profile, "Profile now referenced locally");
                if let Some(rules) = self.all_profile_rules.get(profile) {
                    let rules = rules.clone();
                    self.rule_scanner
                        .borrow_mut()
                        .on_profile_active(profile, &rules);
                }
            }
        }
        for profile in old_profiles.iter().filter(|&p| !new_profiles.contains(p)) {
            self.profile_id_to_endpoints.remove(profile, key);
            if !self.profile_id_to_endpoints.contains_key(profile) {
                tracing::debug!(%profile, "Profile no longer referenced locally");
                if self.all_profile_rules.contains_key(profile) {
                    self.rule_scanner.borrow_mut().on_profile_inactive(profile);
                }
            }
        }

        if !new_profiles.is_empty() {
            self.profile_ids_by_endpoint.insert(key.clone(), new_profiles);
        }
    }

    fn update_policy(&mut self, key: PolicyKey, policy: Option<Arc<Policy>>) {
        let mut buffer = MatchBuffer::default();
        match policy {
            Some(policy) => {
                let valid = policy
                    .selector
                    .validate()
                    .and_then(|()| {
                        for rule in policy.in_rules.iter().chain(policy.out_rules.iter()) {
                            for sel in rule.selectors() {
                                sel.validate()?;
                            }
                        }
                        Ok(())
                    });
                if let Err(error) = valid {
                    // Treat the policy as matching nothing rather than
                    // programming a partial rule set.
                    tracing::warn!(policy = %key.name, %error, "Skipping policy with invalid selector");
                    self.label_index.delete_selector(&key.name, &mut buffer);
                    self.all_policies.remove(&key);
                } else {
                    let changed = self.all_policies.get(&key) != Some(&policy);
                    self.all_policies.insert(key.clone(), policy.clone());
                    if changed && self.policy_id_to_endpoints.contains_key(&key) {
                        // Already active; push the updated rules through.
                        self.rule_scanner
                            .borrow_mut()
                            .on_policy_active(&key, &policy);
                    }
                    self.label_index
                        .update_selector(&key.name, policy.selector.clone(), &mut buffer);
                }
            }
            None => {
                tracing::debug!(policy = %key.name, "Policy deleted");
                self.label_index.delete_selector(&key.name, &mut buffer);
                self.all_policies.remove(&key);
            }
        }
        self.apply_matches(buffer);
    }

    fn update_profile_rules(&mut self, profile: &str, rules: Option<Arc<ProfileRules>>) {
        let referenced = self.profile_id_to_endpoints.contains_key(&profile.to_string());
        match rules {
            Some(rules) => {
                let changed = self.all_profile_rules.get(profile) != Some(&rules);
                self.all_profile_rules
                    .insert(profile.to_string(), rules.clone());
                if referenced && changed {
                    self.rule_scanner
                        .borrow_mut()
                        .on_profile_active(profile, &rules);
                }
            }
            None => {
                if self.all_profile_rules.remove(profile).is_some() && referenced {
                    self.rule_scanner.borrow_mut().on_profile_inactive(profile);
                }
            }
        }
    }

    fn apply_matches(&mut self, buffer: MatchBuffer) {
        for (started, policy_name, endpoint) in buffer.events {
            let key = PolicyKey { name: policy_name };
            if started {
                self.policy_id_to_endpoints.insert(key.clone(), endpoint.clone());
                if self.policy_id_to_endpoints.num_values(&key) == 1 {
                    tracing::debug!(policy = %key.name, "Policy now active");
                    if let Some(policy) = self.all_policies.get(&key) {
                        let policy = policy.clone();
                        self.rule_scanner
                            .borrow_mut()
                            .on_policy_active(&key, &policy);
                    }
                }
                self.policy_match_listener
                    .borrow_mut()
                    .on_policy_match_started(&key, &endpoint);
            } else {
                self.policy_id_to_endpoints.remove(&key, &endpoint);
                self.policy_match_listener
                    .borrow_mut()
                    .on_policy_match_stopped(&key, &endpoint);
                if !self.policy_id_to_endpoints.contains_key(&key) {
                    tracing::debug!(policy = %key.name, "Policy now inactive");
                    self.rule_scanner.borrow_mut().on_policy_inactive(&key);
                }
            }
        }
    }
}

impl UpdateHandler for ActiveRulesCalculator {
    fn on_update(&mut self, update: &Update) -> bool {
        match update {
            Update::WorkloadEndpoint(id, value) => {
                let endpoint = value.as_ref().map(|ep| Endpoint::Workload(ep.clone()));
                self.update_endpoint(EndpointKey::Workload(id.clone()), endpoint.as_ref());
            }
            Update::HostEndpoint(id, value) => {
                let endpoint = value.as_ref().map(|ep| Endpoint::Host(ep.clone()));
                self.update_endpoint(EndpointKey::Host(id.clone()), endpoint.as_ref());
            }
            Update::Policy(key, value) => self.update_policy(key.clone(), value.clone()),
            Update::ProfileRules(name, value) => self.update_profile_rules(name, value.clone()),
            Update::ProfileLabels(name, value) => {
                let mut buffer = MatchBuffer::default();
                self.label_index
                    .update_parent_labels(name, value.clone(), &mut buffer);
                self.apply_matches(buffer);
            }
            _ => {}
        }
        false
    }
}
