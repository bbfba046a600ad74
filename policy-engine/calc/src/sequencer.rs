//! The event sequencer.
//!
//! Buffers and coalesces updates from the calculation graph, then flushes
//! them in a dependency-safe order: a downstream consumer never sees a
//! message that references an object it hasn't been told about, and objects
//! stay alive until their last referrer is gone.
//!
//! An add followed by a delete before the flush cancels to nothing; a delete
//! followed by a re-add collapses to a single update. The "sent" sets mirror
//! what the downstream has been told exists; feeding the sequencer a
//! transition that contradicts them means the graph is no longer a function
//! of its inputs, which is unrecoverable, so those checks panic.

use crate::{
    config::{ConfigResolver, ConfigSource},
    multidict::MultiMap,
    resolver::TierInfo,
    ConfigCallbacks, EndpointCallbacks, IpSetCallbacks, PassthruCallbacks, RuleCallbacks,
};
use anyhow::{Context, Result};
use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
    sync::Arc,
};
use warden_policy_core::{
    model::{Endpoint, EndpointKey, IpPool, PolicyKey},
    proto::{self, DataplaneMessage, IpamPool, PolicyId, TierInfo as ProtoTierInfo},
    rules::ParsedRules,
    IpNet,
};

pub struct EventSequencer {
    config: Box<dyn ConfigResolver>,

    pending_added_ip_sets: BTreeSet<String>,
    pending_removed_ip_sets: BTreeSet<String>,
    pending_added_ips: MultiMap<String, IpAddr>,
    pending_removed_ips: MultiMap<String, IpAddr>,
    pending_policy_updates: BTreeMap<PolicyKey, Arc<ParsedRules>>,
    pending_policy_deletes: BTreeSet<PolicyKey>,
    pending_profile_updates: BTreeMap<String, Arc<ParsedRules>>,
    pending_profile_deletes: BTreeSet<String>,
    pending_endpoint_updates: BTreeMap<EndpointKey, (Endpoint, Vec<TierInfo>)>,
    pending_endpoint_deletes: BTreeSet<EndpointKey>,
    pending_host_ip_updates: BTreeMap<String, IpAddr>,
    pending_host_ip_deletes: BTreeSet<String>,
    pending_ip_pool_updates: BTreeMap<IpNet, Arc<IpPool>>,
    pending_ip_pool_deletes: BTreeSet<IpNet>,
    pending_not_ready: bool,
    pending_global_config: Option<BTreeMap<String, String>>,
    pending_host_config: Option<BTreeMap<String, String>>,

    // What the downstream has been told exists; updated on flush.
    sent_ip_sets: BTreeSet<String>,
    sent_policies: BTreeSet<PolicyKey>,
    sent_profiles: BTreeSet<String>,
    sent_endpoints: BTreeSet<EndpointKey>,
    sent_host_ips: BTreeSet<String>,
    sent_ip_pools: BTreeSet<IpNet>,
}

// === impl EventSequencer ===

impl EventSequencer {
    pub fn new(config: Box<dyn ConfigResolver>) -> Self {
        Self {
            config,
            pending_added_ip_sets: BTreeSet::new(),
            pending_removed_ip_sets: BTreeSet::new(),
            pending_added_ips: MultiMap::new(),
            pending_removed_ips: MultiMap::new(),
            pending_policy_updates: BTreeMap::new(),
            pending_policy_deletes: BTreeSet::new(),
            pending_profile_updates: BTreeMap::new(),
            pending_profile_deletes: BTreeSet::new(),
            pending_endpoint_updates: BTreeMap::new(),
            pending_endpoint_deletes: BTreeSet::new(),
            pending_host_ip_updates: BTreeMap::new(),
            pending_host_ip_deletes: BTreeSet::new(),
            pending_ip_pool_updates: BTreeMap::new(),
            pending_ip_pool_deletes: BTreeSet::new(),
            pending_not_ready: false,
            pending_global_config: None,
            pending_host_config: None,
            sent_ip_sets: BTreeSet::new(),
            sent_policies: BTreeSet::new(),
            sent_profiles: BTreeSet::new(),
            sent_endpoints: BTreeSet::new(),
            sent_host_ips: BTreeSet::new(),
            sent_ip_pools: BTreeSet::new(),
        }
    }

    /// Emits the coalesced delta since the previous flush.
    ///
    /// The order is the engine's public contract: not-ready and config
    /// first (config may restart the process), then additions leaves-first
    /// (IP sets, policies/profiles, endpoints), then removals in reverse,
    /// then the cluster-wide passthrough categories.
    pub fn flush(&mut self, callback: &mut dyn FnMut(DataplaneMessage)) -> Result<()> {
        self.flush_ready_flag(callback);
        self.flush_config_update(callback)?;

        self.flush_added_ip_sets(callback);
        self.flush_ip_set_deltas(callback);
        self.flush_policy_updates(callback);
        self.flush_profile_updates(callback);
        self.flush_endpoint_updates(callback);

        self.flush_endpoint_deletes(callback);
        self.flush_profile_deletes(callback);
        self.flush_policy_deletes(callback);
        self.flush_removed_ip_sets(callback);

        self.flush_host_ip_deletes(callback);
        self.flush_host_ip_updates(callback);
        self.flush_ip_pool_deletes(callback);
        self.flush_ip_pool_updates(callback);
        Ok(())
    }

    fn flush_ready_flag(&mut self, callback: &mut dyn FnMut(DataplaneMessage)) {
        if !self.pending_not_ready {
            return;
        }
        self.pending_not_ready = false;
        callback(DataplaneMessage::DatastoreNotReady);
    }

    fn flush_config_update(&mut self, callback: &mut dyn FnMut(DataplaneMessage)) -> Result<()> {
        let global = match self.pending_global_config.take() {
            Some(global) => global,
            None => return Ok(()),
        };
        let host = self.pending_host_config.take().unwrap_or_default();
        tracing::info!(?global, ?host, "Possible config update");
        let global_changed = self
            .config
            .update_from(&global, ConfigSource::DatastoreGlobal)
            .context("failed to parse global config update")?;
        let host_changed = self
            .config
            .update_from(&host, ConfigSource::DatastorePerHost)
            .context("failed to parse per-host config update")?;
        if global_changed || host_changed {
            let config = self.config.raw_values();
            tracing::warn!(merged = ?config, "Config changed; sending ConfigUpdate");
            callback(DataplaneMessage::ConfigUpdate { config });
        }
        Ok(())
    }

    fn flush_added_ip_sets(&mut self, callback: &mut dyn FnMut(DataplaneMessage)) {
        for set_id in std::mem::take(&mut self.pending_added_ip_sets) {
            tracing::debug!(%set_id, "Flushing added IP set");
            let members: Vec<IpAddr> = self
                .pending_added_ips
                .discard_key(&set_id)
                .into_iter()
                .collect();
            self.pending_removed_ips.discard_key(&set_id);
            callback(DataplaneMessage::IpSetUpdate {
                id: set_id.clone(),
                members,
            });
            self.sent_ip_sets.insert(set_id);
        }
    }

    fn flush_ip_set_deltas(&mut self, callback: &mut dyn FnMut(DataplaneMessage)) {
        let set_ids: Vec<String> = self
            .pending_removed_ips
            .keys()
            .chain(self.pending_added_ips.keys())
            .cloned()
            .collect();
        for set_id in set_ids {
            let added: Vec<IpAddr> = self.pending_added_ips.discard_key(&set_id).into_iter().collect();
            let removed: Vec<IpAddr> = self
                .pending_removed_ips
                .discard_key(&set_id)
                .into_iter()
                .collect();
            if added.is_empty() && removed.is_empty() {
                continue;
            }
            tracing::debug!(%set_id, "Flushing IP set delta");
            callback(DataplaneMessage::IpSetDeltaUpdate {
                id: set_id,
                added_members: added,
                removed_members: removed,
            });
        }
    }

    fn flush_policy_updates(&mut self, callback: &mut dyn FnMut(DataplaneMessage)) {
        for (key, rules) in std::mem::take(&mut self.pending_policy_updates) {
            callback(DataplaneMessage::ActivePolicyUpdate {
                id: PolicyId {
                    tier: "default".to_string(),
                    name: key.name.clone(),
                },
                policy: rules,
            });
            self.sent_policies.insert(key);
        }
    }

    fn flush_policy_deletes(&mut self, callback: &mut dyn FnMut(DataplaneMessage)) {
        for key in std::mem::take(&mut self.pending_policy_deletes) {
            callback(DataplaneMessage::ActivePolicyRemove {
                id: PolicyId {
                    tier: "default".to_string(),
                    name: key.name.clone(),
                },
            });
            self.sent_policies.remove(&key);
        }
    }

    fn flush_profile_updates(&mut self, callback: &mut dyn FnMut(DataplaneMessage)) {
        for (name, rules) in std::mem::take(&mut self.pending_profile_updates) {
            callback(DataplaneMessage::ActiveProfileUpdate {
                id: name.clone(),
                profile: rules,
            });
            self.sent_profiles.insert(name);
        }
    }

    fn flush_profile_deletes(&mut self, callback: &mut dyn FnMut(DataplaneMessage)) {
        for name in std::mem::take(&mut self.pending_profile_deletes) {
            callback(DataplaneMessage::ActiveProfileRemove { id: name.clone() });
            self.sent_profiles.remove(&name);
        }
    }

    fn flush_endpoint_updates(&mut self, callback: &mut dyn FnMut(DataplaneMessage)) {
        for (key, (endpoint, tiers)) in std::mem::take(&mut self.pending_endpoint_updates) {
            let (tracked, untracked) = split_tiers(&tiers);
            match (&key, endpoint) {
                (EndpointKey::Workload(id), Endpoint::Workload(ep)) => {
                    callback(DataplaneMessage::WorkloadEndpointUpdate {
                        id: id.clone(),
                        endpoint: ep,
                        tiers: tracked,
                    });
                }
                (EndpointKey::Host(id), Endpoint::Host(ep)) => {
                    callback(DataplaneMessage::HostEndpointUpdate {
                        id: id.clone(),
                        endpoint: ep,
                        tiers: tracked,
                        untracked_tiers: untracked,
                    });
                }
                _ => unreachable!("endpoint key and value kinds are paired at the input"),
            }
            self.sent_endpoints.insert(key);
        }
    }

    fn flush_endpoint_deletes(&mut self, callback: &mut dyn FnMut(DataplaneMessage)) {
        for key in std::mem::take(&mut self.pending_endpoint_deletes) {
            match &key {
                EndpointKey::Workload(id) => {
                    callback(DataplaneMessage::WorkloadEndpointRemove { id: id.clone() });
                }
                EndpointKey::Host(id) => {
                    callback(DataplaneMessage::HostEndpointRemove { id: id.clone() });
                }
            }
            self.sent_endpoints.remove(&key);
        }
    }

    fn flush_removed_ip_sets(&mut self, callback: &mut dyn FnMut(DataplaneMessage)) {
        for set_id in std::mem::take(&mut self.pending_removed_ip_sets) {
            tracing::debug!(%set_id, "Flushing IP set remove");
            self.pending_added_ips.discard_key(&set_id);
            self.pending_removed_ips.discard_key(&set_id);
            callback(DataplaneMessage::IpSetRemove {
                id: set_id.clone(),
            });
            self.sent_ip_sets.remove(&set_id);
        }
    }

    fn flush_host_ip_updates(&mut self, callback: &mut dyn FnMut(DataplaneMessage)) {
        for (hostname, addr) in std::mem::take(&mut self.pending_host_ip_updates) {
            callback(DataplaneMessage::HostMetadataUpdate {
                hostname: hostname.clone(),
                ipv4_addr: addr,
            });
            self.sent_host_ips.insert(hostname);
        }
    }

    fn flush_host_ip_deletes(&mut self, callback: &mut dyn FnMut(DataplaneMessage)) {
        for hostname in std::mem::take(&mut self.pending_host_ip_deletes) {
            callback(DataplaneMessage::HostMetadataRemove {
                hostname: hostname.clone(),
            });
            self.sent_host_ips.remove(&hostname);
        }
    }

    fn flush_ip_pool_updates(&mut self, callback: &mut dyn FnMut(DataplaneMessage)) {
        for (cidr, pool) in std::mem::take(&mut self.pending_ip_pool_updates) {
            callback(DataplaneMessage::IpamPoolUpdate {
                id: proto::pool_id(&cidr),
                pool: IpamPool {
                    cidr: pool.cidr.to_string(),
                    masquerade: pool.masquerade,
                },
            });
            self.sent_ip_pools.insert(cidr);
        }
    }

    fn flush_ip_pool_deletes(&mut self, callback: &mut dyn FnMut(DataplaneMessage)) {
        for cidr in std::mem::take(&mut self.pending_ip_pool_deletes) {
            callback(DataplaneMessage::IpamPoolRemove {
                id: proto::pool_id(&cidr),
            });
            self.sent_ip_pools.remove(&cidr);
        }
    }
}

impl IpSetCallbacks for EventSequencer {
    fn on_ip_set_added(&mut self, set_id: &str) {
        tracing::debug!(%set_id, "IP set now active");
        if self.sent_ip_sets.contains(set_id) && !self.pending_removed_ip_sets.contains(set_id) {
            panic!("IP set {} added while already sent", set_id);
        }
        self.pending_added_ip_sets.insert(set_id.to_string());
        self.pending_removed_ip_sets.remove(set_id);
        // An add implicitly means the set is empty again.
        self.pending_added_ips.discard_key(&set_id.to_string());
        self.pending_removed_ips.discard_key(&set_id.to_string());
    }

    fn on_ip_set_removed(&mut self, set_id: &str) {
        tracing::debug!(%set_id, "IP set no longer active");
        if !self.sent_ip_sets.contains(set_id) && !self.pending_added_ip_sets.contains(set_id) {
            panic!("IP set remove for unknown set {}", set_id);
        }
        if self.sent_ip_sets.contains(set_id) {
            self.pending_removed_ip_sets.insert(set_id.to_string());
        }
        self.pending_added_ip_sets.remove(set_id);
        self.pending_added_ips.discard_key(&set_id.to_string());
        self.pending_removed_ips.discard_key(&set_id.to_string());
    }

    fn on_ip_added(&mut self, set_id: &str, addr: IpAddr) {
        tracing::debug!(%set_id, %addr, "IP set gained member");
        if !self.sent_ip_sets.contains(set_id) && !self.pending_added_ip_sets.contains(set_id) {
            panic!("IP {} added to unknown IP set {}", addr, set_id);
        }
        if !self.pending_removed_ips.remove(&set_id.to_string(), &addr) {
            self.pending_added_ips.insert(set_id.to_string(), addr);
        }
    }

    fn on_ip_removed(&mut self, set_id: &str, addr: IpAddr) {
        tracing::debug!(%set_id, %addr, "IP set lost member");
        if !self.sent_ip_sets.contains(set_id) && !self.pending_added_ip_sets.contains(set_id) {
            panic!("IP {} removed from unknown IP set {}", addr, set_id);
        }
        if !self.pending_added_ips.remove(&set_id.to_string(), &addr) {
            self.pending_removed_ips.insert(set_id.to_string(), addr);
        }
    }
}

impl RuleCallbacks for EventSequencer {
    fn on_policy_active(&mut self, key: &PolicyKey, rules: Arc<ParsedRules>) {
        self.pending_policy_deletes.remove(key);
        self.pending_policy_updates.insert(key.clone(), rules);
    }

    fn on_policy_inactive(&mut self, key: &PolicyKey) {
        self.pending_policy_updates.remove(key);
        if self.sent_policies.contains(key) {
            self.pending_policy_deletes.insert(key.clone());
        }
    }

    fn on_profile_active(&mut self, profile: &str, rules: Arc<ParsedRules>) {
        self.pending_profile_deletes.remove(profile);
        self.pending_profile_updates
            .insert(profile.to_string(), rules);
    }

    fn on_profile_inactive(&mut self, profile: &str) {
        self.pending_profile_updates.remove(profile);
        if self.sent_profiles.contains(profile) {
            self.pending_profile_deletes.insert(profile.to_string());
        }
    }
}

impl EndpointCallbacks for EventSequencer {
    fn on_endpoint_tier_update(
        &mut self,
        key: &EndpointKey,
        endpoint: Option<&Endpoint>,
        tiers: &[TierInfo],
    ) {
        match endpoint {
            None => {
                // Deletion: squash any queued update; only send a remove if
                // the downstream has seen the endpoint.
                self.pending_endpoint_updates.remove(key);
                if self.sent_endpoints.contains(key) {
                    self.pending_endpoint_deletes.insert(key.clone());
                }
            }
            Some(endpoint) => {
                self.pending_endpoint_deletes.remove(key);
                self.pending_endpoint_updates
                    .insert(key.clone(), (endpoint.clone(), tiers.to_vec()));
            }
        }
    }
}

impl ConfigCallbacks for EventSequencer {
    fn on_config_update(
        &mut self,
        global: BTreeMap<String, String>,
        host: BTreeMap<String, String>,
    ) {
        self.pending_global_config = Some(global);
        self.pending_host_config = Some(host);
    }

    fn on_datastore_not_ready(&mut self) {
        self.pending_not_ready = true;
    }
}

impl PassthruCallbacks for EventSequencer {
    fn on_host_ip_update(&mut self, hostname: &str, addr: IpAddr) {
        tracing::debug!(%hostname, %addr, "Host IP update");
        self.pending_host_ip_deletes.remove(hostname);
        self.pending_host_ip_updates
            .insert(hostname.to_string(), addr);
    }

    fn on_host_ip_remove(&mut self, hostname: &str) {
        tracing::debug!(%hostname, "Host IP removed");
        self.pending_host_ip_updates.remove(hostname);
        if self.sent_host_ips.contains(hostname) {
            self.pending_host_ip_deletes.insert(hostname.to_string());
        }
    }

    fn on_ip_pool_update(&mut self, cidr: IpNet, pool: Arc<IpPool>) {
        tracing::debug!(%cidr, "IP pool update");
        self.pending_ip_pool_deletes.remove(&cidr);
        self.pending_ip_pool_updates.insert(cidr, pool);
    }

    fn on_ip_pool_remove(&mut self, cidr: IpNet) {
        tracing::debug!(%cidr, "IP pool removed");
        self.pending_ip_pool_updates.remove(&cidr);
        if self.sent_ip_pools.contains(&cidr) {
            self.pending_ip_pool_deletes.insert(cidr);
        }
    }
}

/// Renders internal tier info into the dataplane form, routing do-not-track
/// policies to the untracked side. Tiers with no policies of a kind are
/// omitted from that side.
fn split_tiers(tiers: &[TierInfo]) -> (Vec<ProtoTierInfo>, Vec<ProtoTierInfo>) {
    let mut tracked_tiers = Vec::new();
    let mut untracked_tiers = Vec::new();
    for tier in tiers {
        let mut tracked = Vec::new();
        let mut untracked = Vec::new();
        for kv in &tier.ordered_policies {
            if kv.value.do_not_track {
                untracked.push(kv.key.name.clone());
            } else {
                tracked.push(kv.key.name.clone());
            }
        }
        if !tracked.is_empty() {
            tracked_tiers.push(ProtoTierInfo {
                name: tier.name.clone(),
                policies: tracked,
            });
        }
        if !untracked.is_empty() {
            untracked_tiers.push(ProtoTierInfo {
                name: tier.name.clone(),
                policies: untracked,
            });
        }
    }
    (tracked_tiers, untracked_tiers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{endpoint_key, workload, MemoryConfig};
    use maplit::btreemap;

    fn sequencer() -> EventSequencer {
        EventSequencer::new(Box::new(MemoryConfig::default()))
    }

    fn drain(seq: &mut EventSequencer) -> Vec<DataplaneMessage> {
        let mut out = Vec::new();
        seq.flush(&mut |msg| out.push(msg)).unwrap();
        out
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn ip_set_add_then_remove_cancels() {
        let mut seq = sequencer();
        seq.on_ip_set_added("s:1");
        seq.on_ip_added("s:1", ip("10.0.0.1"));
        seq.on_ip_set_removed("s:1");
        assert!(drain(&mut seq).is_empty());
    }

    #[test]
    fn ip_add_cancels_pending_removal() {
        let mut seq = sequencer();
        seq.on_ip_set_added("s:1");
        seq.on_ip_added("s:1", ip("10.0.0.1"));
        drain(&mut seq);

        seq.on_ip_removed("s:1", ip("10.0.0.1"));
        seq.on_ip_added("s:1", ip("10.0.0.1"));
        assert!(drain(&mut seq).is_empty());
    }

    #[test]
    fn readd_after_remove_sends_full_replacement() {
        let mut seq = sequencer();
        seq.on_ip_set_added("s:1");
        seq.on_ip_added("s:1", ip("10.0.0.1"));
        assert_eq!(
            drain(&mut seq),
            [DataplaneMessage::IpSetUpdate {
                id: "s:1".to_string(),
                members: vec![ip("10.0.0.1")],
            }]
        );

        // Deactivate and reactivate within one batch: the downstream
        // considers the old instance gone, so it gets the full membership
        // again, not a delta.
        seq.on_ip_set_removed("s:1");
        seq.on_ip_set_added("s:1");
        seq.on_ip_added("s:1", ip("10.0.0.1"));
        assert_eq!(
            drain(&mut seq),
            [DataplaneMessage::IpSetUpdate {
                id: "s:1".to_string(),
                members: vec![ip("10.0.0.1")],
            }]
        );
    }

    #[test]
    fn membership_changes_flush_as_one_delta() {
        let mut seq = sequencer();
        seq.on_ip_set_added("s:1");
        seq.on_ip_added("s:1", ip("10.0.0.1"));
        drain(&mut seq);

        seq.on_ip_added("s:1", ip("10.0.0.2"));
        seq.on_ip_removed("s:1", ip("10.0.0.1"));
        assert_eq!(
            drain(&mut seq),
            [DataplaneMessage::IpSetDeltaUpdate {
                id: "s:1".to_string(),
                added_members: vec![ip("10.0.0.2")],
                removed_members: vec![ip("10.0.0.1")],
            }]
        );
    }

    #[test]
    #[should_panic(expected = "unknown IP set")]
    fn ip_add_to_unknown_set_faults() {
        let mut seq = sequencer();
        seq.on_ip_added("s:1", ip("10.0.0.1"));
    }

    #[test]
    #[should_panic(expected = "added while already sent")]
    fn double_add_faults() {
        let mut seq = sequencer();
        seq.on_ip_set_added("s:1");
        drain(&mut seq);
        seq.on_ip_set_added("s:1");
    }

    #[test]
    #[should_panic(expected = "remove for unknown set")]
    fn remove_of_unknown_set_faults() {
        let mut seq = sequencer();
        seq.on_ip_set_removed("s:1");
    }

    #[test]
    fn endpoint_delete_with_nothing_sent_is_silent() {
        let mut seq = sequencer();
        let key = endpoint_key("w1");
        let endpoint = workload("w1", &[], &["10.0.0.1/32"]);
        seq.on_endpoint_tier_update(&key, Some(&endpoint), &[]);
        seq.on_endpoint_tier_update(&key, None, &[]);
        assert!(drain(&mut seq).is_empty());
    }

    #[test]
    fn policy_bounce_is_coalesced() {
        let mut seq = sequencer();
        let key = PolicyKey {
            name: "pol".to_string(),
        };
        seq.on_policy_active(&key, Arc::new(ParsedRules::default()));
        seq.on_policy_inactive(&key);
        assert!(drain(&mut seq).is_empty());

        // Once sent, a bounce ends in a single remove.
        seq.on_policy_active(&key, Arc::new(ParsedRules::default()));
        assert_eq!(drain(&mut seq).len(), 1);
        seq.on_policy_inactive(&key);
        seq.on_policy_active(&key, Arc::new(ParsedRules::default()));
        seq.on_policy_inactive(&key);
        assert_eq!(
            drain(&mut seq),
            [DataplaneMessage::ActivePolicyRemove {
                id: PolicyId {
                    tier: "default".to_string(),
                    name: "pol".to_string(),
                },
            }]
        );
    }

    #[test]
    fn flush_order_is_dependency_safe() {
        let mut seq = sequencer();
        let key = endpoint_key("w1");
        let endpoint = workload("w1", &[], &["10.0.0.1/32"]);
        let policy_key = PolicyKey {
            name: "pol".to_string(),
        };

        // Feed updates in a deliberately inverted order.
        seq.on_endpoint_tier_update(&key, Some(&endpoint), &[]);
        seq.on_policy_active(&policy_key, Arc::new(ParsedRules::default()));
        seq.on_ip_set_added("s:1");
        seq.on_ip_added("s:1", ip("10.0.0.1"));

        let kinds: Vec<&'static str> = drain(&mut seq)
            .iter()
            .map(|msg| match msg {
                DataplaneMessage::IpSetUpdate { .. } => "ipset",
                DataplaneMessage::ActivePolicyUpdate { .. } => "policy",
                DataplaneMessage::WorkloadEndpointUpdate { .. } => "endpoint",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, ["ipset", "policy", "endpoint"]);
    }

    #[test]
    fn noop_flush_is_idempotent() {
        let mut seq = sequencer();
        seq.on_ip_set_added("s:1");
        seq.on_policy_active(
            &PolicyKey {
                name: "pol".to_string(),
            },
            Arc::new(ParsedRules::default()),
        );
        assert!(!drain(&mut seq).is_empty());
        assert!(drain(&mut seq).is_empty());
    }

    #[test]
    fn config_update_is_forwarded_once_parsed() {
        let mut seq = sequencer();
        seq.on_config_update(
            btreemap! {"LogLevel".to_string() => "info".to_string()},
            btreemap! {},
        );
        let msgs = drain(&mut seq);
        assert_eq!(
            msgs,
            [DataplaneMessage::ConfigUpdate {
                config: btreemap! {"LogLevel".to_string() => "info".to_string()},
            }]
        );

        // An identical snapshot doesn't re-send.
        seq.on_config_update(
            btreemap! {"LogLevel".to_string() => "info".to_string()},
            btreemap! {},
        );
        assert!(drain(&mut seq).is_empty());
    }

    #[test]
    fn untracked_policies_split_into_their_own_tier() {
        use crate::resolver::{PolKV, TierInfo};
        use warden_policy_core::{model::Policy, Selector};

        let mk = |name: &str, untracked: bool| PolKV {
            key: PolicyKey {
                name: name.to_string(),
            },
            value: Arc::new(Policy {
                order: None,
                selector: Selector::default(),
                in_rules: vec![],
                out_rules: vec![],
                do_not_track: untracked,
            }),
        };
        let (tracked, untracked) = split_tiers(&[TierInfo {
            name: "default".to_string(),
            ordered_policies: vec![mk("a", false), mk("b", true), mk("c", false)],
        }]);
        assert_eq!(tracked[0].policies, ["a", "c"]);
        assert_eq!(untracked[0].policies, ["b"]);
    }
}
