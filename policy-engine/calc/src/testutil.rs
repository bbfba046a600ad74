//! Shared helpers for the crate's tests: a recording implementation of the
//! callback surface, a trivial config resolver and endpoint constructors.

use crate::{
    config::{ConfigResolver, ConfigSource},
    resolver::TierInfo,
    rule_scanner::ScanListener,
    ConfigCallbacks, EndpointCallbacks, IpSetCallbacks, PassthruCallbacks, RuleCallbacks,
};
use anyhow::Result;
use std::{collections::BTreeMap, net::IpAddr, sync::Arc};
use warden_policy_core::{
    model::{
        Endpoint, EndpointKey, IpPool, PolicyKey, Update, WorkloadEndpoint, WorkloadEndpointId,
    },
    rules::ParsedRules,
    IpNet, Labels, Selector,
};

#[derive(Clone, Debug, PartialEq)]
pub enum RuleEvent {
    PolicyActive(PolicyKey, Arc<ParsedRules>),
    PolicyInactive(PolicyKey),
    ProfileActive(String, Arc<ParsedRules>),
    ProfileInactive(String),
}

/// Records every callback the graph makes, for assertions.
#[derive(Default)]
pub struct RecordingCallbacks {
    pub set_events: Vec<(bool, String)>,
    pub ip_events: Vec<(bool, String, IpAddr)>,
    pub rule_events: Vec<RuleEvent>,
    /// Endpoint key plus, for updates, the default tier's (policy,
    /// untracked) pairs in order; `None` for deletions.
    pub tier_updates: Vec<(EndpointKey, Option<Vec<(String, bool)>>)>,
    pub config_events: Vec<(BTreeMap<String, String>, BTreeMap<String, String>)>,
    pub not_ready: usize,
    pub host_ip_events: Vec<(String, Option<IpAddr>)>,
    pub pool_events: Vec<(IpNet, Option<Arc<IpPool>>)>,
}

impl IpSetCallbacks for RecordingCallbacks {
    fn on_ip_set_added(&mut self, set_id: &str) {
        self.set_events.push((true, set_id.to_string()));
    }

    fn on_ip_added(&mut self, set_id: &str, addr: IpAddr) {
        self.ip_events.push((true, set_id.to_string(), addr));
    }

    fn on_ip_removed(&mut self, set_id: &str, addr: IpAddr) {
        self.ip_events.push((false, set_id.to_string(), addr));
    }

    fn on_ip_set_removed(&mut self, set_id: &str) {
        self.set_events.push((false, set_id.to_string()));
    }
}

impl RuleCallbacks for RecordingCallbacks {
    fn on_policy_active(&mut self, key: &PolicyKey, rules: Arc<ParsedRules>) {
        self.rule_events
            .push(RuleEvent::PolicyActive(key.clone(), rules));
    }

    fn on_policy_inactive(&mut self, key: &PolicyKey) {
        self.rule_events.push(RuleEvent::PolicyInactive(key.clone()));
    }

    fn on_profile_active(&mut self, profile: &str, rules: Arc<ParsedRules>) {
        self.rule_events
            .push(RuleEvent::ProfileActive(profile.to_string(), rules));
    }

    fn on_profile_inactive(&mut self, profile: &str) {
        self.rule_events
            .push(RuleEvent::ProfileInactive(profile.to_string()));
    }
}

impl EndpointCallbacks for RecordingCallbacks {
    fn on_endpoint_tier_update(
        &mut self,
        key: &EndpointKey,
        endpoint: Option<&Endpoint>,
        tiers: &[TierInfo],
    ) {
        let tiers = endpoint.map(|_| {
            tiers
                .iter()
                .flat_map(|tier| {
                    tier.ordered_policies
                        .iter()
                        .map(|kv| (kv.key.name.clone(), kv.value.do_not_track))
                })
                .collect()
        });
        self.tier_updates.push((key.clone(), tiers));
    }
}

impl ConfigCallbacks for RecordingCallbacks {
    fn on_config_update(
        &mut self,
        global: BTreeMap<String, String>,
        host: BTreeMap<String, String>,
    ) {
        self.config_events.push((global, host));
    }

    fn on_datastore_not_ready(&mut self) {
        self.not_ready += 1;
    }
}

impl PassthruCallbacks for RecordingCallbacks {
    fn on_host_ip_update(&mut self, hostname: &str, addr: IpAddr) {
        self.host_ip_events.push((hostname.to_string(), Some(addr)));
    }

    fn on_host_ip_remove(&mut self, hostname: &str) {
        self.host_ip_events.push((hostname.to_string(), None));
    }

    fn on_ip_pool_update(&mut self, cidr: IpNet, pool: Arc<IpPool>) {
        self.pool_events.push((cidr, Some(pool)));
    }

    fn on_ip_pool_remove(&mut self, cidr: IpNet) {
        self.pool_events.push((cidr, None));
    }
}

/// A scan listener for tests that only care about the forwarded rules.
pub struct NullScanListener;

impl ScanListener for NullScanListener {
    fn selector_active(&mut self, _: &Selector) {}
    fn selector_inactive(&mut self, _: &Selector) {}
    fn tag_active(&mut self, _: &str) {}
    fn tag_inactive(&mut self, _: &str) {}
}

/// Merges snapshots verbatim; never fails to parse.
#[derive(Default)]
pub struct MemoryConfig {
    global: BTreeMap<String, String>,
    host: BTreeMap<String, String>,
}

impl ConfigResolver for MemoryConfig {
    fn update_from(
        &mut self,
        values: &BTreeMap<String, String>,
        source: ConfigSource,
    ) -> Result<bool> {
        let target = match source {
            ConfigSource::DatastoreGlobal => &mut self.global,
            ConfigSource::DatastorePerHost => &mut self.host,
        };
        let changed = target != values;
        *target = values.clone();
        Ok(changed)
    }

    fn raw_values(&self) -> BTreeMap<String, String> {
        let mut merged = self.global.clone();
        merged.extend(self.host.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

pub fn workload_id(name: &str) -> WorkloadEndpointId {
    WorkloadEndpointId {
        hostname: "host".to_string(),
        orchestrator: "orch".to_string(),
        workload: name.to_string(),
        endpoint: "eth0".to_string(),
    }
}

pub fn endpoint_key(name: &str) -> EndpointKey {
    EndpointKey::Workload(workload_id(name))
}

/// A workload endpoint on the test host with the given labels-as-pairs and
/// IPv4/IPv6 CIDRs.
pub fn workload(name: &str, labels: &[(&str, &str)], cidrs: &[&str]) -> Endpoint {
    let labels: Labels = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let mut ipv4_nets = Vec::new();
    let mut ipv6_nets = Vec::new();
    for cidr in cidrs {
        if let Ok(net) = cidr.parse() {
            ipv4_nets.push(net);
        } else {
            ipv6_nets.push(cidr.parse().expect("test CIDR parses"));
        }
    }
    Endpoint::Workload(Arc::new(WorkloadEndpoint {
        state: "active".to_string(),
        name: format!("veth-{}", name),
        mac: None,
        profile_ids: vec![],
        ipv4_nets,
        ipv6_nets,
        ipv4_nat: vec![],
        ipv6_nat: vec![],
        labels,
    }))
}

pub fn local_workload_update(name: &str) -> Update {
    match workload(name, &[], &[]) {
        Endpoint::Workload(ep) => Update::WorkloadEndpoint(workload_id(name), Some(ep)),
        Endpoint::Host(_) => unreachable!(),
    }
}

pub fn local_workload_delete(name: &str) -> Update {
    Update::WorkloadEndpoint(workload_id(name), None)
}
