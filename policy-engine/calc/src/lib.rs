//! The warden policy calculation graph.
//!
//! Consumes the cluster-wide datastore update stream and derives, for one
//! named host, the dependency-ordered dataplane messages that program its
//! packet filter: active IP sets and their members, active policies and
//! profiles with parsed rules, local endpoints with their ordered tiers, and
//! passthrough host-IP/IP-pool/config events.
//!
//! ```ignore
//! updates ─▶ all-update Dispatcher ──┬─▶ local-endpoint Dispatcher (hostname filter)
//!                                    │        ├─▶ ActiveRulesCalculator ─▶ RuleScanner ─┐
//!                                    │        └─▶ PolicyResolver ◀────────────────------┤
//!                                    ├─▶ selector index ◀── selector activations ◀──────┤
//!                                    ├─▶ tag index      ◀── tag activations ◀───────────┘
//!                                    │        └─▶ MemberCalculator ─▶ IP set members
//!                                    ├─▶ ConfigBatcher
//!                                    └─▶ HostIP / IPPool passthrough
//!                                                 │
//!                                                 ▼
//!                                          EventSequencer ─▶ flush() ─▶ dataplane
//! ```
//!
//! Everything runs on one logical thread: each update is handled to
//! completion before the next, and the sequencer's `flush` is the only point
//! where the outside world observes the graph's state. Components live
//! behind `Rc<RefCell<…>>` and talk through callbacks, so the graph (and the
//! [`worker`] future that drives it) is deliberately `!Send`; run it on a
//! current-thread runtime or `LocalSet`.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod active_rules;
pub mod config;
pub mod config_batcher;
pub mod dispatch;
pub mod label_index;
pub mod members;
pub mod multidict;
pub mod resolver;
pub mod rule_scanner;
pub mod sequencer;
pub mod tag_index;
#[cfg(test)]
mod testutil;
pub mod worker;

use self::{
    active_rules::ActiveRulesCalculator,
    config_batcher::ConfigBatcher,
    dispatch::{Dispatcher, UpdateHandler},
    label_index::{InheritIndex, MatchListener},
    members::MemberCalculator,
    resolver::{PolicyResolver, TierInfo},
    rule_scanner::{RuleScanner, ScanListener},
    tag_index::{TagIndex, TagListener},
};
use std::{cell::RefCell, collections::BTreeMap, net::IpAddr, rc::Rc, sync::Arc};
use warden_policy_core::{
    model::{
        Endpoint, EndpointKey, IpPool, KeyKind, PolicyKey, SyncStatus, Update,
    },
    rules::ParsedRules,
    tag_set_id, IpNet, Selector,
};

pub use self::{config::{ConfigResolver, ConfigSource}, sequencer::EventSequencer};

/// IP set lifecycle and membership events.
pub trait IpSetCallbacks {
    fn on_ip_set_added(&mut self, set_id: &str);
    fn on_ip_added(&mut self, set_id: &str, addr: IpAddr);
    fn on_ip_removed(&mut self, set_id: &str, addr: IpAddr);
    fn on_ip_set_removed(&mut self, set_id: &str);
}

/// Active policy/profile rule events.
pub trait RuleCallbacks {
    fn on_policy_active(&mut self, key: &PolicyKey, rules: Arc<ParsedRules>);
    fn on_policy_inactive(&mut self, key: &PolicyKey);
    fn on_profile_active(&mut self, profile: &str, rules: Arc<ParsedRules>);
    fn on_profile_inactive(&mut self, profile: &str);
}

/// Local endpoint events, decorated with the ordered tiers that apply.
/// `endpoint = None` is a deletion.
pub trait EndpointCallbacks {
    fn on_endpoint_tier_update(
        &mut self,
        key: &EndpointKey,
        endpoint: Option<&Endpoint>,
        tiers: &[TierInfo],
    );
}

pub trait ConfigCallbacks {
    fn on_config_update(
        &mut self,
        global: BTreeMap<String, String>,
        host: BTreeMap<String, String>,
    );
    fn on_datastore_not_ready(&mut self);
}

/// Host IP and IP pool events, forwarded from the datastore verbatim.
pub trait PassthruCallbacks {
    fn on_host_ip_update(&mut self, hostname: &str, addr: IpAddr);
    fn on_host_ip_remove(&mut self, hostname: &str);
    fn on_ip_pool_update(&mut self, cidr: IpNet, pool: Arc<IpPool>);
    fn on_ip_pool_remove(&mut self, cidr: IpNet);
}

/// The full output surface of the graph; the event sequencer implements the
/// union.
pub trait PipelineCallbacks:
    IpSetCallbacks + RuleCallbacks + EndpointCallbacks + ConfigCallbacks + PassthruCallbacks
{
}

impl<T> PipelineCallbacks for T where
    T: IpSetCallbacks + RuleCallbacks + EndpointCallbacks + ConfigCallbacks + PassthruCallbacks
{
}

pub type SharedCallbacks = Rc<RefCell<dyn PipelineCallbacks>>;

/// The assembled calculation graph. Feed it the datastore stream and drive
/// the sequencer's flush to collect the results.
pub struct CalcGraph {
    all_updates: Rc<RefCell<Dispatcher>>,
}

// === impl CalcGraph ===

impl CalcGraph {
    pub fn new(hostname: impl Into<String>, callbacks: SharedCallbacks) -> Self {
        let hostname = hostname.into();
        tracing::info!(%hostname, "Creating calculation graph");

        let mut all = Dispatcher::new();

        // Some handlers only care about this host's endpoints: hang a second
        // dispatcher off the first, gated by the hostname filter.
        let mut local = Dispatcher::new();
        let filter = Rc::new(RefCell::new(EndpointHostnameFilter {
            hostname: hostname.clone(),
        }));
        local.register(KeyKind::WorkloadEndpoint, filter.clone());
        local.register(KeyKind::HostEndpoint, filter);

        // The member calculator merges matched endpoints' IPs into per-set
        // membership. It's wired up first so the indexes can feed it.
        let member_calc = Rc::new(RefCell::new(MemberCalculator::new(callbacks.clone())));

        // The selector index matches rule selectors (activated by the rule
        // scanner) against all endpoints' labels.
        let selector_index = Rc::new(RefCell::new(SelectorIndexHandler {
            index: InheritIndex::new(),
            member_calc: member_calc.clone(),
        }));

        // The tag index does the same for profile-declared tags.
        let tag_index = Rc::new(RefCell::new(TagIndexHandler {
            index: TagIndex::new(),
            member_calc: member_calc.clone(),
        }));

        // The rule scanner extracts selector/tag dependencies from active
        // rules; its activations declare IP sets downstream *before*
        // updating the indexes, so membership events always land on a
        // declared set.
        let rule_scanner = Rc::new(RefCell::new(RuleScanner::new(
            callbacks.clone(),
            Box::new(GraphScanListener {
                callbacks: callbacks.clone(),
                selector_index: selector_index.clone(),
                tag_index: tag_index.clone(),
            }),
        )));

        // The policy resolver computes each local endpoint's ordered policy
        // list from the active-rules calculator's match events.
        let resolver = Rc::new(RefCell::new(PolicyResolver::new(callbacks.clone())));

        // The active rules calculator decides which policies/profiles are
        // live on this host.
        let active_rules = Rc::new(RefCell::new(ActiveRulesCalculator::new(
            rule_scanner,
            resolver.clone(),
        )));

        let passthru = Rc::new(RefCell::new(DataplanePassthru {
            callbacks: callbacks.clone(),
        }));
        let config_batcher = Rc::new(RefCell::new(ConfigBatcher::new(
            hostname,
            callbacks,
        )));

        // Local-dispatcher handlers, after the filter.
        local.register(KeyKind::WorkloadEndpoint, active_rules.clone());
        local.register(KeyKind::HostEndpoint, active_rules.clone());
        local.register(KeyKind::WorkloadEndpoint, resolver.clone());
        local.register(KeyKind::HostEndpoint, resolver.clone());
        let local = Rc::new(RefCell::new(local));

        // All-updates registration order is the order parallel derivations
        // observe each input; in particular the indexes must see endpoint
        // deletions before the member calculator forgets the old IPs.
        all.register(KeyKind::WorkloadEndpoint, local.clone());
        all.register(KeyKind::HostEndpoint, local.clone());
        all.register_status_handler(local);

        all.register(KeyKind::Policy, active_rules.clone());
        all.register(KeyKind::ProfileRules, active_rules.clone());
        all.register(KeyKind::ProfileLabels, active_rules);

        all.register(KeyKind::WorkloadEndpoint, selector_index.clone());
        all.register(KeyKind::HostEndpoint, selector_index.clone());
        all.register(KeyKind::ProfileLabels, selector_index);

        all.register(KeyKind::WorkloadEndpoint, tag_index.clone());
        all.register(KeyKind::HostEndpoint, tag_index.clone());
        all.register(KeyKind::ProfileTags, tag_index);

        all.register(KeyKind::WorkloadEndpoint, member_calc.clone());
        all.register(KeyKind::HostEndpoint, member_calc);

        all.register(KeyKind::Policy, resolver);

        all.register(KeyKind::HostIp, passthru.clone());
        all.register(KeyKind::IpPool, passthru);

        all.register(KeyKind::GlobalConfig, config_batcher.clone());
        all.register(KeyKind::HostConfig, config_batcher.clone());
        all.register(KeyKind::DatastoreReady, config_batcher.clone());
        all.register_status_handler(config_batcher);

        Self {
            all_updates: Rc::new(RefCell::new(all)),
        }
    }

    pub fn on_update(&self, update: &Update) {
        self.all_updates.borrow_mut().dispatch(update);
    }

    pub fn on_status(&self, status: SyncStatus) {
        self.all_updates.borrow_mut().dispatch_status(status);
    }
}

/// Filters out endpoints that live on other hosts; everything downstream of
/// it on the local dispatcher sees only this host's endpoints.
struct EndpointHostnameFilter {
    hostname: String,
}

impl UpdateHandler for EndpointHostnameFilter {
    fn on_update(&mut self, update: &Update) -> bool {
        let filter_out = match update {
            Update::WorkloadEndpoint(id, _) => id.hostname != self.hostname,
            Update::HostEndpoint(id, _) => id.hostname != self.hostname,
            _ => false,
        };
        if !filter_out {
            // Log local endpoints only, to keep the log volume down.
            if update.is_delete() {
                tracing::info!(kind = ?update.kind(), "Local endpoint deleted");
            } else {
                tracing::info!(kind = ?update.kind(), "Local endpoint updated");
            }
        }
        filter_out
    }
}

/// Forwards host IP and IP pool updates straight to the sequencer.
struct DataplanePassthru {
    callbacks: SharedCallbacks,
}

impl UpdateHandler for DataplanePassthru {
    fn on_update(&mut self, update: &Update) -> bool {
        match update {
            Update::HostIp(hostname, Some(addr)) => {
                tracing::debug!(%hostname, "Passing through host IP update");
                self.callbacks.borrow_mut().on_host_ip_update(hostname, *addr);
            }
            Update::HostIp(hostname, None) => {
                tracing::debug!(%hostname, "Passing through host IP deletion");
                self.callbacks.borrow_mut().on_host_ip_remove(hostname);
            }
            Update::IpPool(cidr, Some(pool)) => {
                tracing::debug!(%cidr, "Passing through IP pool update");
                self.callbacks
                    .borrow_mut()
                    .on_ip_pool_update(*cidr, pool.clone());
            }
            Update::IpPool(cidr, None) => {
                tracing::debug!(%cidr, "Passing through IP pool deletion");
                self.callbacks.borrow_mut().on_ip_pool_remove(*cidr);
            }
            _ => {}
        }
        false
    }
}

/// Adapts datastore updates for the selector index and forwards its match
/// transitions to the member calculator. Selector IDs here are already the
/// IP set IDs the rule scanner activated them under.
struct SelectorIndexHandler {
    index: InheritIndex,
    member_calc: Rc<RefCell<MemberCalculator>>,
}

struct MemberForwarder<'a> {
    member_calc: &'a Rc<RefCell<MemberCalculator>>,
}

impl MatchListener for MemberForwarder<'_> {
    fn match_started(&mut self, sel_id: &str, item: &EndpointKey) {
        self.member_calc.borrow_mut().match_started(item, sel_id);
    }

    fn match_stopped(&mut self, sel_id: &str, item: &EndpointKey) {
        self.member_calc.borrow_mut().match_stopped(item, sel_id);
    }
}

impl SelectorIndexHandler {
    fn update_selector(&mut self, set_id: String, selector: Selector) {
        let mut listener = MemberForwarder {
            member_calc: &self.member_calc,
        };
        self.index.update_selector(set_id, selector, &mut listener);
    }

    fn delete_selector(&mut self, set_id: &str) {
        let mut listener = MemberForwarder {
            member_calc: &self.member_calc,
        };
        self.index.delete_selector(set_id, &mut listener);
    }
}

impl UpdateHandler for SelectorIndexHandler {
    fn on_update(&mut self, update: &Update) -> bool {
        let mut listener = MemberForwarder {
            member_calc: &self.member_calc,
        };
        match update {
            Update::WorkloadEndpoint(id, value) => {
                let key = EndpointKey::Workload(id.clone());
                match value {
                    Some(ep) => self.index.update_labels(
                        key,
                        ep.labels.clone(),
                        ep.profile_ids.clone(),
                        &mut listener,
                    ),
                    None => self.index.delete_item(&key, &mut listener),
                }
            }
            Update::HostEndpoint(id, value) => {
                let key = EndpointKey::Host(id.clone());
                match value {
                    Some(ep) => self.index.update_labels(
                        key,
                        ep.labels.clone(),
                        ep.profile_ids.clone(),
                        &mut listener,
                    ),
                    None => self.index.delete_item(&key, &mut listener),
                }
            }
            Update::ProfileLabels(name, value) => {
                self.index
                    .update_parent_labels(name, value.clone(), &mut listener);
            }
            _ => {}
        }
        false
    }
}

/// The tag analogue of [`SelectorIndexHandler`]; maps tag names to their
/// derived IP set IDs on the way to the member calculator.
struct TagIndexHandler {
    index: TagIndex,
    member_calc: Rc<RefCell<MemberCalculator>>,
}

struct TagForwarder<'a> {
    member_calc: &'a Rc<RefCell<MemberCalculator>>,
}

impl TagListener for TagForwarder<'_> {
    fn tag_match_started(&mut self, tag: &str, item: &EndpointKey) {
        self.member_calc
            .borrow_mut()
            .match_started(item, &tag_set_id(tag));
    }

    fn tag_match_stopped(&mut self, tag: &str, item: &EndpointKey) {
        self.member_calc
            .borrow_mut()
            .match_stopped(item, &tag_set_id(tag));
    }
}

impl TagIndexHandler {
    fn set_tag_active(&mut self, tag: &str) {
        let mut listener = TagForwarder {
            member_calc: &self.member_calc,
        };
        self.index.set_tag_active(tag, &mut listener);
    }

    fn set_tag_inactive(&mut self, tag: &str) {
        let mut listener = TagForwarder {
            member_calc: &self.member_calc,
        };
        self.index.set_tag_inactive(tag, &mut listener);
    }
}

impl UpdateHandler for TagIndexHandler {
    fn on_update(&mut self, update: &Update) -> bool {
        let mut listener = TagForwarder {
            member_calc: &self.member_calc,
        };
        match update {
            Update::WorkloadEndpoint(id, value) => {
                self.index.update_endpoint(
                    EndpointKey::Workload(id.clone()),
                    value.as_ref().map(|ep| ep.profile_ids.clone()),
                    &mut listener,
                );
            }
            Update::HostEndpoint(id, value) => {
                self.index.update_endpoint(
                    EndpointKey::Host(id.clone()),
                    value.as_ref().map(|ep| ep.profile_ids.clone()),
                    &mut listener,
                );
            }
            Update::ProfileTags(name, value) => {
                self.index.update_profile_tags(
                    name,
                    value.as_ref().map(|tags| tags.to_vec()),
                    &mut listener,
                );
            }
            _ => {}
        }
        false
    }
}

/// Routes the rule scanner's activations: IP sets are declared to the
/// sequencer before the indexes start producing membership for them, and
/// withdrawn after the indexes stop.
struct GraphScanListener {
    callbacks: SharedCallbacks,
    selector_index: Rc<RefCell<SelectorIndexHandler>>,
    tag_index: Rc<RefCell<TagIndexHandler>>,
}

impl ScanListener for GraphScanListener {
    fn selector_active(&mut self, selector: &Selector) {
        let set_id = selector.unique_id();
        self.callbacks.borrow_mut().on_ip_set_added(&set_id);
        self.selector_index
            .borrow_mut()
            .update_selector(set_id, selector.clone());
    }

    fn selector_inactive(&mut self, selector: &Selector) {
        let set_id = selector.unique_id();
        self.selector_index.borrow_mut().delete_selector(&set_id);
        self.callbacks.borrow_mut().on_ip_set_removed(&set_id);
    }

    fn tag_active(&mut self, tag: &str) {
        self.callbacks.borrow_mut().on_ip_set_added(&tag_set_id(tag));
        self.tag_index.borrow_mut().set_tag_active(tag);
    }

    fn tag_inactive(&mut self, tag: &str) {
        self.tag_index.borrow_mut().set_tag_inactive(tag);
        self.callbacks
            .borrow_mut()
            .on_ip_set_removed(&tag_set_id(tag));
    }
}
