//! The IP set member calculator.
//!
//! Joins the match events from the selector and tag indexes with endpoint IP
//! addresses to maintain each IP set's membership. Membership is a multiset:
//! an IP contributed by several matched endpoints stays in the set until the
//! last contributor releases it, and only 0↔positive transitions are
//! reported downstream.

use crate::{multidict::MultiMap, SharedCallbacks};
use ahash::AHashMap as HashMap;
use std::{collections::BTreeSet, net::IpAddr};
use warden_policy_core::model::{Endpoint, EndpointKey};

pub struct MemberCalculator {
    callbacks: SharedCallbacks,
    ips_by_endpoint: HashMap<EndpointKey, Vec<IpAddr>>,
    set_ids_by_endpoint: MultiMap<EndpointKey, String>,
    /// Per set, the refcount each member IP carries.
    members: HashMap<String, HashMap<IpAddr, usize>>,
}

// === impl MemberCalculator ===

impl MemberCalculator {
    pub fn new(callbacks: SharedCallbacks) -> Self {
        Self {
            callbacks,
            ips_by_endpoint: HashMap::default(),
            set_ids_by_endpoint: MultiMap::new(),
            members: HashMap::default(),
        }
    }

    pub fn match_started(&mut self, item: &EndpointKey, set_id: &str) {
        tracing::debug!(?item, %set_id, "Endpoint now matches IP set");
        self.set_ids_by_endpoint
            .insert(item.clone(), set_id.to_string());
        let ips = self.ips_by_endpoint.get(item).cloned().unwrap_or_default();
        for ip in ips {
            self.add_ref(set_id, ip);
        }
    }

    pub fn match_stopped(&mut self, item: &EndpointKey, set_id: &str) {
        tracing::debug!(?item, %set_id, "Endpoint no longer matches IP set");
        self.set_ids_by_endpoint.remove(item, &set_id.to_string());
        let ips = self.ips_by_endpoint.get(item).cloned().unwrap_or_default();
        for ip in ips {
            self.remove_ref(set_id, ip);
        }
    }

    /// Applies an endpoint's new IP list, adjusting every set it is
    /// currently matched into.
    pub fn update_endpoint_ips(&mut self, item: &EndpointKey, ips: Vec<IpAddr>) {
        // Dedupe: a single endpoint contributes each IP once, however many
        // interfaces carry it.
        let new: BTreeSet<IpAddr> = ips.into_iter().collect();
        let old: BTreeSet<IpAddr> = self
            .ips_by_endpoint
            .remove(item)
            .unwrap_or_default()
            .into_iter()
            .collect();

        let set_ids: Vec<String> = self
            .set_ids_by_endpoint
            .get(item)
            .cloned()
            .collect();
        for set_id in &set_ids {
            for ip in old.difference(&new) {
                self.remove_ref(set_id, *ip);
            }
            for ip in new.difference(&old) {
                self.add_ref(set_id, *ip);
            }
        }

        if !new.is_empty() {
            self.ips_by_endpoint
                .insert(item.clone(), new.into_iter().collect());
        }
    }

    fn add_ref(&mut self, set_id: &str, ip: IpAddr) {
        let count = self
            .members
            .entry(set_id.to_string())
            .or_default()
            .entry(ip)
            .or_insert(0);
        *count += 1;
        if *count == 1 {
            self.callbacks.borrow_mut().on_ip_added(set_id, ip);
        }
    }

    fn remove_ref(&mut self, set_id: &str, ip: IpAddr) {
        let set = match self.members.get_mut(set_id) {
            Some(set) => set,
            None => return,
        };
        let count = match set.get_mut(&ip) {
            Some(count) => count,
            None => return,
        };
        *count -= 1;
        if *count == 0 {
            set.remove(&ip);
            if set.is_empty() {
                self.members.remove(set_id);
            }
            self.callbacks.borrow_mut().on_ip_removed(set_id, ip);
        }
    }
}

impl crate::dispatch::UpdateHandler for MemberCalculator {
    fn on_update(&mut self, update: &warden_policy_core::model::Update) -> bool {
        use warden_policy_core::model::Update;
        match update {
            Update::WorkloadEndpoint(id, value) => {
                let key = EndpointKey::Workload(id.clone());
                let ips = value
                    .as_ref()
                    .map(|ep| Endpoint::Workload(ep.clone()).ip_addrs())
                    .unwrap_or_default();
                self.update_endpoint_ips(&key, ips);
            }
            Update::HostEndpoint(id, value) => {
                let key = EndpointKey::Host(id.clone());
                let ips = value
                    .as_ref()
                    .map(|ep| Endpoint::Host(ep.clone()).ip_addrs())
                    .unwrap_or_default();
                self.update_endpoint_ips(&key, ips);
            }
            _ => {}
        }
        false
    }
}
