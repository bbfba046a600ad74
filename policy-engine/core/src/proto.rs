//! Messages emitted to the dataplane driver.
//!
//! The event sequencer guarantees that, within and across flushes, every
//! reference in one of these messages names an object that has already been
//! declared and not yet removed.

use crate::{
    model::{HostEndpoint, HostEndpointId, WorkloadEndpoint, WorkloadEndpointId},
    rules::ParsedRules,
};
use ipnet::IpNet;
use std::{collections::BTreeMap, net::IpAddr, sync::Arc};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PolicyId {
    pub tier: String,
    pub name: String,
}

/// One tier's worth of the ordered policies that apply to an endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TierInfo {
    pub name: String,
    pub policies: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpamPool {
    pub cidr: String,
    pub masquerade: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DataplaneMessage {
    DatastoreNotReady,
    ConfigUpdate {
        config: BTreeMap<String, String>,
    },
    IpSetUpdate {
        id: String,
        members: Vec<IpAddr>,
    },
    IpSetDeltaUpdate {
        id: String,
        added_members: Vec<IpAddr>,
        removed_members: Vec<IpAddr>,
    },
    IpSetRemove {
        id: String,
    },
    ActivePolicyUpdate {
        id: PolicyId,
        policy: Arc<ParsedRules>,
    },
    ActivePolicyRemove {
        id: PolicyId,
    },
    ActiveProfileUpdate {
        id: String,
        profile: Arc<ParsedRules>,
    },
    ActiveProfileRemove {
        id: String,
    },
    WorkloadEndpointUpdate {
        id: WorkloadEndpointId,
        endpoint: Arc<WorkloadEndpoint>,
        tiers: Vec<TierInfo>,
    },
    WorkloadEndpointRemove {
        id: WorkloadEndpointId,
    },
    HostEndpointUpdate {
        id: HostEndpointId,
        endpoint: Arc<HostEndpoint>,
        tiers: Vec<TierInfo>,
        untracked_tiers: Vec<TierInfo>,
    },
    HostEndpointRemove {
        id: HostEndpointId,
    },
    HostMetadataUpdate {
        hostname: String,
        ipv4_addr: IpAddr,
    },
    HostMetadataRemove {
        hostname: String,
    },
    IpamPoolUpdate {
        id: String,
        pool: IpamPool,
    },
    IpamPoolRemove {
        id: String,
    },
}

/// The dataplane ID for an IP pool: its CIDR with the `/` made
/// filesystem/iptables safe.
pub fn pool_id(cidr: &IpNet) -> String {
    cidr.to_string().replacen('/', "-", 1)
}
