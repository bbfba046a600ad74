//! The datastore-facing data model: entity keys, entity values and the
//! update stream the calculation graph consumes.

use crate::{
    labels::{Labels, Selector},
    rules::Rule,
};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::Arc,
};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkloadEndpointId {
    pub hostname: String,
    pub orchestrator: String,
    pub workload: String,
    pub endpoint: String,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostEndpointId {
    pub hostname: String,
    pub endpoint: String,
}

/// Identifies an endpoint of either kind. All cross-component references to
/// endpoints are by this key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EndpointKey {
    Workload(WorkloadEndpointId),
    Host(HostEndpointId),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkloadEndpoint {
    pub state: String,
    pub name: String,
    pub mac: Option<String>,
    pub profile_ids: Vec<String>,
    pub ipv4_nets: Vec<Ipv4Net>,
    pub ipv6_nets: Vec<Ipv6Net>,
    pub ipv4_nat: Vec<IpNat>,
    pub ipv6_nat: Vec<IpNat>,
    pub labels: Labels,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HostEndpoint {
    pub name: String,
    pub expected_ipv4_addrs: Vec<Ipv4Addr>,
    pub expected_ipv6_addrs: Vec<Ipv6Addr>,
    pub profile_ids: Vec<String>,
    pub labels: Labels,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpNat {
    pub ext_ip: IpAddr,
    pub int_ip: IpAddr,
}

/// An endpoint value of either kind, as stored by the components that need
/// to treat the two uniformly.
#[derive(Clone, Debug, PartialEq)]
pub enum Endpoint {
    Workload(Arc<WorkloadEndpoint>),
    Host(Arc<HostEndpoint>),
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PolicyKey {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Position within the tier; `None` sorts after every numbered policy.
    pub order: Option<f64>,
    pub selector: Selector,
    pub in_rules: Vec<Rule>,
    pub out_rules: Vec<Rule>,
    pub do_not_track: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfileRules {
    pub in_rules: Vec<Rule>,
    pub out_rules: Vec<Rule>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPool {
    pub cidr: IpNet,
    pub masquerade: bool,
}

/// A single datastore update: an entity key paired with its new value, or
/// `None` for a deletion. Key and value kinds cannot mismatch.
#[derive(Clone, Debug, PartialEq)]
pub enum Update {
    WorkloadEndpoint(WorkloadEndpointId, Option<Arc<WorkloadEndpoint>>),
    HostEndpoint(HostEndpointId, Option<Arc<HostEndpoint>>),
    Policy(PolicyKey, Option<Arc<Policy>>),
    ProfileRules(String, Option<Arc<ProfileRules>>),
    ProfileLabels(String, Option<Labels>),
    ProfileTags(String, Option<Arc<[String]>>),
    HostIp(String, Option<IpAddr>),
    IpPool(IpNet, Option<Arc<IpPool>>),
    GlobalConfig(String, Option<String>),
    HostConfig {
        hostname: String,
        name: String,
        value: Option<String>,
    },
    DatastoreReady(Option<bool>),
}

/// Discriminates the key variant of an [`Update`]; the dispatcher fans out
/// by this tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum KeyKind {
    WorkloadEndpoint,
    HostEndpoint,
    Policy,
    ProfileRules,
    ProfileLabels,
    ProfileTags,
    HostIp,
    IpPool,
    GlobalConfig,
    HostConfig,
    DatastoreReady,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SyncStatus {
    WaitForDatastore,
    ResyncInProgress,
    InSync,
}

// === impl EndpointKey ===

impl EndpointKey {
    pub fn hostname(&self) -> &str {
        match self {
            Self::Workload(id) => &id.hostname,
            Self::Host(id) => &id.hostname,
        }
    }
}

impl From<WorkloadEndpointId> for EndpointKey {
    fn from(id: WorkloadEndpointId) -> Self {
        Self::Workload(id)
    }
}

impl From<HostEndpointId> for EndpointKey {
    fn from(id: HostEndpointId) -> Self {
        Self::Host(id)
    }
}

// === impl Endpoint ===

impl Endpoint {
    pub fn profile_ids(&self) -> &[String] {
        match self {
            Self::Workload(ep) => &ep.profile_ids,
            Self::Host(ep) => &ep.profile_ids,
        }
    }

    pub fn labels(&self) -> &Labels {
        match self {
            Self::Workload(ep) => &ep.labels,
            Self::Host(ep) => &ep.labels,
        }
    }

    /// The endpoint's contribution to IP set membership.
    pub fn ip_addrs(&self) -> Vec<IpAddr> {
        match self {
            Self::Workload(ep) => ep
                .ipv4_nets
                .iter()
                .map(|n| IpAddr::V4(n.addr()))
                .chain(ep.ipv6_nets.iter().map(|n| IpAddr::V6(n.addr())))
                .collect(),
            Self::Host(ep) => ep
                .expected_ipv4_addrs
                .iter()
                .copied()
                .map(IpAddr::V4)
                .chain(ep.expected_ipv6_addrs.iter().copied().map(IpAddr::V6))
                .collect(),
        }
    }
}

// === impl Update ===

impl Update {
    pub fn kind(&self) -> KeyKind {
        match self {
            Self::WorkloadEndpoint(..) => KeyKind::WorkloadEndpoint,
            Self::HostEndpoint(..) => KeyKind::HostEndpoint,
            Self::Policy(..) => KeyKind::Policy,
            Self::ProfileRules(..) => KeyKind::ProfileRules,
            Self::ProfileLabels(..) => KeyKind::ProfileLabels,
            Self::ProfileTags(..) => KeyKind::ProfileTags,
            Self::HostIp(..) => KeyKind::HostIp,
            Self::IpPool(..) => KeyKind::IpPool,
            Self::GlobalConfig(..) => KeyKind::GlobalConfig,
            Self::HostConfig { .. } => KeyKind::HostConfig,
            Self::DatastoreReady(..) => KeyKind::DatastoreReady,
        }
    }

    /// Whether this update carries a value (`false` means deletion).
    pub fn is_delete(&self) -> bool {
        match self {
            Self::WorkloadEndpoint(_, v) => v.is_none(),
            Self::HostEndpoint(_, v) => v.is_none(),
            Self::Policy(_, v) => v.is_none(),
            Self::ProfileRules(_, v) => v.is_none(),
            Self::ProfileLabels(_, v) => v.is_none(),
            Self::ProfileTags(_, v) => v.is_none(),
            Self::HostIp(_, v) => v.is_none(),
            Self::IpPool(_, v) => v.is_none(),
            Self::GlobalConfig(_, v) => v.is_none(),
            Self::HostConfig { value, .. } => value.is_none(),
            Self::DatastoreReady(v) => v.is_none(),
        }
    }
}
