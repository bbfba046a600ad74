//! Policy rule bodies.
//!
//! [`Rule`] is the pre-parsed datastore form: match criteria may reference
//! other endpoints by selector or tag. [`ParsedRule`] is the dataplane form,
//! in which every such reference has been replaced by the ID of the IP set
//! that materialises it.

use crate::labels::{tag_set_id, Selector};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    #[default]
    Allow,
    Deny,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
    Sctp,
    Udplite,
}

/// An inclusive port range; a single port is `first == last`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub first: u16,
    pub last: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            first: port,
            last: port,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rule {
    pub action: RuleAction,
    pub protocol: Option<Protocol>,
    pub icmp_type: Option<u8>,
    pub icmp_code: Option<u8>,

    pub src_tag: Option<String>,
    pub src_selector: Option<Selector>,
    pub src_nets: Vec<IpNet>,
    pub src_ports: Vec<PortRange>,
    pub dst_tag: Option<String>,
    pub dst_selector: Option<Selector>,
    pub dst_nets: Vec<IpNet>,
    pub dst_ports: Vec<PortRange>,

    pub not_src_tag: Option<String>,
    pub not_src_selector: Option<Selector>,
    pub not_dst_tag: Option<String>,
    pub not_dst_selector: Option<Selector>,
}

/// A rule with selector/tag references resolved to IP set IDs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedRule {
    pub action: RuleAction,
    pub protocol: Option<Protocol>,
    pub icmp_type: Option<u8>,
    pub icmp_code: Option<u8>,

    pub src_nets: Vec<IpNet>,
    pub src_ports: Vec<PortRange>,
    pub src_ip_set_ids: Vec<String>,
    pub dst_nets: Vec<IpNet>,
    pub dst_ports: Vec<PortRange>,
    pub dst_ip_set_ids: Vec<String>,

    pub not_src_ip_set_ids: Vec<String>,
    pub not_dst_ip_set_ids: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedRules {
    pub in_rules: Vec<ParsedRule>,
    pub out_rules: Vec<ParsedRule>,
    pub untracked: bool,
}

// === impl Rule ===

impl Rule {
    /// All selectors this rule references, negated matches included.
    pub fn selectors(&self) -> impl Iterator<Item = &Selector> {
        self.src_selector
            .iter()
            .chain(self.dst_selector.iter())
            .chain(self.not_src_selector.iter())
            .chain(self.not_dst_selector.iter())
    }

    /// All tags this rule references, negated matches included.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.src_tag
            .iter()
            .chain(self.dst_tag.iter())
            .chain(self.not_src_tag.iter())
            .chain(self.not_dst_tag.iter())
            .map(|t| t.as_str())
    }
}

// === impl ParsedRule ===

impl ParsedRule {
    pub fn parse(rule: &Rule) -> Self {
        Self {
            action: rule.action,
            protocol: rule.protocol,
            icmp_type: rule.icmp_type,
            icmp_code: rule.icmp_code,
            src_nets: rule.src_nets.clone(),
            src_ports: rule.src_ports.clone(),
            src_ip_set_ids: set_ids(&rule.src_selector, &rule.src_tag),
            dst_nets: rule.dst_nets.clone(),
            dst_ports: rule.dst_ports.clone(),
            dst_ip_set_ids: set_ids(&rule.dst_selector, &rule.dst_tag),
            not_src_ip_set_ids: set_ids(&rule.not_src_selector, &rule.not_src_tag),
            not_dst_ip_set_ids: set_ids(&rule.not_dst_selector, &rule.not_dst_tag),
        }
    }
}

// === impl ParsedRules ===

impl ParsedRules {
    pub fn parse(in_rules: &[Rule], out_rules: &[Rule], untracked: bool) -> Self {
        Self {
            in_rules: in_rules.iter().map(ParsedRule::parse).collect(),
            out_rules: out_rules.iter().map(ParsedRule::parse).collect(),
            untracked,
        }
    }
}

fn set_ids(selector: &Option<Selector>, tag: &Option<String>) -> Vec<String> {
    selector
        .iter()
        .map(Selector::unique_id)
        .chain(tag.iter().map(|t| tag_set_id(t)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_resolves_references() {
        let sel = Selector::from_iter(Some(("env", "prod")));
        let rule = Rule {
            src_selector: Some(sel.clone()),
            dst_tag: Some("web".to_string()),
            ..Rule::default()
        };
        let parsed = ParsedRule::parse(&rule);
        assert_eq!(parsed.src_ip_set_ids, vec![sel.unique_id()]);
        assert_eq!(parsed.dst_ip_set_ids, vec![tag_set_id("web")]);
        assert!(parsed.not_src_ip_set_ids.is_empty());
    }

    #[test]
    fn parse_keeps_negated_references() {
        let sel = Selector::from_iter(Some(("quarantine", "true")));
        let rule = Rule {
            not_dst_selector: Some(sel.clone()),
            ..Rule::default()
        };
        let parsed = ParsedRule::parse(&rule);
        assert_eq!(parsed.not_dst_ip_set_ids, vec![sel.unique_id()]);
    }
}
