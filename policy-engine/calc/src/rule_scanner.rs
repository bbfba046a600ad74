//! The rule scanner.
//!
//! The sole authority on which selectors and tags must be materialised as IP
//! sets: it extracts the references from every active policy's and profile's
//! rules, reference-counts them by canonical ID, and announces activation on
//! the 0↔nonzero transitions. It also converts rules to their dataplane
//! (parsed) form and forwards them downstream.

use crate::SharedCallbacks;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use warden_policy_core::{
    model::{Policy, PolicyKey, ProfileRules},
    rules::{ParsedRules, Rule},
    tag_set_id, Selector,
};
use std::sync::Arc;

/// Told when a selector or tag gains or loses its last active reference.
pub trait ScanListener {
    fn selector_active(&mut self, selector: &Selector);
    fn selector_inactive(&mut self, selector: &Selector);
    fn tag_active(&mut self, tag: &str);
    fn tag_inactive(&mut self, tag: &str);
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum RulesKey {
    Policy(PolicyKey),
    Profile(String),
}

#[derive(Clone)]
enum Dep {
    Selector(Selector),
    Tag(String),
}

pub struct RuleScanner {
    callbacks: SharedCallbacks,
    listener: Box<dyn ScanListener>,

    /// Dependency IDs referenced by each active policy/profile.
    deps_by_owner: HashMap<RulesKey, HashSet<String>>,
    /// Refcount and representative value per dependency ID. Two textually
    /// different but canonically equal selectors share one entry.
    refcounts: HashMap<String, (usize, Dep)>,
}

// === impl RuleScanner ===

impl RuleScanner {
    pub fn new(callbacks: SharedCallbacks, listener: Box<dyn ScanListener>) -> Self {
        Self {
            callbacks,
            listener,
            deps_by_owner: HashMap::default(),
            refcounts: HashMap::default(),
        }
    }

    pub fn on_policy_active(&mut self, key: &PolicyKey, policy: &Policy) {
        let parsed = Arc::new(ParsedRules::parse(
            &policy.in_rules,
            &policy.out_rules,
            policy.do_not_track,
        ));
        self.update_rules(
            RulesKey::Policy(key.clone()),
            policy.in_rules.iter().chain(policy.out_rules.iter()),
        );
        self.callbacks.borrow_mut().on_policy_active(key, parsed);
    }

    pub fn on_policy_inactive(&mut self, key: &PolicyKey) {
        self.callbacks.borrow_mut().on_policy_inactive(key);
        self.update_rules(RulesKey::Policy(key.clone()), std::iter::empty());
    }

    pub fn on_profile_active(&mut self, profile: &str, rules: &ProfileRules) {
        let parsed = Arc::new(ParsedRules::parse(&rules.in_rules, &rules.out_rules, false));
        self.update_rules(
            RulesKey::Profile(profile.to_string()),
            rules.in_rules.iter().chain(rules.out_rules.iter()),
        );
        self.callbacks
            .borrow_mut()
            .on_profile_active(profile, parsed);
    }

    pub fn on_profile_inactive(&mut self, profile: &str) {
        self.callbacks.borrow_mut().on_profile_inactive(profile);
        self.update_rules(RulesKey::Profile(profile.to_string()), std::iter::empty());
    }

    /// Diffs the owner's referenced selectors/tags against its previous
    /// rules, activating additions before releasing removals so a reference
    /// shared between old and new rules never bounces.
    fn update_rules<'r>(&mut self, owner: RulesKey, rules: impl Iterator<Item = &'r Rule>) {
        let mut new_deps: HashMap<String, Dep> = HashMap::default();
        for rule in rules {
            for selector in rule.selectors() {
                new_deps.insert(selector.unique_id(), Dep::Selector(selector.clone()));
            }
            for tag in rule.tags() {
                new_deps.insert(tag_set_id(tag), Dep::Tag(tag.to_string()));
            }
        }

        let old_ids = self.deps_by_owner.remove(&owner).unwrap_or_default();

        for (id, dep) in new_deps.iter() {
            if !old_ids.contains(id) {
                self.acquire(id, dep);
            }
        }
        for id in old_ids.iter() {
            if !new_deps.contains_key(id) {
                self.release(id);
            }
        }

        if !new_deps.is_empty() {
            self.deps_by_owner
                .insert(owner, new_deps.into_iter().map(|(id, _)| id).collect());
        }
    }

    fn acquire(&mut self, id: &str, dep: &Dep) {
        let entry = self
            .refcounts
            .entry(id.to_string())
            .or_insert_with(|| (0, dep.clone()));
        entry.0 += 1;
        if entry.0 == 1 {
            match &entry.1 {
                Dep::Selector(sel) => {
                    tracing::info!(set_id = %id, "Selector now active");
                    self.listener.selector_active(sel);
                }
                Dep::Tag(tag) => {
                    tracing::info!(%tag, "Tag now active");
                    self.listener.tag_active(tag);
                }
            }
        }
    }

    fn release(&mut self, id: &str) {
        let entry = match self.refcounts.get_mut(id) {
            Some(entry) => entry,
            None => return,
        };
        entry.0 -= 1;
        if entry.0 == 0 {
            let (_, dep) = self.refcounts.remove(id).expect("entry just looked up");
            match dep {
                Dep::Selector(sel) => {
                    tracing::info!(set_id = %id, "Selector now inactive");
                    self.listener.selector_inactive(&sel);
                }
                Dep::Tag(tag) => {
                    tracing::info!(%tag, "Tag now inactive");
                    self.listener.tag_inactive(&tag);
                }
            }
        }
    }
}
