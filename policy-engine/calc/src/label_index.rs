//! The label/selector index.
//!
//! Tracks two populations — labelled items (endpoints, which may inherit
//! labels from parent profiles) and selectors — and reports exactly when a
//! selector starts or stops matching an item.
//!
//! The graph instantiates this twice: the active-rules calculator matches
//! policy selectors against local endpoints, and the top-level
//! active-selector index matches rule selectors against all endpoints.

use crate::multidict::MultiMap;
use ahash::AHashMap as HashMap;
use warden_policy_core::{
    labels::{Labels, Map},
    model::EndpointKey,
    Selector,
};

/// Receives match transitions. Fired exactly once per transition, never for
/// a state the caller has already been told about.
pub trait MatchListener {
    fn match_started(&mut self, sel_id: &str, item: &EndpointKey);
    fn match_stopped(&mut self, sel_id: &str, item: &EndpointKey);
}

#[derive(Default)]
pub struct InheritIndex {
    items: HashMap<EndpointKey, ItemData>,
    parent_labels: HashMap<String, Labels>,
    items_by_parent: MultiMap<String, EndpointKey>,
    selectors: HashMap<String, Selector>,

    matches_by_sel: MultiMap<String, EndpointKey>,
    matches_by_item: MultiMap<EndpointKey, String>,
}

struct ItemData {
    labels: Labels,
    parents: Vec<String>,
    /// Parent labels overridden by the item's own; kept in step with the
    /// parent state so selector evaluation never recomputes the merge.
    effective: Labels,
}

// === impl InheritIndex ===

impl InheritIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an item's own labels and its ordered parent list, then
    /// re-evaluates every selector against it.
    pub fn update_labels(
        &mut self,
        item: EndpointKey,
        labels: Labels,
        parents: Vec<String>,
        listener: &mut dyn MatchListener,
    ) {
        tracing::trace!(?item, "Updating item labels");
        self.reindex_parents(&item, &parents);
        let effective = effective_labels(&labels, &parents, &self.parent_labels);
        self.items.insert(
            item.clone(),
            ItemData {
                labels,
                parents,
                effective,
            },
        );
        self.rescan_item(&item, listener);
    }

    /// Replaces an item's parent list, keeping its own labels.
    pub fn update_parents(
        &mut self,
        item: EndpointKey,
        parents: Vec<String>,
        listener: &mut dyn MatchListener,
    ) {
        let labels = self
            .items
            .get(&item)
            .map(|data| data.labels.clone())
            .unwrap_or_default();
        self.update_labels(item, labels, parents, listener);
    }

    /// Updates (or, with `None`, deletes) the labels attached to a parent,
    /// refreshing every child item.
    pub fn update_parent_labels(
        &mut self,
        parent: &str,
        labels: Option<Labels>,
        listener: &mut dyn MatchListener,
    ) {
        let old = self.parent_labels.get(parent);
        if old == labels.as_ref() {
            tracing::trace!(%parent, "Parent labels unchanged");
            return;
        }
        match labels {
            Some(labels) => {
                self.parent_labels.insert(parent.to_string(), labels);
            }
            None => {
                self.parent_labels.remove(parent);
            }
        }

        let children: Vec<EndpointKey> = self
            .items_by_parent
            .get(&parent.to_string())
            .cloned()
            .collect();
        for child in children {
            if let Some(data) = self.items.get_mut(&child) {
                data.effective =
                    effective_labels(&data.labels, &data.parents, &self.parent_labels);
            }
            self.rescan_item(&child, listener);
        }
    }

    /// Adds or replaces a selector, firing start/stop callbacks for the
    /// delta against every item.
    pub fn update_selector(
        &mut self,
        sel_id: impl ToString,
        selector: Selector,
        listener: &mut dyn MatchListener,
    ) {
        let sel_id = sel_id.to_string();
        tracing::debug!(%sel_id, "Updating selector");
        self.selectors.insert(sel_id.clone(), selector.clone());

        let Self {
            items,
            matches_by_sel,
            matches_by_item,
            ..
        } = self;
        for (item, data) in items.iter() {
            if selector.matches(&data.effective) {
                store_match(matches_by_sel, matches_by_item, listener, &sel_id, item);
            } else {
                discard_match(matches_by_sel, matches_by_item, listener, &sel_id, item);
            }
        }
    }

    /// Removes a selector, firing a stop for each of its current matches.
    pub fn delete_selector(&mut self, sel_id: &str, listener: &mut dyn MatchListener) {
        tracing::debug!(%sel_id, "Deleting selector");
        self.selectors.remove(sel_id);
        for item in self.matches_by_sel.discard_key(&sel_id.to_string()) {
            self.matches_by_item.remove(&item, &sel_id.to_string());
            listener.match_stopped(sel_id, &item);
        }
    }

    /// Removes an item, firing a stop for each of its current matches.
    pub fn delete_item(&mut self, item: &EndpointKey, listener: &mut dyn MatchListener) {
        tracing::trace!(?item, "Deleting item");
        if let Some(data) = self.items.remove(item) {
            for parent in &data.parents {
                self.items_by_parent.remove(parent, item);
            }
        }
        for sel_id in self.matches_by_item.discard_key(item) {
            self.matches_by_sel.remove(&sel_id, item);
            listener.match_stopped(&sel_id, item);
        }
    }

    fn reindex_parents(&mut self, item: &EndpointKey, parents: &[String]) {
        if let Some(data) = self.items.get(item) {
            for parent in &data.parents {
                self.items_by_parent.remove(parent, item);
            }
        }
        for parent in parents {
            self.items_by_parent.insert(parent.clone(), item.clone());
        }
    }

    /// Re-evaluates every selector against one item. A full scan is always
    /// correct; narrowing it to selectors whose free labels changed is a
    /// possible optimisation.
    fn rescan_item(&mut self, item: &EndpointKey, listener: &mut dyn MatchListener) {
        let Self {
            items,
            selectors,
            matches_by_sel,
            matches_by_item,
            ..
        } = self;
        let labels = items.get(item).map(|data| &data.effective);
        for (sel_id, selector) in selectors.iter() {
            let now_matches = labels.is_some_and(|labels| selector.matches(labels));
            if now_matches {
                store_match(matches_by_sel, matches_by_item, listener, sel_id, item);
            } else {
                discard_match(matches_by_sel, matches_by_item, listener, sel_id, item);
            }
        }
    }
}

/// Records a match, notifying the listener on the no-match -> match
/// transition. Idempotent.
fn store_match(
    matches_by_sel: &mut MultiMap<String, EndpointKey>,
    matches_by_item: &mut MultiMap<EndpointKey, String>,
    listener: &mut dyn MatchListener,
    sel_id: &str,
    item: &EndpointKey,
) {
    if matches_by_sel.insert(sel_id.to_string(), item.clone()) {
        matches_by_item.insert(item.clone(), sel_id.to_string());
        listener.match_started(sel_id, item);
    }
}

/// The converse of [`store_match`]. Idempotent.
fn discard_match(
    matches_by_sel: &mut MultiMap<String, EndpointKey>,
    matches_by_item: &mut MultiMap<EndpointKey, String>,
    listener: &mut dyn MatchListener,
    sel_id: &str,
    item: &EndpointKey,
) {
    if matches_by_sel.remove(&sel_id.to_string(), item) {
        matches_by_item.remove(item, &sel_id.to_string());
        listener.match_stopped(sel_id, item);
    }
}

/// Merges parent labels (later parents override earlier ones) under the
/// item's own labels.
fn effective_labels(
    explicit: &Labels,
    parents: &[String],
    parent_labels: &HashMap<String, Labels>,
) -> Labels {
    let inherited: Vec<&Labels> = parents
        .iter()
        .filter_map(|parent| parent_labels.get(parent))
        .collect();
    if inherited.iter().all(|labels| labels.is_empty()) {
        return explicit.clone();
    }
    let mut combined = Map::new();
    for labels in inherited {
        for (key, value) in labels.iter() {
            combined.insert(key.to_owned(), value.to_owned());
        }
    }
    for (key, value) in explicit.iter() {
        combined.insert(key.to_owned(), value.to_owned());
    }
    Labels::from(combined)
}
