//! The tag index.
//!
//! The tag analogue of the label/selector index: an endpoint matches tag `T`
//! iff any of its profiles declares `T`. Tags only produce events while
//! explicitly active (i.e. referenced by some live rule); matches are
//! reference-counted per (endpoint, tag) so that two profiles declaring the
//! same tag keep the match alive until both are gone.

use crate::multidict::MultiMap;
use ahash::AHashMap as HashMap;
use warden_policy_core::model::EndpointKey;

/// Receives tag match transitions, by tag name.
pub trait TagListener {
    fn tag_match_started(&mut self, tag: &str, item: &EndpointKey);
    fn tag_match_stopped(&mut self, tag: &str, item: &EndpointKey);
}

#[derive(Default)]
pub struct TagIndex {
    profile_ids_by_endpoint: HashMap<EndpointKey, Vec<String>>,
    endpoints_by_profile: MultiMap<String, EndpointKey>,
    tags_by_profile: HashMap<String, Vec<String>>,
    active_tags: ahash::AHashSet<String>,

    /// Number of the endpoint's profiles that declare the tag; the match
    /// exists while this is positive.
    match_counts: HashMap<(EndpointKey, String), usize>,
}

// === impl TagIndex ===

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tag_active(&mut self, tag: &str, listener: &mut dyn TagListener) {
        if !self.active_tags.insert(tag.to_string()) {
            return;
        }
        tracing::debug!(%tag, "Tag now active");
        for ((item, t), count) in self.match_counts.iter() {
            if t == tag && *count > 0 {
                listener.tag_match_started(tag, item);
            }
        }
    }

    pub fn set_tag_inactive(&mut self, tag: &str, listener: &mut dyn TagListener) {
        if !self.active_tags.remove(tag) {
            return;
        }
        tracing::debug!(%tag, "Tag now inactive");
        for ((item, t), count) in self.match_counts.iter() {
            if t == tag && *count > 0 {
                listener.tag_match_stopped(tag, item);
            }
        }
    }

    /// Sets the profiles an endpoint references; `None` deletes the
    /// endpoint.
    pub fn update_endpoint(
        &mut self,
        item: EndpointKey,
        profile_ids: Option<Vec<String>>,
        listener: &mut dyn TagListener,
    ) {
        let old = self.profile_ids_by_endpoint.remove(&item).unwrap_or_default();
        let new = profile_ids.unwrap_or_default();

        for profile in &old {
            self.endpoints_by_profile.remove(profile, &item);
        }
        for profile in &new {
            self.endpoints_by_profile.insert(profile.clone(), item.clone());
        }

        // Adjust counts for the symmetric difference of the profile lists.
        for profile in old.iter().filter(|&p| !new.contains(p)) {
            for tag in self.tags_by_profile.get(profile).cloned().unwrap_or_default() {
                decref(
                    &mut self.match_counts,
                    &self.active_tags,
                    listener,
                    &item,
                    &tag,
                );
            }
        }
        for profile in new.iter().filter(|&p| !old.contains(p)) {
            for tag in self.tags_by_profile.get(profile).cloned().unwrap_or_default() {
                incref(
                    &mut self.match_counts,
                    &self.active_tags,
                    listener,
                    &item,
                    &tag,
                );
            }
        }

        if !new.is_empty() {
            self.profile_ids_by_endpoint.insert(item, new);
        }
    }

    /// Sets the tags a profile declares; `None` deletes the profile's tags.
    pub fn update_profile_tags(
        &mut self,
        profile: &str,
        tags: Option<Vec<String>>,
        listener: &mut dyn TagListener,
    ) {
        let old = self
            .tags_by_profile
            .remove(profile)
            .unwrap_or_default();
        let new = tags.unwrap_or_default();

        let endpoints: Vec<EndpointKey> = self
            .endpoints_by_profile
            .get(&profile.to_string())
            .cloned()
            .collect();
        for item in &endpoints {
            for tag in old.iter().filter(|&t| !new.contains(t)) {
                decref(
                    &mut self.match_counts,
                    &self.active_tags,
                    listener,
                    item,
                    tag,
                );
            }
            for tag in new.iter().filter(|&t| !old.contains(t)) {
                incref(
                    &mut self.match_counts,
                    &self.active_tags,
                    listener,
                    item,
                    tag,
                );
            }
        }

        if !new.is_empty() {
            self.tags_by_profile.insert(profile.to_string(), new);
        }
    }
}

fn incref(
    counts: &mut HashMap<(EndpointKey, String), usize>,
    active: &ahash::AHashSet<String>,
    listener: &mut dyn TagListener,
    item: &EndpointKey,
    tag: &str,
) {
    let count = counts
        .entry((item.clone(), tag.to_string()))
        .or_insert(0);
    *count += 1;
    if *count == 1 && active.contains(tag) {
        listener.tag_match_started(tag, item);
    }
}

fn decref(
    counts: &mut HashMap<(EndpointKey, String), usize>,
    active: &ahash::AHashSet<String>,
    listener: &mut dyn TagListener,
    item: &EndpointKey,
    tag: &str,
) {
    let key = (item.clone(), tag.to_string());
    let count = match counts.get_mut(&key) {
        Some(count) => count,
        None => return,
    };
    *count -= 1;
    if *count == 0 {
        counts.remove(&key);
        if active.contains(tag) {
            listener.tag_match_stopped(tag, item);
        }
    }
}
