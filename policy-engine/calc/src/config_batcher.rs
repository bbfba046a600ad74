//! The config batcher.
//!
//! Collects global and this-host datastore config keys and holds them back
//! until the datastore is in sync, so the engine sees one coherent snapshot
//! per change set instead of a trickle of per-key updates. Also surfaces the
//! datastore ready flag.

use crate::{dispatch::{StatusHandler, UpdateHandler}, SharedCallbacks};
use std::collections::BTreeMap;
use warden_policy_core::model::{SyncStatus, Update};

pub struct ConfigBatcher {
    hostname: String,
    callbacks: SharedCallbacks,

    global: BTreeMap<String, String>,
    local: BTreeMap<String, String>,
    dirty: bool,
    datamodel_in_sync: bool,
}

// === impl ConfigBatcher ===

impl ConfigBatcher {
    pub fn new(hostname: String, callbacks: SharedCallbacks) -> Self {
        Self {
            hostname,
            callbacks,
            global: BTreeMap::new(),
            local: BTreeMap::new(),
            dirty: false,
            datamodel_in_sync: false,
        }
    }

    fn store(map: &mut BTreeMap<String, String>, name: &str, value: Option<&String>) -> bool {
        match value {
            Some(value) => map.insert(name.to_string(), value.clone()).as_ref() != Some(value),
            None => map.remove(name).is_some(),
        }
    }

    fn maybe_send(&mut self) {
        if !self.dirty || !self.datamodel_in_sync {
            return;
        }
        tracing::info!("Datastore config changed; sending snapshot");
        self.callbacks
            .borrow_mut()
            .on_config_update(self.global.clone(), self.local.clone());
        self.dirty = false;
    }
}

impl UpdateHandler for ConfigBatcher {
    fn on_update(&mut self, update: &Update) -> bool {
        match update {
            Update::GlobalConfig(name, value) => {
                if Self::store(&mut self.global, name, value.as_ref()) {
                    tracing::debug!(%name, "Global config updated");
                    self.dirty = true;
                }
            }
            Update::HostConfig {
                hostname,
                name,
                value,
            } => {
                if hostname != &self.hostname {
                    tracing::debug!(%hostname, %name, "Ignoring other host's config");
                } else if Self::store(&mut self.local, name, value.as_ref()) {
                    tracing::debug!(%name, "Per-host config updated");
                    self.dirty = true;
                }
            }
            Update::DatastoreReady(ready) => {
                if *ready != Some(true) {
                    tracing::warn!("Datastore no longer ready");
                    self.callbacks.borrow_mut().on_datastore_not_ready();
                }
            }
            _ => {}
        }
        self.maybe_send();
        false
    }
}

impl StatusHandler for ConfigBatcher {
    fn on_status(&mut self, status: SyncStatus) {
        match status {
            SyncStatus::InSync => {
                if !self.datamodel_in_sync {
                    tracing::info!("Datastore in sync; flushing config snapshot");
                    self.datamodel_in_sync = true;
                    self.dirty = true;
                }
            }
            SyncStatus::WaitForDatastore => {
                self.callbacks.borrow_mut().on_datastore_not_ready();
            }
            SyncStatus::ResyncInProgress => {}
        }
        self.maybe_send();
    }
}
