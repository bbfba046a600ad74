//! The interface to the process's configuration module.
//!
//! Config parsing and defaulting live outside the engine; the sequencer
//! feeds datastore config snapshots through this trait and forwards the
//! merged result downstream when anything changed.

use anyhow::Result;
use std::collections::BTreeMap;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    DatastoreGlobal,
    DatastorePerHost,
}

pub trait ConfigResolver {
    /// Merges a config snapshot from the given source. Returns whether the
    /// effective config changed; parse failures are fatal to the caller.
    fn update_from(
        &mut self,
        values: &BTreeMap<String, String>,
        source: ConfigSource,
    ) -> Result<bool>;

    /// The merged snapshot sent in `ConfigUpdate` messages.
    fn raw_values(&self) -> BTreeMap<String, String>;
}
