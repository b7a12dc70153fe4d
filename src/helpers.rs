//! Registry of host-provided helper functions.

use std::collections::BTreeMap;

/// Read-only mapping from helper name to the numeric id the execution
/// environment dispatches on.
///
/// The registry is injected into the loader by whoever embeds it; the loader
/// itself registers nothing. Names missing from the registry are deferred to
/// the execution environment unless the load runs with strict externals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HelperRegistry {
    map: BTreeMap<String, u32>,
}

impl HelperRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a helper; re-registering a name replaces the previous id
    pub fn register(&mut self, name: impl Into<String>, id: u32) {
        self.map.insert(name.into(), id);
    }

    /// Numeric id for `name`, if the execution environment exposes it
    pub fn resolve(&self, name: &str) -> Option<u32> {
        self.map.get(name).copied()
    }

    /// Iterate over all registered helpers
    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> + '_ {
        self.map.iter().map(|(name, id)| (name.as_str(), *id))
    }

    /// Number of registered helpers
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
