use crate::plugin::PluginInstance;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

pub mod metrics;

pub use metrics::Metrics;

/// Running plugins by name: the single source of truth for what is active.
///
/// Mutations come from the control flow only; management reads may arrive
/// from any task and never wait on plugin I/O.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: DashMap<String, Arc<PluginInstance>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert under the instance's name; hands the instance back if the name is taken.
    pub fn insert_new(
        &self,
        instance: Arc<PluginInstance>,
    ) -> Result<(), Arc<PluginInstance>> {
        match self.plugins.entry(instance.name().to_string()) {
            Entry::Occupied(_) => Err(instance),
            Entry::Vacant(slot) => {
                slot.insert(instance);
                Ok(())
            }
        }
    }

    pub fn remove(&self, name: &str) -> Option<Arc<PluginInstance>> {
        self.plugins.remove(name).map(|(_, instance)| instance)
    }

    pub fn get(&self, name: &str) -> Option<Arc<PluginInstance>> {
        self.plugins.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Registered names, sorted for stable output.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn instances(&self) -> Vec<Arc<PluginInstance>> {
        self.plugins.iter().map(|e| e.value().clone()).collect()
    }

    /// Remove every instance, returning them for teardown.
    pub fn drain(&self) -> Vec<Arc<PluginInstance>> {
        let names = self.names();
        names.iter().filter_map(|name| self.remove(name)).collect()
    }
}
