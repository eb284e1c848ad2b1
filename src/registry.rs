//! The host's registry of loaded plugin instances.

use parking_lot::Mutex;

use crate::module::ModuleId;
use crate::plugin::{Plugin, PluginDefinition, PluginHost};

/// A plugin instance registered with the host.
pub struct LoadedPluginRecord {
    instance: Box<dyn Plugin>,
    definition: PluginDefinition,
    host: PluginHost,
    module: Option<ModuleId>,
    module_name: String,
    live: bool,
}

impl LoadedPluginRecord {
    /// Record for a plugin the host loaded itself.
    pub fn new(
        instance: Box<dyn Plugin>,
        definition: PluginDefinition,
        host: PluginHost,
        module_name: impl Into<String>,
    ) -> Self {
        Self {
            instance,
            definition,
            host,
            module: None,
            module_name: module_name.into(),
            live: false,
        }
    }

    pub(crate) fn live(
        instance: Box<dyn Plugin>,
        definition: PluginDefinition,
        host: PluginHost,
        module: ModuleId,
        module_name: impl Into<String>,
    ) -> Self {
        Self {
            instance,
            definition,
            host,
            module: Some(module),
            module_name: module_name.into(),
            live: true,
        }
    }

    /// Registry metadata.
    pub fn definition(&self) -> &PluginDefinition {
        &self.definition
    }

    /// Host handle the plugin was initialized with.
    pub fn host(&self) -> &PluginHost {
        &self.host
    }

    /// Module the instance was created from, when loaded by this crate.
    pub fn module(&self) -> Option<ModuleId> {
        self.module
    }

    /// Name of the owning module.
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// Whether this crate loaded the plugin (as opposed to the host).
    pub fn is_live(&self) -> bool {
        self.live
    }

    pub(crate) fn into_instance(self) -> Box<dyn Plugin> {
        self.instance
    }
}

impl std::fmt::Debug for LoadedPluginRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPluginRecord")
            .field("definition", &self.definition)
            .field("module", &self.module)
            .field("module_name", &self.module_name)
            .field("live", &self.live)
            .finish()
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Total plugins registered.
    pub total: usize,
    /// Plugins loaded by this crate.
    pub live: usize,
    /// Plugins loaded by the host.
    pub hosted: usize,
}

/// Ordered collection of loaded plugins shared between the host and the
/// loader.
///
/// Records are only ever pushed and taken; plugin code is never called while
/// the registry lock is held.
#[derive(Default)]
pub struct PluginRegistry {
    records: Mutex<Vec<LoadedPluginRecord>>,
}

impl PluginRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record.
    pub fn push(&self, record: LoadedPluginRecord) {
        self.records.lock().push(record);
    }

    /// Remove and return the first record with this internal name.
    pub fn take(&self, internal_name: &str) -> Option<LoadedPluginRecord> {
        let mut records = self.records.lock();
        let index = records
            .iter()
            .position(|r| r.definition.internal_name == internal_name)?;
        Some(records.remove(index))
    }

    /// Check if a record with this internal name exists.
    pub fn contains(&self, internal_name: &str) -> bool {
        self.records
            .lock()
            .iter()
            .any(|r| r.definition.internal_name == internal_name)
    }

    /// Check if any registered instance came from a module with this name.
    pub fn contains_module(&self, module_name: &str) -> bool {
        self.records
            .lock()
            .iter()
            .any(|r| r.module_name == module_name)
    }

    /// Definition of the record with this internal name.
    pub fn definition(&self, internal_name: &str) -> Option<PluginDefinition> {
        self.records
            .lock()
            .iter()
            .find(|r| r.definition.internal_name == internal_name)
            .map(|r| r.definition.clone())
    }

    /// Host handle of the record with this internal name.
    pub fn host(&self, internal_name: &str) -> Option<PluginHost> {
        self.records
            .lock()
            .iter()
            .find(|r| r.definition.internal_name == internal_name)
            .map(|r| r.host.clone())
    }

    /// Module of the record with this internal name.
    pub fn module_of(&self, internal_name: &str) -> Option<ModuleId> {
        self.records
            .lock()
            .iter()
            .find(|r| r.definition.internal_name == internal_name)
            .and_then(|r| r.module)
    }

    /// Count records with this internal name.
    pub fn count(&self, internal_name: &str) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| r.definition.internal_name == internal_name)
            .count()
    }

    /// All internal names, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .map(|r| r.definition.internal_name.clone())
            .collect()
    }

    /// Internal names of records loaded by this crate.
    pub fn live_names(&self) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.live)
            .map(|r| r.definition.internal_name.clone())
            .collect()
    }

    /// All definitions, in registration order.
    pub fn definitions(&self) -> Vec<PluginDefinition> {
        self.records
            .lock()
            .iter()
            .map(|r| r.definition.clone())
            .collect()
    }

    /// Get plugin count.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Get registry statistics.
    pub fn stats(&self) -> RegistryStats {
        let records = self.records.lock();
        let live = records.iter().filter(|r| r.live).count();
        RegistryStats {
            total: records.len(),
            live,
            hosted: records.len() - live,
        }
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugin_count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryConfigStore;
    use crate::plugin::PluginError;
    use std::sync::Arc;

    struct Stub(&'static str);

    impl Plugin for Stub {
        fn name(&self) -> &str {
            self.0
        }

        fn initialize(&mut self, _host: PluginHost) -> Result<(), PluginError> {
            Ok(())
        }

        fn dispose(&mut self) -> Result<(), PluginError> {
            Ok(())
        }
    }

    fn hosted(internal_name: &'static str, module: &str) -> LoadedPluginRecord {
        let host = PluginHost::new("host", module, Arc::new(MemoryConfigStore::new()));
        let definition = PluginDefinition::live(internal_name, internal_name, "1.0.0", "test");
        LoadedPluginRecord::new(Box::new(Stub(internal_name)), definition, host, module)
    }

    #[test]
    fn test_registry_creation() {
        let registry = PluginRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_push_and_take() {
        let registry = PluginRegistry::new();
        registry.push(hosted("Foo", "FooModule"));
        registry.push(hosted("Bar", "BarModule"));

        assert!(registry.contains("Foo"));
        assert!(registry.contains_module("BarModule"));
        assert_eq!(registry.names(), vec!["Foo", "Bar"]);

        let record = registry.take("Foo").unwrap();
        assert_eq!(record.definition().internal_name, "Foo");
        assert!(!record.is_live());
        assert!(!registry.contains("Foo"));
        assert!(registry.take("Foo").is_none());
    }

    #[test]
    fn test_registry_stats() {
        let registry = PluginRegistry::new();
        registry.push(hosted("Foo", "Foo"));

        let host = PluginHost::new("host", "Bar", Arc::new(MemoryConfigStore::new()));
        let definition = PluginDefinition::live("Bar", "Bar", "1.0.0", "test");
        registry.push(LoadedPluginRecord::live(
            Box::new(Stub("Bar")),
            definition,
            host,
            ModuleId::next(),
            "Bar",
        ));

        let stats = registry.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.live, 1);
        assert_eq!(stats.hosted, 1);
        assert_eq!(registry.live_names(), vec!["Bar"]);
    }
}
