//! Host adapter: the registry and configuration store the host exposes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::registry::PluginRegistry;
use crate::resolver::Resolver;

/// Namespaced persistence supplied by the host.
pub trait ConfigStore: Send + Sync {
    /// Load the document stored under `namespace`.
    fn load(&self, namespace: &str) -> Result<Option<Value>>;

    /// Replace the document stored under `namespace`.
    fn save(&self, namespace: &str, value: &Value) -> Result<()>;
}

/// Config store kept in memory for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    entries: DashMap<String, Value>,
}

impl MemoryConfigStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of namespaces with a saved document.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing has been saved.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self, namespace: &str) -> Result<Option<Value>> {
        Ok(self.entries.get(namespace).map(|v| v.value().clone()))
    }

    fn save(&self, namespace: &str, value: &Value) -> Result<()> {
        self.entries.insert(namespace.to_string(), value.clone());
        Ok(())
    }
}

/// On-disk format for [`DirectoryConfigStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// Pretty-printed JSON.
    Json,
    /// TOML.
    #[cfg(feature = "toml")]
    Toml,
}

impl ConfigFormat {
    fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            #[cfg(feature = "toml")]
            Self::Toml => "toml",
        }
    }

    fn parse(self, content: &str) -> Result<Value> {
        match self {
            Self::Json => Ok(serde_json::from_str(content)?),
            #[cfg(feature = "toml")]
            Self::Toml => toml::from_str(content).map_err(|e| Error::config_store(e.to_string())),
        }
    }

    fn render(self, value: &Value) -> Result<String> {
        match self {
            Self::Json => Ok(serde_json::to_string_pretty(value)?),
            #[cfg(feature = "toml")]
            Self::Toml => {
                toml::to_string_pretty(value).map_err(|e| Error::config_store(e.to_string()))
            }
        }
    }
}

/// Config store writing one file per namespace under a root directory.
#[derive(Debug, Clone)]
pub struct DirectoryConfigStore {
    root: PathBuf,
    format: ConfigFormat,
}

impl DirectoryConfigStore {
    /// Create a JSON store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            format: ConfigFormat::Json,
        }
    }

    /// Set the file format.
    pub fn with_format(mut self, format: ConfigFormat) -> Self {
        self.format = format;
        self
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File backing `namespace`.
    pub fn path_for(&self, namespace: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", namespace, self.format.extension()))
    }
}

impl ConfigStore for DirectoryConfigStore {
    fn load(&self, namespace: &str) -> Result<Option<Value>> {
        let path = self.path_for(namespace);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        self.format.parse(&content).map(Some)
    }

    fn save(&self, namespace: &str, value: &Value) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        let content = self.format.render(value)?;
        std::fs::write(self.path_for(namespace), content)?;
        Ok(())
    }
}

/// Adapter the host implements to expose its plugin machinery.
pub trait HostBindings: Send + Sync {
    /// Name of the host, passed to every plugin's host handle.
    fn host_name(&self) -> String;

    /// The host's shared plugin registry.
    fn plugin_registry(&self) -> Option<Arc<PluginRegistry>>;

    /// The host's configuration store.
    fn config_store(&self) -> Option<Arc<dyn ConfigStore>>;

    /// Resolver consulted when no plugin directory satisfies a lookup.
    fn fallback_resolver(&self) -> Option<Arc<dyn Resolver>> {
        None
    }
}

/// Handles obtained from the host at startup.
#[derive(Clone)]
pub struct HostBinding {
    host_name: String,
    registry: Arc<PluginRegistry>,
    store: Arc<dyn ConfigStore>,
    fallback: Option<Arc<dyn Resolver>>,
}

impl HostBinding {
    /// Name of the host.
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// The host's plugin registry.
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// The host's configuration store.
    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    /// The host's fallback resolver, if it has one.
    pub fn fallback_resolver(&self) -> Option<&Arc<dyn Resolver>> {
        self.fallback.as_ref()
    }
}

impl std::fmt::Debug for HostBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBinding")
            .field("host_name", &self.host_name)
            .field("registry", &self.registry)
            .field("fallback_resolver", &self.fallback.is_some())
            .finish()
    }
}

/// Locates the host bindings once, at startup.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostBindingLocator;

impl HostBindingLocator {
    /// Obtain every required handle or fail with
    /// [`Error::HostBindingUnavailable`].
    pub fn locate(host: &dyn HostBindings) -> Result<HostBinding> {
        let registry = host
            .plugin_registry()
            .ok_or_else(|| Self::unavailable("plugin registry"))?;
        let store = host
            .config_store()
            .ok_or_else(|| Self::unavailable("configuration store"))?;

        let host_name = host.host_name();
        tracing::debug!("Located host bindings for {}", host_name);

        Ok(HostBinding {
            host_name,
            registry,
            store,
            fallback: host.fallback_resolver(),
        })
    }

    fn unavailable(what: &str) -> Error {
        tracing::error!("Failed to setup: host does not expose its {}", what);
        Error::HostBindingUnavailable(what.to_string())
    }
}

/// Ready-made [`HostBindings`] for hosts that own their handles directly.
#[derive(Clone, Default)]
pub struct HostContext {
    name: String,
    registry: Option<Arc<PluginRegistry>>,
    store: Option<Arc<dyn ConfigStore>>,
    fallback: Option<Arc<dyn Resolver>>,
}

impl HostContext {
    /// Create a context with no handles.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the plugin registry.
    pub fn with_registry(mut self, registry: Arc<PluginRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the configuration store.
    pub fn with_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the fallback resolver.
    pub fn with_fallback_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.fallback = Some(resolver);
        self
    }
}

impl HostBindings for HostContext {
    fn host_name(&self) -> String {
        self.name.clone()
    }

    fn plugin_registry(&self) -> Option<Arc<PluginRegistry>> {
        self.registry.clone()
    }

    fn config_store(&self) -> Option<Arc<dyn ConfigStore>> {
        self.store.clone()
    }

    fn fallback_resolver(&self) -> Option<Arc<dyn Resolver>> {
        self.fallback.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_locate_requires_registry_and_store() {
        let host = HostContext::new("host");
        let err = HostBindingLocator::locate(&host).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("plugin registry"));

        let host = host.with_registry(Arc::new(PluginRegistry::new()));
        let err = HostBindingLocator::locate(&host).unwrap_err();
        assert!(err.to_string().contains("configuration store"));

        let host = host.with_store(Arc::new(MemoryConfigStore::new()));
        let binding = HostBindingLocator::locate(&host).unwrap();
        assert_eq!(binding.host_name(), "host");
        assert!(binding.fallback_resolver().is_none());
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryConfigStore::new();
        assert!(store.load("a").unwrap().is_none());

        store.save("a", &json!({"x": 1})).unwrap();
        assert_eq!(store.load("a").unwrap(), Some(json!({"x": 1})));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_directory_store_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryConfigStore::new(dir.path().join("configs"));

        assert!(store.load("loader").unwrap().is_none());
        store.save("loader", &json!({"plugins": []})).unwrap();

        assert!(store.path_for("loader").ends_with("loader.json"));
        assert_eq!(store.load("loader").unwrap(), Some(json!({"plugins": []})));
    }

    #[cfg(feature = "toml")]
    #[test]
    fn test_directory_store_toml() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryConfigStore::new(dir.path()).with_format(ConfigFormat::Toml);

        let value = json!({"plugins": [{"file-path": "Foo.so", "auto-reload": true}]});
        store.save("loader", &value).unwrap();

        assert!(store.path_for("loader").ends_with("loader.toml"));
        assert_eq!(store.load("loader").unwrap(), Some(value));
    }
}
