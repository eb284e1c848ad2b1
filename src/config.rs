//! Per-plugin load configuration and the persisted settings document.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::host::ConfigStore;

static NEXT_CONFIG_ID: AtomicU64 = AtomicU64::new(1);

/// Session-local handle to one [`PluginLoadConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigId(u64);

impl ConfigId {
    fn next() -> Self {
        Self(NEXT_CONFIG_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConfigId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How one plugin file is loaded.
///
/// Only `file_path`, `load_at_startup` and `auto_reload` are persisted; the
/// remaining state lives for the current session only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PluginLoadConfig {
    #[serde(skip, default = "ConfigId::next")]
    id: ConfigId,

    /// Path of the plugin module.
    pub file_path: PathBuf,

    /// Load the plugin when the host starts.
    #[serde(default)]
    pub load_at_startup: bool,

    /// Reload the plugin when its file changes.
    #[serde(default)]
    pub auto_reload: bool,

    #[serde(skip)]
    pub(crate) loaded: bool,
    #[serde(skip)]
    pub(crate) file_size: u64,
    #[serde(skip)]
    pub(crate) file_changed: Option<SystemTime>,
    #[serde(skip)]
    pub(crate) internal_name: Option<String>,
    #[serde(skip)]
    pub(crate) pending_load: bool,
    #[serde(skip)]
    pub(crate) pending_unload: bool,
    #[serde(skip)]
    pub(crate) pending_reload: bool,
}

impl PluginLoadConfig {
    /// Create a config for `file_path`.
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            id: ConfigId::next(),
            file_path: file_path.into(),
            load_at_startup: false,
            auto_reload: false,
            loaded: false,
            file_size: 0,
            file_changed: None,
            internal_name: None,
            pending_load: false,
            pending_unload: false,
            pending_reload: false,
        }
    }

    /// Set load at startup.
    pub fn with_load_at_startup(mut self, enabled: bool) -> Self {
        self.load_at_startup = enabled;
        self
    }

    /// Set auto reload.
    pub fn with_auto_reload(mut self, enabled: bool) -> Self {
        self.auto_reload = enabled;
        self
    }

    /// Session-local id.
    pub fn id(&self) -> ConfigId {
        self.id
    }

    /// Whether the plugin is currently loaded.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Size of the file at the last successful load.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Modification time of the file at the last successful load.
    pub fn file_changed(&self) -> Option<SystemTime> {
        self.file_changed
    }

    /// Internal name of the loaded plugin.
    pub fn internal_name(&self) -> Option<&str> {
        self.internal_name.as_deref()
    }

    /// Whether a load is pending.
    pub fn pending_load(&self) -> bool {
        self.pending_load
    }

    /// Whether an unload is pending.
    pub fn pending_unload(&self) -> bool {
        self.pending_unload
    }

    /// Whether a reload is pending.
    pub fn pending_reload(&self) -> bool {
        self.pending_reload
    }

    /// Check if any action is pending.
    pub fn has_pending(&self) -> bool {
        self.pending_load || self.pending_unload || self.pending_reload
    }

    /// Request a load on a later tick.
    pub fn request_load(&mut self) {
        self.clear_pending();
        self.pending_load = true;
    }

    /// Request an unload on a later tick.
    pub fn request_unload(&mut self) {
        self.clear_pending();
        self.pending_unload = true;
    }

    /// Request a reload on a later tick.
    pub fn request_reload(&mut self) {
        self.clear_pending();
        self.pending_reload = true;
    }

    /// Clear every pending action.
    pub fn clear_pending(&mut self) {
        self.pending_load = false;
        self.pending_unload = false;
        self.pending_reload = false;
    }

    pub(crate) fn mark_loaded(
        &mut self,
        internal_name: &str,
        file_size: u64,
        file_changed: Option<SystemTime>,
    ) {
        self.loaded = true;
        self.internal_name = Some(internal_name.to_string());
        self.file_size = file_size;
        self.file_changed = file_changed;
    }

    pub(crate) fn mark_unloaded(&mut self) {
        self.loaded = false;
    }

    /// Key used to unload this plugin: the recorded internal name, or the
    /// file stem if it never loaded.
    pub(crate) fn unload_key(&self) -> String {
        self.internal_name
            .clone()
            .unwrap_or_else(|| internal_name_for(&self.file_path))
    }
}

/// Internal name of the plugin loaded from `path`.
pub fn internal_name_for(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// The loader's persisted settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LoaderSettings {
    /// Document version.
    #[serde(default)]
    pub version: u32,

    /// Configured plugins, in display order.
    #[serde(default)]
    pub plugins: Vec<PluginLoadConfig>,
}

impl LoaderSettings {
    /// Create empty settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the settings saved under `namespace`, or empty settings.
    pub fn load(store: &dyn ConfigStore, namespace: &str) -> Result<Self> {
        match store.load(namespace)? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Self::default()),
        }
    }

    /// Save the settings under `namespace`.
    pub fn save(&self, store: &dyn ConfigStore, namespace: &str) -> Result<()> {
        let value = serde_json::to_value(self)?;
        store.save(namespace, &value)
    }

    /// Parse from a JSON string.
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse from a TOML string.
    #[cfg(feature = "toml")]
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config_store(e.to_string()))
    }

    /// Serialize to a TOML string.
    #[cfg(feature = "toml")]
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::config_store(e.to_string()))
    }

    /// Append a config for `file_path`.
    pub fn add(&mut self, file_path: impl Into<PathBuf>) -> ConfigId {
        let config = PluginLoadConfig::new(file_path);
        let id = config.id();
        self.plugins.push(config);
        id
    }

    /// Append an existing config.
    pub fn push(&mut self, config: PluginLoadConfig) -> ConfigId {
        let id = config.id();
        self.plugins.push(config);
        id
    }

    /// Remove a config. Loaded plugins must be unloaded first.
    pub fn remove(&mut self, id: ConfigId) -> Result<PluginLoadConfig> {
        let index = self
            .plugins
            .iter()
            .position(|c| c.id == id)
            .ok_or(Error::ConfigNotFound(id.get()))?;
        if self.plugins[index].loaded {
            return Err(Error::ConfigInUse(id.get()));
        }
        Ok(self.plugins.remove(index))
    }

    /// Get a config by id.
    pub fn get(&self, id: ConfigId) -> Option<&PluginLoadConfig> {
        self.plugins.iter().find(|c| c.id == id)
    }

    /// Get a mutable config by id.
    pub fn get_mut(&mut self, id: ConfigId) -> Option<&mut PluginLoadConfig> {
        self.plugins.iter_mut().find(|c| c.id == id)
    }

    /// Find the config whose plugin has this internal name.
    pub fn find_by_internal_name(&self, internal_name: &str) -> Option<&PluginLoadConfig> {
        self.plugins
            .iter()
            .find(|c| c.internal_name.as_deref() == Some(internal_name))
    }

    /// Iterate over configs.
    pub fn iter(&self) -> impl Iterator<Item = &PluginLoadConfig> {
        self.plugins.iter()
    }

    /// Number of configs.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Check if no plugin is configured.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryConfigStore;

    #[test]
    fn test_internal_name_is_file_stem() {
        assert_eq!(internal_name_for(Path::new("plugins/Foo.dll")), "Foo");
        assert_eq!(internal_name_for(Path::new("libbar.so")), "libbar");
    }

    #[test]
    fn test_request_flags_are_exclusive() {
        let mut config = PluginLoadConfig::new("Foo.so");
        config.request_load();
        assert!(config.pending_load());

        config.request_reload();
        assert!(config.pending_reload());
        assert!(!config.pending_load());

        config.clear_pending();
        assert!(!config.has_pending());
    }

    #[test]
    fn test_persistence_roundtrip_resets_transient_state() {
        let store = MemoryConfigStore::new();
        let mut settings = LoaderSettings::new();
        let id = settings.push(
            PluginLoadConfig::new("plugins/Foo.so")
                .with_load_at_startup(true)
                .with_auto_reload(true),
        );
        {
            let config = settings.get_mut(id).unwrap();
            config.mark_loaded("Foo", 4096, Some(SystemTime::now()));
            config.request_reload();
        }

        settings.save(&store, "loader").unwrap();
        let restored = LoaderSettings::load(&store, "loader").unwrap();

        let config = &restored.plugins[0];
        assert_eq!(config.file_path, PathBuf::from("plugins/Foo.so"));
        assert!(config.load_at_startup);
        assert!(config.auto_reload);
        assert!(!config.is_loaded());
        assert_eq!(config.file_size(), 0);
        assert!(config.file_changed().is_none());
        assert!(config.internal_name().is_none());
        assert!(!config.has_pending());
        assert_ne!(config.id(), id);
    }

    #[test]
    fn test_json_field_names() {
        let mut settings = LoaderSettings::new();
        settings.add("Foo.so");

        let json = settings.to_json().unwrap();
        assert!(json.contains("\"file-path\""));
        assert!(json.contains("\"load-at-startup\""));
        assert!(!json.contains("loaded"));

        let parsed = LoaderSettings::from_json(r#"{"plugins": [{"file-path": "Bar.so"}]}"#).unwrap();
        assert_eq!(parsed.plugins[0].file_path, PathBuf::from("Bar.so"));
        assert!(!parsed.plugins[0].auto_reload);
    }

    #[cfg(feature = "toml")]
    #[test]
    fn test_toml_roundtrip() {
        let mut settings = LoaderSettings::new();
        let id = settings.add("Foo.so");
        settings.get_mut(id).unwrap().auto_reload = true;

        let toml = settings.to_toml().unwrap();
        let parsed = LoaderSettings::from_toml(&toml).unwrap();
        assert_eq!(parsed.plugins[0].file_path, PathBuf::from("Foo.so"));
        assert!(parsed.plugins[0].auto_reload);
    }

    #[test]
    fn test_remove_requires_unloaded() {
        let mut settings = LoaderSettings::new();
        let id = settings.add("Foo.so");
        settings.get_mut(id).unwrap().mark_loaded("Foo", 1, None);

        assert!(matches!(settings.remove(id), Err(Error::ConfigInUse(_))));

        settings.get_mut(id).unwrap().mark_unloaded();
        assert!(settings.remove(id).is_ok());
        assert!(settings.is_empty());
        assert!(matches!(settings.remove(id), Err(Error::ConfigNotFound(_))));
    }
}
