//! The runtime a host embeds to load, reload and unload plugins.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{ConfigId, LoaderSettings, PluginLoadConfig};
use crate::error::{Error, Result};
use crate::host::{HostBindingLocator, HostBindings};
use crate::ledger::{ErrorGroup, ErrorLedger, LoadErrorId};
use crate::lifecycle::{LifecycleEvent, LifecycleManager, LoadReport};
use crate::loader::LoaderConfig;
use crate::module::ModuleBackend;
use crate::queue::{RequestQueue, TickOutcome};
use crate::registry::PluginRegistry;
use crate::watcher::{ChangeWatcher, WatchConfig, WatchTargets, WatcherState};

#[cfg(feature = "metrics-prometheus")]
use crate::metrics::PluginMetrics;

/// Namespace the loader settings are persisted under by default.
pub const DEFAULT_SETTINGS_NAMESPACE: &str = "live-plugin-loader";

/// Configuration for the plugin runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Loader configuration.
    pub loader: LoaderConfig,
    /// Change watcher configuration.
    pub watch: WatchConfig,
    /// Config store namespace of the loader settings.
    pub settings_namespace: String,
    /// Metrics collector attached to the lifecycle manager.
    #[cfg(feature = "metrics-prometheus")]
    pub metrics: Option<Arc<PluginMetrics>>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            loader: LoaderConfig::default(),
            watch: WatchConfig::default(),
            settings_namespace: DEFAULT_SETTINGS_NAMESPACE.to_string(),
            #[cfg(feature = "metrics-prometheus")]
            metrics: None,
        }
    }
}

impl RuntimeConfig {
    /// Create a new runtime configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the loader configuration.
    pub fn with_loader(mut self, loader: LoaderConfig) -> Self {
        self.loader = loader;
        self
    }

    /// Set the watcher configuration.
    pub fn with_watch(mut self, watch: WatchConfig) -> Self {
        self.watch = watch;
        self
    }

    /// Set the settings namespace.
    pub fn with_settings_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.settings_namespace = namespace.into();
        self
    }

    /// Attach a metrics collector.
    #[cfg(feature = "metrics-prometheus")]
    pub fn with_metrics(mut self, metrics: Arc<PluginMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Live plugin loading for one host.
///
/// Everything except the change watcher runs on the thread that calls
/// [`tick`](Self::tick); the host calls it once per update.
pub struct LivePluginRuntime {
    config: RuntimeConfig,
    lifecycle: LifecycleManager,
    settings: LoaderSettings,
    queue: RequestQueue,
    targets: WatchTargets,
    watcher: ChangeWatcher,
    shut_down: bool,
}

impl LivePluginRuntime {
    /// Bind to the host, restore the saved settings and start watching.
    ///
    /// Fails with [`Error::HostBindingUnavailable`] if the host does not
    /// expose its registry or config store; nothing is loaded or watched in
    /// that case.
    pub fn start(
        host: &dyn HostBindings,
        backend: Arc<dyn ModuleBackend>,
        config: RuntimeConfig,
    ) -> Result<Self> {
        let binding = HostBindingLocator::locate(host)?;

        let settings = match LoaderSettings::load(binding.store().as_ref(), &config.settings_namespace) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!("Failed to read loader settings, starting empty: {}", e);
                LoaderSettings::new()
            }
        };

        let lifecycle = LifecycleManager::new(binding, backend, config.loader.clone());
        #[cfg(feature = "metrics-prometheus")]
        let lifecycle = match &config.metrics {
            Some(metrics) => lifecycle.with_metrics(metrics.clone()),
            None => lifecycle,
        };

        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let targets = WatchTargets::new();
        targets.publish(&settings);

        let mut watcher = ChangeWatcher::new(config.watch.clone(), targets.clone(), events_tx);
        watcher.start()?;

        tracing::info!(
            "Live plugin loader started for {} with {} configured plugins",
            lifecycle.binding().host_name(),
            settings.len()
        );

        Ok(Self {
            config,
            lifecycle,
            settings,
            queue: RequestQueue::new(events_rx),
            targets,
            watcher,
            shut_down: false,
        })
    }

    /// Get the runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Serve pending requests. Call once per host update.
    pub fn tick(&mut self) -> TickOutcome {
        let outcome = self.queue.tick(&mut self.settings, &self.lifecycle);
        self.targets.publish(&self.settings);
        outcome
    }

    /// The "load plugin from path" command.
    ///
    /// Empty arguments are ignored; anything else is used verbatim as the
    /// path, without a config.
    pub fn load_command(&self, arguments: &str) -> Option<Result<LoadReport>> {
        if arguments.trim().is_empty() {
            tracing::debug!("Load command called without a path");
            return None;
        }

        let result = self.lifecycle.load(Path::new(arguments), None);
        if let Err(e) = &result {
            tracing::error!("Load command failed: {}", e);
        }
        Some(result)
    }

    /// Add a plugin file to the settings.
    pub fn add_plugin(&mut self, file_path: impl Into<PathBuf>) -> Result<ConfigId> {
        let id = self.settings.add(file_path);
        self.settings_changed()?;
        Ok(id)
    }

    /// Remove a plugin from the settings. Its plugin must be unloaded.
    pub fn remove_plugin(&mut self, id: ConfigId) -> Result<PluginLoadConfig> {
        let removed = self.settings.remove(id)?;
        self.settings_changed()?;
        Ok(removed)
    }

    /// Change the file a config loads.
    pub fn set_file_path(&mut self, id: ConfigId, file_path: impl Into<PathBuf>) -> Result<()> {
        self.config_mut(id)?.file_path = file_path.into();
        self.settings_changed()
    }

    /// Change whether a config loads at startup.
    pub fn set_load_at_startup(&mut self, id: ConfigId, enabled: bool) -> Result<()> {
        self.config_mut(id)?.load_at_startup = enabled;
        self.settings_changed()
    }

    /// Change whether a config reloads on file changes.
    pub fn set_auto_reload(&mut self, id: ConfigId, enabled: bool) -> Result<()> {
        self.config_mut(id)?.auto_reload = enabled;
        self.settings_changed()
    }

    /// Load a config's plugin on a later tick.
    pub fn request_load(&mut self, id: ConfigId) -> Result<()> {
        self.config_mut(id)?.request_load();
        Ok(())
    }

    /// Unload a config's plugin on a later tick.
    pub fn request_unload(&mut self, id: ConfigId) -> Result<()> {
        self.config_mut(id)?.request_unload();
        Ok(())
    }

    /// Reload a config's plugin over the next ticks.
    pub fn request_reload(&mut self, id: ConfigId) -> Result<()> {
        self.config_mut(id)?.request_reload();
        Ok(())
    }

    /// Persist the settings.
    pub fn save(&self) -> Result<()> {
        self.settings.save(
            self.lifecycle.binding().store().as_ref(),
            &self.config.settings_namespace,
        )
    }

    /// The loader settings.
    pub fn settings(&self) -> &LoaderSettings {
        &self.settings
    }

    /// One plugin config.
    pub fn plugin_config(&self, id: ConfigId) -> Option<&PluginLoadConfig> {
        self.settings.get(id)
    }

    /// The host's plugin registry.
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        self.lifecycle.registry()
    }

    /// The lifecycle manager.
    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    /// The load failure ledger.
    pub fn ledger(&self) -> &Arc<ErrorLedger> {
        self.lifecycle.ledger()
    }

    /// Open load failures, grouped by plugin name.
    pub fn open_errors(&self) -> Vec<ErrorGroup> {
        self.ledger().open_groups()
    }

    /// Dismiss a load failure and every other one for the same plugin.
    pub fn close_error(&self, id: LoadErrorId) -> usize {
        self.ledger().close(id)
    }

    /// State of the change watcher.
    pub fn watcher_state(&self) -> WatcherState {
        self.watcher.state()
    }

    /// Register a lifecycle event handler.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.lifecycle.on_event(handler);
    }

    /// Stop watching, unload every plugin this runtime loaded, and release
    /// the dependency resolver. Called on drop.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        self.watcher.stop();

        for config in self.settings.plugins.iter_mut().filter(|c| c.is_loaded()) {
            let key = config.unload_key();
            self.lifecycle.unload(&key, Some(config));
        }
        let remaining = self.lifecycle.unload_all();
        if remaining > 0 {
            tracing::debug!("Unloaded {} plugins loaded by command", remaining);
        }

        self.lifecycle.loader().release();
        tracing::info!("Live plugin loader shut down");
    }

    fn config_mut(&mut self, id: ConfigId) -> Result<&mut PluginLoadConfig> {
        self.settings
            .get_mut(id)
            .ok_or(Error::ConfigNotFound(id.get()))
    }

    fn settings_changed(&mut self) -> Result<()> {
        self.targets.publish(&self.settings);
        self.save()
    }
}

impl std::fmt::Debug for LivePluginRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivePluginRuntime")
            .field("config", &self.config)
            .field("plugins", &self.settings.len())
            .field("registry", self.registry())
            .field("watcher", &self.watcher.state())
            .finish()
    }
}

impl Drop for LivePluginRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostContext, MemoryConfigStore};
    use crate::native::NativeBackend;
    use std::time::Duration;

    fn backend() -> Arc<dyn ModuleBackend> {
        Arc::new(NativeBackend::with_shadow_root(std::env::temp_dir()))
    }

    #[test]
    fn test_runtime_config_builder() {
        let config = RuntimeConfig::new()
            .with_loader(LoaderConfig::new().with_loader_name("dev"))
            .with_watch(WatchConfig::new().with_interval(Duration::from_millis(50)))
            .with_settings_namespace("plugins");

        assert_eq!(config.loader.loader_name, "dev");
        assert_eq!(config.watch.interval, Duration::from_millis(50));
        assert_eq!(config.settings_namespace, "plugins");
        assert_eq!(RuntimeConfig::default().settings_namespace, DEFAULT_SETTINGS_NAMESPACE);
    }

    #[test]
    fn test_start_requires_host_bindings() {
        let host = HostContext::new("bare").with_store(Arc::new(MemoryConfigStore::new()));
        let err = LivePluginRuntime::start(&host, backend(), RuntimeConfig::default())
            .err()
            .unwrap();

        assert!(err.is_fatal());
        assert!(matches!(err, Error::HostBindingUnavailable(ref what) if what == "plugin registry"));
    }

    #[test]
    fn test_config_edits_are_persisted() {
        let store = Arc::new(MemoryConfigStore::new());
        let host = HostContext::new("host")
            .with_registry(Arc::new(PluginRegistry::new()))
            .with_store(store.clone());

        let mut runtime = LivePluginRuntime::start(&host, backend(), RuntimeConfig::default()).unwrap();
        assert_eq!(runtime.watcher_state(), WatcherState::Running);

        let id = runtime.add_plugin("plugins/Foo.so").unwrap();
        runtime.set_auto_reload(id, true).unwrap();
        runtime.set_load_at_startup(id, true).unwrap();
        runtime.request_reload(id).unwrap();

        let saved = LoaderSettings::load(store.as_ref(), DEFAULT_SETTINGS_NAMESPACE).unwrap();
        assert_eq!(saved.len(), 1);
        assert!(saved.plugins[0].auto_reload);
        assert!(saved.plugins[0].load_at_startup);
        assert!(!saved.plugins[0].has_pending());

        runtime.shutdown();
        assert_eq!(runtime.watcher_state(), WatcherState::Stopped);
    }

    #[test]
    fn test_unknown_config_is_an_error() {
        let host = HostContext::new("host")
            .with_registry(Arc::new(PluginRegistry::new()))
            .with_store(Arc::new(MemoryConfigStore::new()));
        let mut runtime = LivePluginRuntime::start(&host, backend(), RuntimeConfig::default()).unwrap();

        let id = runtime.add_plugin("Foo.so").unwrap();
        runtime.remove_plugin(id).unwrap();

        assert!(matches!(runtime.request_load(id), Err(Error::ConfigNotFound(_))));
        assert!(runtime.load_command("   ").is_none());
    }
}
