//! Plugin lifecycle management: load, unload, and duplicate handling against
//! the host registry.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::config::{internal_name_for, ConfigId, PluginLoadConfig};
use crate::error::{Error, Result};
use crate::host::HostBinding;
use crate::ledger::{ErrorLedger, LoadErrorId};
use crate::loader::{LoaderConfig, ModuleLoader};
use crate::module::{ModuleBackend, ModuleId};
use crate::plugin::{discard, guarded, PluginDefinition, PluginHost};
use crate::registry::{LoadedPluginRecord, PluginRegistry};
use crate::resolver::ResolverChain;

#[cfg(feature = "metrics-prometheus")]
use crate::metrics::PluginMetrics;

/// Lifecycle event for hooks.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// A plugin was initialized and registered.
    Loaded {
        /// Plugin display name.
        name: String,
        /// Plugin internal name.
        internal_name: String,
        /// Module the instance came from.
        module: ModuleId,
        /// Event time.
        at: Instant,
    },
    /// A plugin was removed from the registry and disposed.
    Unloaded {
        /// Plugin internal name.
        internal_name: String,
        /// Event time.
        at: Instant,
    },
    /// A plugin failed to construct or initialize.
    LoadFailed {
        /// Plugin display name.
        name: String,
        /// Failure detail.
        reason: String,
        /// Event time.
        at: Instant,
    },
    /// A load was rejected because its module is already registered.
    Rejected {
        /// Duplicate module name.
        module: String,
        /// Path of the rejected file.
        path: PathBuf,
        /// Event time.
        at: Instant,
    },
    /// A plugin's dispose hook failed.
    TeardownFailed {
        /// Plugin internal name.
        internal_name: String,
        /// Failure detail.
        reason: String,
        /// Event time.
        at: Instant,
    },
}

impl LifecycleEvent {
    /// Get the plugin or module name the event is about.
    pub fn plugin_name(&self) -> &str {
        match self {
            Self::Loaded { internal_name, .. } => internal_name,
            Self::Unloaded { internal_name, .. } => internal_name,
            Self::LoadFailed { name, .. } => name,
            Self::Rejected { module, .. } => module,
            Self::TeardownFailed { internal_name, .. } => internal_name,
        }
    }

    /// Get the event timestamp.
    pub fn timestamp(&self) -> Instant {
        match self {
            Self::Loaded { at, .. } => *at,
            Self::Unloaded { at, .. } => *at,
            Self::LoadFailed { at, .. } => *at,
            Self::Rejected { at, .. } => *at,
            Self::TeardownFailed { at, .. } => *at,
        }
    }

    /// Get the event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Loaded { .. } => "loaded",
            Self::Unloaded { .. } => "unloaded",
            Self::LoadFailed { .. } => "load_failed",
            Self::Rejected { .. } => "rejected",
            Self::TeardownFailed { .. } => "teardown_failed",
        }
    }

    /// Check if this event reports a failure.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::LoadFailed { .. } | Self::Rejected { .. } | Self::TeardownFailed { .. }
        )
    }
}

type Handler = Box<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// Hooks for lifecycle events.
#[derive(Default)]
pub struct LifecycleHooks {
    handlers: Vec<Handler>,
}

impl LifecycleHooks {
    /// Create new lifecycle hooks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a lifecycle event handler.
    pub fn on_event<F>(&mut self, handler: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    /// Emit a lifecycle event.
    pub fn emit(&self, event: LifecycleEvent) {
        for handler in &self.handlers {
            handler(&event);
        }
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Check if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Outcome of a successful [`LifecycleManager::load`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Module instance the plugins came from.
    pub module: ModuleId,
    /// Module name.
    pub module_name: String,
    /// Display names of the plugins registered.
    pub registered: Vec<String>,
    /// Ledger entries for plugins that failed.
    pub failed: Vec<LoadErrorId>,
}

impl LoadReport {
    /// Check if every exported plugin was registered.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Loads and unloads plugins against the host registry.
pub struct LifecycleManager {
    binding: HostBinding,
    loader: ModuleLoader,
    ledger: Arc<ErrorLedger>,
    hooks: RwLock<LifecycleHooks>,
    #[cfg(feature = "metrics-prometheus")]
    metrics: Option<Arc<PluginMetrics>>,
}

impl LifecycleManager {
    /// Create a lifecycle manager over the host's bindings.
    ///
    /// The host's fallback resolver, if any, is installed at the bottom of
    /// the resolver chain.
    pub fn new(binding: HostBinding, backend: Arc<dyn ModuleBackend>, config: LoaderConfig) -> Self {
        let resolvers = Arc::new(ResolverChain::new());
        if let Some(fallback) = binding.fallback_resolver() {
            resolvers.push(fallback.clone());
        }

        Self {
            binding,
            loader: ModuleLoader::new(config, backend, resolvers),
            ledger: Arc::new(ErrorLedger::new()),
            hooks: RwLock::new(LifecycleHooks::new()),
            #[cfg(feature = "metrics-prometheus")]
            metrics: None,
        }
    }

    /// Attach a metrics collector.
    #[cfg(feature = "metrics-prometheus")]
    pub fn with_metrics(mut self, metrics: Arc<PluginMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register a lifecycle event handler.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.hooks.write().on_event(handler);
    }

    /// The host bindings.
    pub fn binding(&self) -> &HostBinding {
        &self.binding
    }

    /// The host's plugin registry.
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        self.binding.registry()
    }

    /// The module loader.
    pub fn loader(&self) -> &ModuleLoader {
        &self.loader
    }

    /// The load failure ledger.
    pub fn ledger(&self) -> &Arc<ErrorLedger> {
        &self.ledger
    }

    /// Load the module at `path` and register every plugin it exports.
    ///
    /// A plugin already registered under the same internal name is unloaded
    /// first. Plugins that fail to construct or initialize are recorded in
    /// the ledger and discarded; the load itself still succeeds.
    pub fn load(&self, path: &Path, mut config: Option<&mut PluginLoadConfig>) -> Result<LoadReport> {
        let started = Instant::now();
        let staged = self.loader.load_module(path)?;

        #[cfg(feature = "metrics-prometheus")]
        if let Some(metrics) = &self.metrics {
            metrics.record_module_load(
                started.elapsed().as_secs_f64(),
                self.loader.modules().resident_count(),
            );
        }

        let internal_name = internal_name_for(path);
        let module_name = staged.module.name().to_string();
        let version = staged.module.version().to_string();
        let config_id = config.as_deref().map(PluginLoadConfig::id);
        let registry = self.registry();

        let mut report = LoadReport {
            module: staged.id,
            module_name: module_name.clone(),
            registered: Vec::new(),
            failed: Vec::new(),
        };

        for factory in &staged.factories {
            if registry.contains(&internal_name) {
                tracing::info!("Unloading previous instance of {}", internal_name);
                self.unload(&internal_name, config.as_deref_mut());
            }

            if registry.contains_module(&module_name) {
                tracing::error!(
                    "Plugin module {} is already loaded, rejecting {}",
                    module_name,
                    path.display()
                );
                self.emit(LifecycleEvent::Rejected {
                    module: module_name.clone(),
                    path: path.to_path_buf(),
                    at: Instant::now(),
                });
                #[cfg(feature = "metrics-prometheus")]
                if let Some(metrics) = &self.metrics {
                    metrics.record_duplicate();
                }
                return Err(Error::duplicate_module(module_name, path));
            }

            let mut plugin = match self.loader.instantiate(factory, path) {
                Ok(plugin) => plugin,
                Err(err) => {
                    report
                        .failed
                        .push(self.record_failure(config_id, factory.type_name(), &err));
                    continue;
                }
            };

            let host = PluginHost::new(
                self.binding.host_name(),
                module_name.as_str(),
                self.binding.store().clone(),
            );

            if let Err(err) = self.loader.initialize(&mut plugin, host.clone()) {
                report.failed.push(self.record_failure(config_id, &plugin.name, &err));
                discard(plugin.instance);
                continue;
            }

            let definition = PluginDefinition::live(
                plugin.name.as_str(),
                internal_name.as_str(),
                version.as_str(),
                &self.loader.config().loader_name,
            );
            registry.push(LoadedPluginRecord::live(
                plugin.instance,
                definition,
                host,
                staged.id,
                module_name.as_str(),
            ));

            if let Some(config) = config.as_deref_mut() {
                config.mark_loaded(&internal_name, staged.file_size, staged.modified);
            }

            tracing::info!("Loaded plugin {} as {}", plugin.name, internal_name);
            self.emit(LifecycleEvent::Loaded {
                name: plugin.name.clone(),
                internal_name: internal_name.clone(),
                module: staged.id,
                at: Instant::now(),
            });
            #[cfg(feature = "metrics-prometheus")]
            if let Some(metrics) = &self.metrics {
                metrics.record_load();
            }

            report.registered.push(plugin.name);
        }

        tracing::debug!(
            "Load of {} finished in {:?}",
            path.display(),
            started.elapsed()
        );
        Ok(report)
    }

    /// Unload the plugin registered under `internal_name`.
    ///
    /// Returns true if nothing was registered or the plugin disposed
    /// cleanly. A failing dispose is logged and reported as false; the
    /// record has already been removed by then.
    pub fn unload(&self, internal_name: &str, config: Option<&mut PluginLoadConfig>) -> bool {
        let Some(record) = self.registry().take(internal_name) else {
            tracing::debug!("Nothing registered under {}, nothing to unload", internal_name);
            return true;
        };

        if let Some(config) = config {
            config.mark_unloaded();
        }

        let mut instance = record.into_instance();
        let result = guarded(|| instance.dispose());
        discard(instance);

        match result {
            Ok(()) => {
                tracing::info!("Unloaded plugin {}", internal_name);
                self.emit(LifecycleEvent::Unloaded {
                    internal_name: internal_name.to_string(),
                    at: Instant::now(),
                });
                #[cfg(feature = "metrics-prometheus")]
                if let Some(metrics) = &self.metrics {
                    metrics.record_unload();
                }
                true
            }
            Err(reason) => {
                let err = Error::teardown_failed(internal_name, reason);
                tracing::error!("{}", err);
                self.emit(LifecycleEvent::TeardownFailed {
                    internal_name: internal_name.to_string(),
                    reason: err.to_string(),
                    at: Instant::now(),
                });
                false
            }
        }
    }

    /// Unload every plugin this crate registered. Returns how many disposed
    /// cleanly.
    pub fn unload_all(&self) -> usize {
        self.registry()
            .live_names()
            .iter()
            .filter(|name| self.unload(name, None))
            .count()
    }

    fn record_failure(&self, config: Option<ConfigId>, name: &str, err: &Error) -> LoadErrorId {
        tracing::error!("Failed to load plugin {}: {}", name, err);
        let id = self.ledger.record(config, name, err.to_string());
        self.emit(LifecycleEvent::LoadFailed {
            name: name.to_string(),
            reason: err.to_string(),
            at: Instant::now(),
        });
        #[cfg(feature = "metrics-prometheus")]
        if let Some(metrics) = &self.metrics {
            metrics.record_failure();
        }
        id
    }

    fn emit(&self, event: LifecycleEvent) {
        self.hooks.read().emit(event);
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("binding", &self.binding)
            .field("loader", &self.loader)
            .field("open_errors", &self.ledger.open_count())
            .finish()
    }
}
