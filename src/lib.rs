//! # live-plugin-loader
//!
//! Load, unload and hot-reload compiled plugin modules inside a
//! long-running host, without restarting it.
//!
//! This crate provides:
//! - **Module Loading** - Link plugin modules through a pluggable backend and
//!   construct the plugin types they export
//! - **Dependency Resolution** - Resolve a plugin's private dependencies from
//!   the plugin's own directory through a prioritized resolver chain
//! - **Lifecycle Management** - Load, unload and replace plugins in the
//!   host's registry, rejecting duplicate modules
//! - **Hot Reload** - Watch loaded plugin files and reload them once a change
//!   has settled
//! - **Failure Isolation** - Plugin errors and panics are recorded, never
//!   propagated into the host
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use live_plugin_loader::{
//!     HostContext, LivePluginRuntime, MemoryConfigStore, NativeBackend, PluginRegistry,
//!     RuntimeConfig,
//! };
//!
//! let host = HostContext::new("my-host")
//!     .with_registry(Arc::new(PluginRegistry::new()))
//!     .with_store(Arc::new(MemoryConfigStore::new()));
//!
//! let mut runtime =
//!     LivePluginRuntime::start(&host, Arc::new(NativeBackend::new()?), RuntimeConfig::default())?;
//!
//! let id = runtime.add_plugin("target/debug/libgreeter.so")?;
//! runtime.set_auto_reload(id, true)?;
//! runtime.request_load(id)?;
//!
//! loop {
//!     runtime.tick();
//!     // ... the rest of the host's update
//! }
//! ```
//!
//! Plugin crates export their types with [`export_plugin!`].
//!
//! ## Feature Flags
//!
//! - `toml` (default): TOML settings documents
//! - `watch`: wake the change watcher early on filesystem notifications
//! - `metrics-prometheus`: Prometheus metrics integration

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod config;
mod error;
mod host;
mod ledger;
mod lifecycle;
mod loader;
mod module;
mod plugin;
mod queue;
mod registry;
mod resolver;
mod runtime;
mod watcher;

pub mod native;

#[cfg(feature = "metrics-prometheus")]
mod metrics;

pub use config::{internal_name_for, ConfigId, LoaderSettings, PluginLoadConfig};
pub use error::{Error, Result};
pub use host::{
    ConfigFormat, ConfigStore, DirectoryConfigStore, HostBinding, HostBindingLocator, HostBindings,
    HostContext, MemoryConfigStore,
};
pub use ledger::{ErrorGroup, ErrorLedger, LoadError, LoadErrorId};
pub use lifecycle::{LifecycleEvent, LifecycleHooks, LifecycleManager, LoadReport};
pub use loader::{Instantiated, LoaderConfig, ModuleLoader, StagedModule};
pub use module::{LoadedModuleRecord, Module, ModuleBackend, ModuleId, ModuleImage, ModuleTable};
pub use native::{NativeBackend, NativeModule, ABI_VERSION};
pub use plugin::{Plugin, PluginDefinition, PluginError, PluginFactory, PluginHost};
pub use queue::{Request, RequestQueue, TickOutcome};
pub use registry::{LoadedPluginRecord, PluginRegistry, RegistryStats};
pub use resolver::{
    DependencyScope, Next, ResolveRequest, Resolver, ResolverChain, ResolverToken, SiblingResolver,
};
pub use runtime::{LivePluginRuntime, RuntimeConfig, DEFAULT_SETTINGS_NAMESPACE};
pub use watcher::{
    settle_change, ChangeWatcher, ModifiedProbe, WatchConfig, WatchEvent, WatchTarget,
    WatchTargets, WatcherState,
};

#[cfg(feature = "metrics-prometheus")]
pub use metrics::{MetricsConfig, PluginMetrics};

/// Crate version for compatibility checks.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
