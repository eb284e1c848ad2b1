//! Error types for plugin loading and lifecycle operations.

use std::path::PathBuf;

use thiserror::Error;

use crate::module::ModuleId;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading, resolving, or managing plugins.
#[derive(Error, Debug)]
pub enum Error {
    /// Plugin file does not exist.
    #[error("plugin file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// A plugin from a module with the same name is already registered.
    #[error("duplicate plugin module `{module}` rejected from {}", path.display())]
    DuplicateModule {
        /// Module name shared by both plugins.
        module: String,
        /// Path of the rejected file.
        path: PathBuf,
    },

    /// Plugin construction or initialization failed.
    #[error("plugin `{plugin}` failed to initialize: {reason}")]
    InitializeFailure {
        /// Plugin display name.
        plugin: String,
        /// Failure detail.
        reason: String,
    },

    /// Plugin teardown failed.
    #[error("plugin `{plugin}` failed to tear down: {reason}")]
    TeardownFailure {
        /// Internal name of the plugin.
        plugin: String,
        /// Failure detail.
        reason: String,
    },

    /// The host did not expose a required binding.
    #[error("host binding unavailable: {0}")]
    HostBindingUnavailable(String),

    /// The backend could not link a module image.
    #[error("failed to load module {}: {reason}", path.display())]
    ModuleLoad {
        /// Path of the module image.
        path: PathBuf,
        /// Failure detail.
        reason: String,
    },

    /// A module does not export the plugin entry point.
    #[error("missing plugin entry point: {0}")]
    MissingEntryPoint(String),

    /// A module was built against a different plugin ABI.
    #[error("plugin ABI mismatch: expected {expected}, found {found}")]
    AbiMismatch {
        /// ABI version of this crate.
        expected: u32,
        /// ABI version declared by the module.
        found: u32,
    },

    /// No resolver in the chain could satisfy a dependency lookup.
    #[error("dependency `{name}` requested by {owner} could not be resolved")]
    DependencyNotResolved {
        /// Requested module name.
        name: String,
        /// Module that issued the lookup.
        owner: ModuleId,
    },

    /// No plugin load config with this id.
    #[error("plugin config not found: {0}")]
    ConfigNotFound(u64),

    /// Plugin load config cannot be removed while its plugin is loaded.
    #[error("plugin config {0} is loaded; unload it before removing")]
    ConfigInUse(u64),

    /// Configuration store failure.
    #[error("config store error: {0}")]
    ConfigStore(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Watch error.
    #[cfg(feature = "watch")]
    #[error("watch error: {0}")]
    Watch(String),

    /// Metrics registration error.
    #[cfg(feature = "metrics-prometheus")]
    #[error("metrics error: {0}")]
    Metrics(String),
}

impl Error {
    /// Create a duplicate module error.
    pub fn duplicate_module(module: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::DuplicateModule {
            module: module.into(),
            path: path.into(),
        }
    }

    /// Create an initialize failure error.
    pub fn init_failed(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InitializeFailure {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    /// Create a teardown failure error.
    pub fn teardown_failed(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TeardownFailure {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    /// Create a module load error.
    pub fn module_load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ModuleLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a config store error.
    pub fn config_store(msg: impl Into<String>) -> Self {
        Self::ConfigStore(msg.into())
    }

    /// Returns true if this error disables the whole subsystem.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::HostBindingUnavailable(_))
    }

    /// Returns true if the registry was left untouched by the failed operation.
    pub fn left_registry_untouched(&self) -> bool {
        matches!(
            self,
            Self::FileNotFound(_) | Self::DuplicateModule { .. } | Self::ModuleLoad { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::FileNotFound(PathBuf::from("plugins/Foo.so"));
        assert_eq!(err.to_string(), "plugin file not found: plugins/Foo.so");

        let err = Error::duplicate_module("Foo", "other/Bar.so");
        assert!(err.to_string().contains("`Foo`"));
        assert!(err.to_string().contains("other/Bar.so"));
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::HostBindingUnavailable("plugin registry".into()).is_fatal());
        assert!(!Error::init_failed("Foo", "boom").is_fatal());

        assert!(Error::FileNotFound(PathBuf::from("x")).left_registry_untouched());
        assert!(!Error::teardown_failed("Foo", "boom").left_registry_untouched());
    }
}
