//! The plugin capability contract and the handles passed across it.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::host::ConfigStore;

/// Error type returned by plugin code.
pub type PluginError = Box<dyn std::error::Error + Send + Sync>;

/// Capability set every loadable plugin implements.
///
/// Instances are created by a [`PluginFactory`] exported from the plugin's
/// module, initialized once with a [`PluginHost`], and disposed before they
/// are dropped.
pub trait Plugin: Send {
    /// Display name of the plugin.
    fn name(&self) -> &str;

    /// Called once after construction.
    fn initialize(&mut self, host: PluginHost) -> std::result::Result<(), PluginError>;

    /// Called once before the instance is dropped.
    fn dispose(&mut self) -> std::result::Result<(), PluginError>;

    /// Receives the path the plugin was loaded from.
    fn set_location(&mut self, _path: &Path) -> std::result::Result<(), PluginError> {
        Ok(())
    }
}

type Constructor = dyn Fn() -> Box<dyn Plugin> + Send + Sync;

/// Parameterless constructor for one plugin type exported by a module.
pub struct PluginFactory {
    type_name: String,
    constructor: Box<Constructor>,
}

impl PluginFactory {
    /// Factory for a `Default`-constructible plugin type.
    pub fn of<P>() -> Self
    where
        P: Plugin + Default + 'static,
    {
        Self::from_fn(std::any::type_name::<P>(), || Box::new(P::default()))
    }

    /// Factory from an arbitrary constructor.
    pub fn from_fn<F>(type_name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        Self {
            type_name: type_name.into(),
            constructor: Box::new(constructor),
        }
    }

    /// Name of the type this factory constructs.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Construct a new instance.
    pub fn construct(&self) -> Box<dyn Plugin> {
        (self.constructor)()
    }
}

impl fmt::Debug for PluginFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginFactory")
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Registry metadata describing a loaded plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDefinition {
    /// Display name reported by the plugin.
    pub name: String,
    /// Stable key derived from the plugin file name.
    pub internal_name: String,
    /// Version of the module the plugin came from.
    pub version: String,
    /// Human-readable description.
    pub description: String,
    /// Plugin author.
    pub author: String,
    /// Host versions the plugin applies to.
    pub applicable_version: String,
}

impl PluginDefinition {
    /// Definition for a plugin loaded by this crate from a development build.
    pub fn live(
        name: impl Into<String>,
        internal_name: impl Into<String>,
        version: impl Into<String>,
        loaded_by: &str,
    ) -> Self {
        Self {
            name: name.into(),
            internal_name: internal_name.into(),
            version: version.into(),
            description: format!("Loaded by {}", loaded_by),
            author: "developer".to_string(),
            applicable_version: "any".to_string(),
        }
    }
}

struct PluginHostInner {
    host_name: String,
    module_name: String,
    store: Arc<dyn ConfigStore>,
}

/// Host handle given to a plugin on initialize.
///
/// Bound to the host, the plugin's module name, and the host's config
/// store; the plugin's own configuration is kept under its module name.
#[derive(Clone)]
pub struct PluginHost {
    inner: Arc<PluginHostInner>,
}

impl PluginHost {
    /// Create a host handle.
    pub fn new(
        host_name: impl Into<String>,
        module_name: impl Into<String>,
        store: Arc<dyn ConfigStore>,
    ) -> Self {
        Self {
            inner: Arc::new(PluginHostInner {
                host_name: host_name.into(),
                module_name: module_name.into(),
                store,
            }),
        }
    }

    /// Name of the host process.
    pub fn host_name(&self) -> &str {
        &self.inner.host_name
    }

    /// Module name this handle is bound to.
    pub fn module_name(&self) -> &str {
        &self.inner.module_name
    }

    /// Load the plugin's saved configuration, if any.
    pub fn load_config<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match self.inner.store.load(&self.inner.module_name)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Save the plugin's configuration.
    pub fn save_config<T: Serialize>(&self, config: &T) -> Result<()> {
        let value = serde_json::to_value(config)?;
        self.inner.store.save(&self.inner.module_name, &value)
    }
}

impl fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHost")
            .field("host_name", &self.inner.host_name)
            .field("module_name", &self.inner.module_name)
            .finish()
    }
}

/// Run plugin code, turning both error returns and panics into a message.
pub(crate) fn guarded<T, F>(f: F) -> std::result::Result<T, String>
where
    F: FnOnce() -> std::result::Result<T, PluginError>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.to_string()),
        Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

/// Drop a plugin instance, containing any panic from its destructor.
pub(crate) fn discard(instance: Box<dyn Plugin>) {
    if let Err(reason) = guarded(move || {
        drop(instance);
        Ok(())
    }) {
        tracing::warn!("Plugin destructor failed: {}", reason);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryConfigStore;

    #[derive(Default)]
    struct Quiet;

    impl Plugin for Quiet {
        fn name(&self) -> &str {
            "Quiet"
        }

        fn initialize(&mut self, _host: PluginHost) -> std::result::Result<(), PluginError> {
            Ok(())
        }

        fn dispose(&mut self) -> std::result::Result<(), PluginError> {
            Ok(())
        }
    }

    #[test]
    fn test_factory_constructs_fresh_instances() {
        let factory = PluginFactory::of::<Quiet>();
        assert!(factory.type_name().ends_with("Quiet"));
        assert_eq!(factory.construct().name(), "Quiet");
    }

    #[test]
    fn test_guarded_catches_errors_and_panics() {
        let err = guarded::<(), _>(|| Err("bad config".into())).unwrap_err();
        assert_eq!(err, "bad config");

        let err = guarded::<(), _>(|| panic!("exploded")).unwrap_err();
        assert_eq!(err, "panicked: exploded");

        assert_eq!(guarded(|| Ok(7)).unwrap(), 7);
    }

    #[test]
    fn test_live_definition() {
        let def = PluginDefinition::live("Foo Plugin", "Foo", "1.2.0", "LivePluginLoader");
        assert_eq!(def.description, "Loaded by LivePluginLoader");
        assert_eq!(def.author, "developer");
        assert_eq!(def.applicable_version, "any");
    }

    #[test]
    fn test_host_config_is_scoped_by_module() {
        let store = Arc::new(MemoryConfigStore::new());
        let foo = PluginHost::new("host", "Foo", store.clone());
        let bar = PluginHost::new("host", "Bar", store);

        foo.save_config(&vec![1, 2, 3]).unwrap();

        assert_eq!(foo.load_config::<Vec<i32>>().unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(bar.load_config::<Vec<i32>>().unwrap(), None);
    }
}
