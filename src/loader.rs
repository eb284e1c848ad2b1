//! Module loading and plugin instantiation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::module::{Module, ModuleBackend, ModuleId, ModuleImage, ModuleTable};
use crate::plugin::{guarded, Plugin, PluginFactory, PluginHost};
use crate::resolver::{DependencyScope, ResolverChain, ResolverToken, SiblingResolver};

/// Configuration for the module loader.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Name reported in the description of every plugin loaded.
    pub loader_name: String,
    /// Whether to read companion debug-symbol files.
    pub load_debug_symbols: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            loader_name: "LivePluginLoader".to_string(),
            load_debug_symbols: true,
        }
    }
}

impl LoaderConfig {
    /// Create a new loader configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the loader name.
    pub fn with_loader_name(mut self, name: impl Into<String>) -> Self {
        self.loader_name = name.into();
        self
    }

    /// Set whether debug symbols are read.
    pub fn with_debug_symbols(mut self, enabled: bool) -> Self {
        self.load_debug_symbols = enabled;
        self
    }
}

/// A module linked by [`ModuleLoader::load_module`].
pub struct StagedModule {
    /// Identity of the new module instance.
    pub id: ModuleId,
    /// The linked module.
    pub module: Arc<dyn Module>,
    /// File the module was read from.
    pub path: PathBuf,
    /// File size at load time.
    pub file_size: u64,
    /// File modification time at load time.
    pub modified: Option<SystemTime>,
    /// Plugin types the module exports.
    pub factories: Vec<PluginFactory>,
}

impl std::fmt::Debug for StagedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedModule")
            .field("id", &self.id)
            .field("name", &self.module.name())
            .field("path", &self.path)
            .field("factories", &self.factories.len())
            .finish()
    }
}

/// A freshly constructed plugin instance.
pub struct Instantiated {
    /// The instance.
    pub instance: Box<dyn Plugin>,
    /// Display name reported by the instance.
    pub name: String,
}

/// Loads module files and constructs the plugins they export.
pub struct ModuleLoader {
    config: LoaderConfig,
    backend: Arc<dyn ModuleBackend>,
    modules: Arc<ModuleTable>,
    resolvers: Arc<ResolverChain>,
    takeover: Mutex<Option<ResolverToken>>,
}

impl ModuleLoader {
    /// Create a new module loader.
    pub fn new(
        config: LoaderConfig,
        backend: Arc<dyn ModuleBackend>,
        resolvers: Arc<ResolverChain>,
    ) -> Self {
        Self {
            config,
            backend,
            modules: Arc::new(ModuleTable::new()),
            resolvers,
            takeover: Mutex::new(None),
        }
    }

    /// Get the loader configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Every module this loader has linked.
    pub fn modules(&self) -> &Arc<ModuleTable> {
        &self.modules
    }

    /// The resolver chain modules resolve their dependencies through.
    pub fn resolvers(&self) -> &Arc<ResolverChain> {
        &self.resolvers
    }

    /// Install the sibling resolver on top of the chain. Idempotent.
    pub fn takeover(&self) {
        let mut takeover = self.takeover.lock();
        if takeover.is_some() {
            return;
        }
        tracing::debug!("Installing sibling dependency resolver");
        let resolver = SiblingResolver::new(self.modules.clone(), self.backend.clone());
        *takeover = Some(self.resolvers.push(Arc::new(resolver)));
    }

    /// Remove the sibling resolver, restoring the previous chain.
    pub fn release(&self) {
        if let Some(token) = self.takeover.lock().take() {
            tracing::debug!("Releasing sibling dependency resolver");
            if !self.resolvers.release(token) {
                tracing::warn!("Sibling dependency resolver was already removed");
            }
        }
    }

    /// Whether the sibling resolver is installed.
    pub fn is_taken_over(&self) -> bool {
        self.takeover.lock().is_some()
    }

    /// Read `path` and link it as a new module instance.
    pub fn load_module(&self, path: &Path) -> Result<StagedModule> {
        if !path.is_file() {
            tracing::error!("File does not exist: {}", path.display());
            return Err(Error::FileNotFound(path.to_path_buf()));
        }

        let metadata = std::fs::metadata(path)?;
        tracing::info!("Attempting to load module at {}", path.display());

        let bytes = std::fs::read(path)?;
        let symbols = self.read_symbols(path);

        self.takeover();

        let id = ModuleId::next();
        self.modules.stage(id, path);

        let image = ModuleImage {
            id,
            path: path.to_path_buf(),
            bytes,
            symbols,
        };
        let module = self
            .backend
            .load(image, &DependencyScope::new(id, &self.resolvers))?;
        self.modules.retain(id, module.clone());

        let factories = guarded(|| module.entry_point().map_err(Into::into))
            .map_err(|reason| Error::module_load(path, reason))?;

        if factories.is_empty() {
            tracing::warn!("Module {} exports no plugin types", module.name());
        }

        Ok(StagedModule {
            id,
            module,
            path: path.to_path_buf(),
            file_size: metadata.len(),
            modified: metadata.modified().ok(),
            factories,
        })
    }

    /// Construct a plugin and tell it where it was loaded from.
    pub fn instantiate(&self, factory: &PluginFactory, location: &Path) -> Result<Instantiated> {
        let mut instance = guarded(|| Ok(factory.construct()))
            .map_err(|reason| Error::init_failed(factory.type_name(), reason))?;

        if let Err(reason) = guarded(|| instance.set_location(location)) {
            tracing::debug!("Ignoring location failure for {}: {}", factory.type_name(), reason);
        }

        let name = guarded(|| Ok(instance.name().to_string()))
            .unwrap_or_else(|_| factory.type_name().to_string());

        Ok(Instantiated { instance, name })
    }

    /// Run a plugin's initialize hook.
    pub fn initialize(&self, plugin: &mut Instantiated, host: PluginHost) -> Result<()> {
        let instance = &mut plugin.instance;
        guarded(|| instance.initialize(host)).map_err(|reason| Error::init_failed(&plugin.name, reason))
    }

    fn read_symbols(&self, path: &Path) -> Option<Vec<u8>> {
        if !self.config.load_debug_symbols {
            return None;
        }
        let symbols_path = path.with_extension(self.backend.symbols_extension());
        if !symbols_path.is_file() {
            return None;
        }
        match std::fs::read(&symbols_path) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::debug!("Skipping debug symbols {}: {}", symbols_path.display(), e);
                None
            }
        }
    }
}

impl std::fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("config", &self.config)
            .field("modules", &self.modules)
            .field("taken_over", &self.is_taken_over())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryConfigStore;
    use crate::plugin::PluginError;

    struct Echo {
        name: String,
        location: Option<PathBuf>,
    }

    impl Plugin for Echo {
        fn name(&self) -> &str {
            &self.name
        }

        fn initialize(&mut self, host: PluginHost) -> std::result::Result<(), PluginError> {
            if host.module_name() == "broken" {
                return Err("refusing to start".into());
            }
            Ok(())
        }

        fn dispose(&mut self) -> std::result::Result<(), PluginError> {
            Ok(())
        }

        fn set_location(&mut self, path: &Path) -> std::result::Result<(), PluginError> {
            self.location = Some(path.to_path_buf());
            Err("location is read-only".into())
        }
    }

    struct EchoModule {
        name: String,
    }

    impl Module for EchoModule {
        fn name(&self) -> &str {
            &self.name
        }

        fn entry_point(&self) -> Result<Vec<PluginFactory>> {
            Ok(vec![PluginFactory::from_fn("Echo", || {
                Box::new(Echo {
                    name: "Echo".to_string(),
                    location: None,
                })
            })])
        }
    }

    #[derive(Default)]
    struct EchoBackend {
        symbols_seen: Mutex<Vec<Option<Vec<u8>>>>,
    }

    impl ModuleBackend for EchoBackend {
        fn extension(&self) -> &str {
            "echo"
        }

        fn symbols_extension(&self) -> &str {
            "sym"
        }

        fn load(&self, image: ModuleImage, _deps: &DependencyScope<'_>) -> Result<Arc<dyn Module>> {
            self.symbols_seen.lock().push(image.symbols);
            let name = image.path.file_stem().unwrap().to_string_lossy().into_owned();
            Ok(Arc::new(EchoModule { name }))
        }
    }

    fn loader(backend: Arc<EchoBackend>) -> ModuleLoader {
        ModuleLoader::new(LoaderConfig::default(), backend, Arc::new(ResolverChain::new()))
    }

    #[test]
    fn test_loader_config_builder() {
        let config = LoaderConfig::new()
            .with_loader_name("dev")
            .with_debug_symbols(false);

        assert_eq!(config.loader_name, "dev");
        assert!(!config.load_debug_symbols);
    }

    #[test]
    fn test_missing_file_changes_nothing() {
        let loader = loader(Arc::new(EchoBackend::default()));
        let err = loader.load_module(Path::new("does/not/exist.echo")).unwrap_err();

        assert!(matches!(err, Error::FileNotFound(_)));
        assert!(loader.modules().is_empty());
        assert!(!loader.is_taken_over());
    }

    #[test]
    fn test_each_load_is_a_new_module() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Foo.echo");
        std::fs::write(&path, b"module").unwrap();
        std::fs::write(dir.path().join("Foo.sym"), b"symbols").unwrap();

        let backend = Arc::new(EchoBackend::default());
        let loader = loader(backend.clone());

        let first = loader.load_module(&path).unwrap();
        let second = loader.load_module(&path).unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(first.file_size, 6);
        assert_eq!(first.factories.len(), 1);
        assert_eq!(loader.modules().len(), 2);
        assert_eq!(loader.modules().resident_count(), 2);
        assert_eq!(backend.symbols_seen.lock()[0].as_deref(), Some(&b"symbols"[..]));
        assert!(loader.is_taken_over());
        assert_eq!(loader.resolvers().len(), 1);
    }

    #[test]
    fn test_takeover_and_release() {
        let loader = loader(Arc::new(EchoBackend::default()));
        loader.takeover();
        loader.takeover();
        assert_eq!(loader.resolvers().len(), 1);

        loader.release();
        assert!(loader.resolvers().is_empty());
        loader.release();
    }

    #[test]
    fn test_instantiate_swallows_location_errors() {
        let loader = loader(Arc::new(EchoBackend::default()));
        let factory = PluginFactory::from_fn("Echo", || {
            Box::new(Echo {
                name: "Echo".to_string(),
                location: None,
            })
        });

        let mut plugin = loader.instantiate(&factory, Path::new("Foo.echo")).unwrap();
        assert_eq!(plugin.name, "Echo");

        let store = Arc::new(MemoryConfigStore::new());
        assert!(loader
            .initialize(&mut plugin, PluginHost::new("host", "Foo", store.clone()))
            .is_ok());

        let err = loader
            .initialize(&mut plugin, PluginHost::new("host", "broken", store))
            .unwrap_err();
        assert!(matches!(err, Error::InitializeFailure { ref plugin, .. } if plugin == "Echo"));
    }

    #[test]
    fn test_instantiate_reports_constructor_panics() {
        let loader = loader(Arc::new(EchoBackend::default()));
        let factory = PluginFactory::from_fn("Exploding", || panic!("no default"));

        let err = loader.instantiate(&factory, Path::new("x.echo")).err().unwrap();
        assert!(matches!(err, Error::InitializeFailure { ref plugin, .. } if plugin == "Exploding"));
    }
}
