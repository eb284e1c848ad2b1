//! Native shared-library backend over `libloading`.
//!
//! Plugin crates are built as `cdylib`s and expose their plugin types with
//! [`export_plugin!`](crate::export_plugin). Every image is written to a
//! fresh shadow directory before it is opened, so reloading a file always
//! maps a new copy of its code.

use std::collections::HashSet;
use std::mem::ManuallyDrop;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;

use crate::config::internal_name_for;
use crate::error::{Error, Result};
use crate::module::{Module, ModuleBackend, ModuleImage};
use crate::plugin::PluginFactory;
use crate::resolver::DependencyScope;

/// ABI version plugin modules must be built against.
pub const ABI_VERSION: u32 = 1;

const ABI_SYMBOL: &[u8] = b"LIVE_PLUGIN_ABI_VERSION\0";
const NAME_SYMBOL: &[u8] = b"LIVE_PLUGIN_MODULE_NAME\0";
const VERSION_SYMBOL: &[u8] = b"LIVE_PLUGIN_MODULE_VERSION\0";
const ENTRY_SYMBOL: &[u8] = b"live_plugin_entry\0";

#[cfg(target_os = "windows")]
const SYMBOLS_EXTENSION: &str = "pdb";
#[cfg(target_os = "macos")]
const SYMBOLS_EXTENSION: &str = "dSYM";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const SYMBOLS_EXTENSION: &str = "debug";

type EntryFn = fn() -> Vec<PluginFactory>;

/// Export plugin types from a `cdylib` plugin crate.
///
/// ```ignore
/// live_plugin_loader::export_plugin!("greeter", "0.1.0", [Greeter]);
/// ```
#[macro_export]
macro_rules! export_plugin {
    ($name:expr, $version:expr, [$($plugin:ty),* $(,)?]) => {
        #[no_mangle]
        pub static LIVE_PLUGIN_ABI_VERSION: u32 = $crate::native::ABI_VERSION;

        #[no_mangle]
        pub static LIVE_PLUGIN_MODULE_NAME: &str = $name;

        #[no_mangle]
        pub static LIVE_PLUGIN_MODULE_VERSION: &str = $version;

        #[no_mangle]
        pub fn live_plugin_entry() -> ::std::vec::Vec<$crate::PluginFactory> {
            ::std::vec![$($crate::PluginFactory::of::<$plugin>()),*]
        }
    };
}

/// A shared library opened by [`NativeBackend`].
///
/// The library is never closed, even when the module is dropped.
pub struct NativeModule {
    name: String,
    version: String,
    entry: Option<EntryFn>,
    path: PathBuf,
    _library: ManuallyDrop<Library>,
}

impl NativeModule {
    /// Read the plugin exports of `library`, loaded from `source`.
    ///
    /// Libraries without an entry point are plain dependencies; they link
    /// but export no plugins.
    ///
    /// # Safety
    /// The exported symbols must have the types `export_plugin!` gives them.
    unsafe fn bind(library: Library, source: &Path) -> Result<Self> {
        let entry = library.get::<EntryFn>(ENTRY_SYMBOL).ok().map(|sym| *sym);

        if entry.is_some() {
            let found = library
                .get::<*const u32>(ABI_SYMBOL)
                .map(|sym| **sym)
                .unwrap_or(0);
            if found != ABI_VERSION {
                return Err(Error::AbiMismatch {
                    expected: ABI_VERSION,
                    found,
                });
            }
        }

        let name = read_str(&library, NAME_SYMBOL).unwrap_or_else(|| internal_name_for(source));
        let version = read_str(&library, VERSION_SYMBOL).unwrap_or_else(|| "0.0.0".to_string());

        Ok(Self {
            name,
            version,
            entry,
            path: source.to_path_buf(),
            _library: ManuallyDrop::new(library),
        })
    }

    /// File the module was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the library exports plugins.
    pub fn has_entry_point(&self) -> bool {
        self.entry.is_some()
    }
}

unsafe fn read_str(library: &Library, symbol: &[u8]) -> Option<String> {
    library
        .get::<*const &'static str>(symbol)
        .ok()
        .map(|sym| (**sym).to_string())
}

impl Module for NativeModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn entry_point(&self) -> Result<Vec<PluginFactory>> {
        match self.entry {
            Some(entry) => Ok(entry()),
            None => Err(Error::MissingEntryPoint(self.name.clone())),
        }
    }
}

impl std::fmt::Debug for NativeModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeModule")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("path", &self.path)
            .field("entry_point", &self.entry.is_some())
            .finish()
    }
}

enum ShadowRoot {
    Temp(tempfile::TempDir),
    Fixed(PathBuf),
}

/// [`ModuleBackend`] for platform shared libraries.
pub struct NativeBackend {
    shadow: ShadowRoot,
}

impl NativeBackend {
    /// Create a backend that shadow-copies into a new temporary directory.
    pub fn new() -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("live-plugin-").tempdir()?;
        tracing::debug!("Shadow copies go to {}", dir.path().display());
        Ok(Self {
            shadow: ShadowRoot::Temp(dir),
        })
    }

    /// Create a backend that shadow-copies under `root`.
    pub fn with_shadow_root(root: impl Into<PathBuf>) -> Self {
        Self {
            shadow: ShadowRoot::Fixed(root.into()),
        }
    }

    /// Directory shadow copies are written under.
    pub fn shadow_root(&self) -> &Path {
        match &self.shadow {
            ShadowRoot::Temp(dir) => dir.path(),
            ShadowRoot::Fixed(path) => path,
        }
    }

    fn write_shadow(&self, image: &ModuleImage) -> Result<PathBuf> {
        let file_name = image
            .path
            .file_name()
            .ok_or_else(|| Error::module_load(&image.path, "path has no file name"))?;

        let dir = self.shadow_root().join(image.id.get().to_string());
        std::fs::create_dir_all(&dir)?;

        let shadow = dir.join(file_name);
        std::fs::write(&shadow, &image.bytes)?;

        if let Some(symbols) = &image.symbols {
            let symbols_path = shadow.with_extension(SYMBOLS_EXTENSION);
            if let Err(e) = std::fs::write(&symbols_path, symbols) {
                tracing::debug!("Skipping debug symbols for {}: {}", shadow.display(), e);
            }
        }

        Ok(shadow)
    }

    fn open_with_dependencies(
        &self,
        shadow: &Path,
        source: &Path,
        deps: &DependencyScope<'_>,
    ) -> Result<Library> {
        let mut attempted = HashSet::new();
        loop {
            let err = match open_library(shadow) {
                Ok(library) => return Ok(library),
                Err(err) => err.to_string(),
            };

            let Some(stem) = missing_dependency(&err).map(|name| dependency_stem(&name)) else {
                return Err(Error::module_load(source, err));
            };
            if !attempted.insert(stem.clone()) {
                return Err(Error::module_load(source, err));
            }

            tracing::debug!("{} needs {}, resolving", source.display(), stem);
            deps.resolve(&stem)?;
        }
    }
}

impl ModuleBackend for NativeBackend {
    fn extension(&self) -> &str {
        std::env::consts::DLL_EXTENSION
    }

    fn symbols_extension(&self) -> &str {
        SYMBOLS_EXTENSION
    }

    fn load(&self, image: ModuleImage, deps: &DependencyScope<'_>) -> Result<Arc<dyn Module>> {
        let shadow = self.write_shadow(&image)?;
        let library = self.open_with_dependencies(&shadow, &image.path, deps)?;

        // SAFETY: the symbols read by `bind` are generated by `export_plugin!`.
        let module = unsafe { NativeModule::bind(library, &image.path)? };

        tracing::debug!(
            "Linked {} {} as {} from {}",
            module.name(),
            module.version(),
            image.id,
            shadow.display()
        );
        Ok(Arc::new(module))
    }
}

impl std::fmt::Debug for NativeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeBackend")
            .field("shadow_root", &self.shadow_root())
            .finish()
    }
}

#[cfg(unix)]
fn open_library(path: &Path) -> std::result::Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_NOW};

    // Global so later modules link against dependencies resolved for earlier ones.
    unsafe { UnixLibrary::open(Some(path), RTLD_NOW | RTLD_GLOBAL).map(Into::into) }
}

#[cfg(not(unix))]
fn open_library(path: &Path) -> std::result::Result<Library, libloading::Error> {
    unsafe { Library::new(path) }
}

/// Name of the shared object the dynamic linker failed to find, if the
/// error says so.
fn missing_dependency(message: &str) -> Option<String> {
    if let Some(end) = message.find(": cannot open shared object file") {
        let head = &message[..end];
        let name = head.rsplit(": ").next().unwrap_or(head);
        return Some(name.trim().to_string());
    }

    if let Some(start) = message.find("Library not loaded: ") {
        let rest = &message[start + "Library not loaded: ".len()..];
        let name = rest.split_whitespace().next().unwrap_or(rest);
        return Some(name.to_string());
    }

    None
}

/// Sibling stem for a shared object name: `@rpath/libfoo.so.1` -> `libfoo`.
fn dependency_stem(name: &str) -> String {
    let file = Path::new(name)
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    match file.split_once('.') {
        Some((stem, _)) => stem.to_string(),
        None => file,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleId;
    use crate::plugin::{Plugin, PluginError, PluginHost};
    use crate::resolver::ResolverChain;

    #[derive(Default)]
    struct Greeter;

    impl Plugin for Greeter {
        fn name(&self) -> &str {
            "Greeter"
        }

        fn initialize(&mut self, _host: PluginHost) -> std::result::Result<(), PluginError> {
            Ok(())
        }

        fn dispose(&mut self) -> std::result::Result<(), PluginError> {
            Ok(())
        }
    }

    crate::export_plugin!("greeter", "0.3.0", [Greeter]);

    #[test]
    fn test_export_plugin_exports() {
        assert_eq!(LIVE_PLUGIN_ABI_VERSION, ABI_VERSION);
        assert_eq!(LIVE_PLUGIN_MODULE_NAME, "greeter");
        assert_eq!(LIVE_PLUGIN_MODULE_VERSION, "0.3.0");

        let factories = live_plugin_entry();
        assert_eq!(factories.len(), 1);
        assert_eq!(factories[0].construct().name(), "Greeter");
    }

    #[test]
    fn test_missing_dependency_glibc() {
        let message = "libfoo.so: cannot open shared object file: No such file or directory";
        assert_eq!(missing_dependency(message).as_deref(), Some("libfoo.so"));

        let message =
            "/tmp/shadow/3/libbar.so: libfoo.so.1: cannot open shared object file: No such file or directory";
        assert_eq!(missing_dependency(message).as_deref(), Some("libfoo.so.1"));
    }

    #[test]
    fn test_missing_dependency_macos() {
        let message = "dlopen(/tmp/libbar.dylib, 0x000A): Library not loaded: @rpath/libfoo.dylib\n  Referenced from: /tmp/libbar.dylib";
        assert_eq!(missing_dependency(message).as_deref(), Some("@rpath/libfoo.dylib"));
    }

    #[test]
    fn test_unrelated_errors_name_no_dependency() {
        assert_eq!(missing_dependency("/tmp/x.so: invalid ELF header"), None);
    }

    #[test]
    fn test_dependency_stem() {
        assert_eq!(dependency_stem("libfoo.so.1"), "libfoo");
        assert_eq!(dependency_stem("@rpath/libfoo.dylib"), "libfoo");
        assert_eq!(dependency_stem("Helpers"), "Helpers");
    }

    #[test]
    fn test_garbage_image_fails_after_shadow_copy() {
        let dir = tempfile::tempdir().unwrap();
        let backend = NativeBackend::with_shadow_root(dir.path());
        let chain = ResolverChain::new();
        let id = ModuleId::next();

        let image = ModuleImage {
            id,
            path: PathBuf::from(format!("plugins/Foo.{}", backend.extension())),
            bytes: b"not a shared library".to_vec(),
            symbols: Some(b"symbols".to_vec()),
        };
        let err = backend
            .load(image, &DependencyScope::new(id, &chain))
            .err()
            .unwrap();

        assert!(matches!(err, Error::ModuleLoad { .. }));
        let shadow = dir
            .path()
            .join(id.get().to_string())
            .join(format!("Foo.{}", backend.extension()));
        assert!(shadow.is_file());
        assert!(shadow.with_extension(SYMBOLS_EXTENSION).is_file());
    }

    #[test]
    fn test_temp_shadow_root_exists() {
        let backend = NativeBackend::new().unwrap();
        assert!(backend.shadow_root().is_dir());
        assert_eq!(backend.symbols_extension(), SYMBOLS_EXTENSION);
    }
}
