//! Binary modules, the backends that link them, and the resident module table.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::Result;
use crate::plugin::PluginFactory;
use crate::resolver::DependencyScope;

static NEXT_MODULE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one linked module instance.
///
/// Every image handed to a backend gets a fresh id, so reloading the same
/// file yields a different identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(u64);

impl ModuleId {
    pub(crate) fn next() -> Self {
        Self(NEXT_MODULE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module#{}", self.0)
    }
}

/// Raw module bytes handed to a backend.
#[derive(Debug)]
pub struct ModuleImage {
    /// Identity assigned to the module being linked.
    pub id: ModuleId,
    /// Path the bytes were read from.
    pub path: PathBuf,
    /// Module contents.
    pub bytes: Vec<u8>,
    /// Companion debug symbols, when present.
    pub symbols: Option<Vec<u8>>,
}

/// A linked module.
pub trait Module: Send + Sync {
    /// Module name, used for duplicate detection.
    fn name(&self) -> &str;

    /// Module version.
    fn version(&self) -> &str {
        "0.0.0"
    }

    /// Factories for every plugin type the module exports, in declaration
    /// order.
    fn entry_point(&self) -> Result<Vec<PluginFactory>>;
}

/// Links module images into the process.
pub trait ModuleBackend: Send + Sync {
    /// File extension of module files, without the dot.
    fn extension(&self) -> &str;

    /// File extension of companion debug-symbol files, without the dot.
    fn symbols_extension(&self) -> &str;

    /// Link `image` as a new module instance.
    ///
    /// Dependency lookups the module needs while linking go through `deps`,
    /// which resolves them with this image as the owner.
    fn load(&self, image: ModuleImage, deps: &DependencyScope<'_>) -> Result<Arc<dyn Module>>;
}

/// One module image handed to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModuleRecord {
    /// Module identity.
    pub id: ModuleId,
    /// File the module was read from.
    pub source_path: PathBuf,
}

/// Append-only table of every module image this process has linked.
///
/// Linked modules stay resident for the life of the process, even after the
/// table itself is dropped: instances and vtables handed out by a module may
/// outlive every loader that knew about it.
#[derive(Default)]
pub struct ModuleTable {
    records: RwLock<Vec<LoadedModuleRecord>>,
    resident: DashMap<ModuleId, Arc<dyn Module>>,
}

impl ModuleTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the record for an image about to be linked.
    pub fn stage(&self, id: ModuleId, source_path: &Path) {
        self.records.write().push(LoadedModuleRecord {
            id,
            source_path: source_path.to_path_buf(),
        });
    }

    /// Keep a linked module resident.
    pub fn retain(&self, id: ModuleId, module: Arc<dyn Module>) {
        // The leaked reference keeps the module's code mapped forever.
        std::mem::forget(module.clone());
        self.resident.insert(id, module);
        tracing::debug!("{} modules resident", self.resident.len());
    }

    /// Most recently appended record for `id`.
    pub fn latest(&self, id: ModuleId) -> Option<LoadedModuleRecord> {
        self.records
            .read()
            .iter()
            .rev()
            .find(|r| r.id == id)
            .cloned()
    }

    /// The resident module with this id.
    pub fn module(&self, id: ModuleId) -> Option<Arc<dyn Module>> {
        self.resident.get(&id).map(|m| m.value().clone())
    }

    /// All records, in append order.
    pub fn records(&self) -> Vec<LoadedModuleRecord> {
        self.records.read().clone()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Check if nothing was ever loaded.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Number of modules resident in the process.
    pub fn resident_count(&self) -> usize {
        self.resident.len()
    }
}

impl fmt::Debug for ModuleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleTable")
            .field("records", &self.len())
            .field("resident", &self.resident_count())
            .finish()
    }
}
