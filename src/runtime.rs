//! Runtimes that map a module image into the process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use crate::abi::{ExportTable, ExportTableFn};
use crate::config::clean_path;
use crate::error::{HostError, Result};

/// How many contexts a runtime can back at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    /// Any number of contexts may be active.
    Shared,
    /// At most one active context per process.
    ProcessExclusive,
}

/// Loads module images for an [`ExecutionContext`](crate::ExecutionContext).
pub trait Runtime: Send + Sync {
    /// Name a runtime config descriptor must target.
    fn name(&self) -> &str;

    fn isolation(&self) -> Isolation {
        Isolation::Shared
    }

    /// Map the module at `path` (already normalized) and locate its export table.
    fn load(&self, path: &Path) -> Result<Box<dyn ModuleImage>>;
}

/// A mapped module. Dropping it may unmap the module's code.
pub trait ModuleImage: Send + Sync {
    /// The module's export table, valid while `self` is alive.
    fn export_table(&self) -> *const ExportTable;
}

/// Runtime for modules linked into the host binary.
///
/// Modules are registered under virtual paths; loading one calls its export
/// table function. Useful for embedding plugins statically and for tests.
pub struct StaticRuntime {
    name: String,
    isolation: Isolation,
    modules: RwLock<HashMap<PathBuf, ExportTableFn>>,
    loads: AtomicUsize,
}

struct StaticImage {
    table: *const ExportTable,
}

// The table is 'static data owned by the host binary.
unsafe impl Send for StaticImage {}
unsafe impl Sync for StaticImage {}

impl ModuleImage for StaticImage {
    fn export_table(&self) -> *const ExportTable {
        self.table
    }
}

impl StaticRuntime {
    /// Create a runtime named `"static"`.
    pub fn new() -> Self {
        Self::named("static")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            isolation: Isolation::Shared,
            modules: RwLock::new(HashMap::new()),
            loads: AtomicUsize::new(0),
        }
    }

    /// Restrict the runtime to one active context per process.
    pub fn exclusive(mut self) -> Self {
        self.isolation = Isolation::ProcessExclusive;
        self
    }

    /// Register a module under an absolute virtual path.
    pub fn register(&self, path: impl AsRef<Path>, exports: ExportTableFn) -> &Self {
        let path = clean_path(path.as_ref());
        tracing::debug!("Registered static module at {:?}", path);
        if let Ok(mut modules) = self.modules.write() {
            modules.insert(path, exports);
        }
        self
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_module(self, path: impl AsRef<Path>, exports: ExportTableFn) -> Self {
        self.register(path, exports);
        self
    }

    /// Number of images this runtime has mapped.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl Default for StaticRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime for StaticRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    fn isolation(&self) -> Isolation {
        self.isolation
    }

    fn load(&self, path: &Path) -> Result<Box<dyn ModuleImage>> {
        let exports = self
            .modules
            .read()
            .ok()
            .and_then(|modules| modules.get(&clean_path(path)).copied())
            .ok_or_else(|| HostError::module_load(path, "no module registered at this path"))?;

        let table = unsafe { exports() };
        if table.is_null() {
            return Err(HostError::module_load(path, "export table function returned null"));
        }

        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StaticImage { table }))
    }
}
