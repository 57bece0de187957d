//! Native module loader using libloading.

use std::path::Path;

use libloading::{Library, Symbol};

use crate::abi::{ExportTable, ExportTableFn, EXPORT_TABLE_SYMBOL};
use crate::error::{HostError, Result};
use crate::runtime::{Isolation, ModuleImage, Runtime};

/// Runtime that loads shared libraries (`.so`, `.dylib`, `.dll`).
///
/// The dynamic loader is process-global, so this runtime backs at most one
/// active context per process. Loaded modules are trusted: their code runs
/// in-process with no sandboxing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeRuntime;

/// A loaded shared library and its export table.
struct NativeImage {
    /// The table points into the library, so it must stay loaded
    table: *const ExportTable,
    _library: Library,
}

// The table is immutable data inside the library, kept mapped by `_library`.
unsafe impl Send for NativeImage {}
unsafe impl Sync for NativeImage {}

impl ModuleImage for NativeImage {
    fn export_table(&self) -> *const ExportTable {
        self.table
    }
}

impl NativeRuntime {
    pub fn new() -> Self {
        Self
    }

    /// Platform file name for a library called `name` (`libname.so`, `name.dll`, ...).
    pub fn library_file_name(name: &str) -> String {
        if cfg!(target_os = "windows") {
            format!("{}.dll", name)
        } else if cfg!(target_os = "macos") {
            format!("lib{}.dylib", name)
        } else {
            format!("lib{}.so", name)
        }
    }
}

impl Runtime for NativeRuntime {
    fn name(&self) -> &str {
        "native"
    }

    fn isolation(&self) -> Isolation {
        Isolation::ProcessExclusive
    }

    fn load(&self, path: &Path) -> Result<Box<dyn ModuleImage>> {
        if !path.is_file() {
            return Err(HostError::module_load(path, "file not found"));
        }

        // Load the library
        let library = unsafe { Library::new(path) }
            .map_err(|e| HostError::module_load(path, e.to_string()))?;

        // Get the export table entry point
        let table = {
            let entry: Symbol<ExportTableFn> = unsafe { library.get(EXPORT_TABLE_SYMBOL.as_bytes()) }
                .map_err(|e| {
                    HostError::module_load(
                        path,
                        format!("missing {} symbol: {}", EXPORT_TABLE_SYMBOL, e),
                    )
                })?;
            unsafe { entry() }
        };

        if table.is_null() {
            return Err(HostError::module_load(path, "export table function returned null"));
        }

        tracing::debug!("Mapped native library {:?}", path);
        Ok(Box::new(NativeImage {
            table,
            _library: library,
        }))
    }
}
