//! Loaded modules and the names used to address their exports.

use std::collections::{HashMap, HashSet};
use std::ffi::{c_char, c_void, CStr};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::abi::{
    AbiType, AttachFn, DetachFn, ExportEntry, HostCallbackTable, SignatureShape, MAX_ARGS,
    PLUGIN_ABI_VERSION,
};
use crate::error::{HostError, Result};
use crate::runtime::ModuleImage;

/// Type part of an entry-point address: `Namespace.Type[, Module[, Key=Value...]]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeQualifier {
    type_name: String,
    module: Option<String>,
}

impl TypeQualifier {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Module the qualifier expects the type to live in, if given.
    pub fn module(&self) -> Option<&str> {
        self.module.as_deref()
    }
}

impl FromStr for TypeQualifier {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| HostError::InvalidEntryPoint(format!("'{}': {}", s, reason));

        let mut parts = s.split(',').map(str::trim);
        let type_name = parts.next().unwrap_or_default();
        if type_name.is_empty() {
            return Err(invalid("missing type name"));
        }
        if type_name.chars().any(char::is_whitespace) {
            return Err(invalid("type name contains whitespace"));
        }

        let module = match parts.next() {
            None => None,
            Some("") => return Err(invalid("empty module name")),
            Some(m) if m.contains('=') => return Err(invalid("module name must precede attributes")),
            Some(m) => Some(m.to_string()),
        };

        // Version=, Culture= and similar attributes are accepted and ignored
        for attribute in parts {
            match attribute.split_once('=') {
                Some((key, _)) if !key.trim().is_empty() => {}
                _ => return Err(invalid("expected Key=Value attribute")),
            }
        }

        Ok(Self {
            type_name: type_name.to_string(),
            module,
        })
    }
}

impl fmt::Display for TypeQualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.module {
            Some(module) => write!(f, "{}, {}", self.type_name, module),
            None => f.write_str(&self.type_name),
        }
    }
}

/// Everything needed to bind one exported member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleReference {
    pub path: PathBuf,
    pub qualifier: TypeQualifier,
    pub member: String,
}

impl ModuleReference {
    pub fn new(path: impl Into<PathBuf>, type_name: &str, member: &str) -> Result<Self> {
        let member = member.trim();
        if member.is_empty() || member.contains(',') || member.chars().any(char::is_whitespace) {
            return Err(HostError::InvalidEntryPoint(format!(
                "invalid member name '{}'",
                member
            )));
        }
        Ok(Self {
            path: path.into(),
            qualifier: type_name.parse()?,
            member: member.to_string(),
        })
    }
}

/// Address of an exported function inside a mapped module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawAddress(*const c_void);

impl RawAddress {
    pub fn as_ptr(self) -> *const c_void {
        self.0
    }
}

// Points at immutable code; only dereferenced through a validated signature.
unsafe impl Send for RawAddress {}
unsafe impl Sync for RawAddress {}

#[derive(Debug, Clone)]
struct ExportDecl {
    shape: SignatureShape,
    address: RawAddress,
}

/// A module mapped into an execution context.
pub struct LoadedModule {
    path: PathBuf,
    name: String,
    types: HashSet<String>,
    exports: HashMap<(String, String), ExportDecl>,
    attach: Option<AttachFn>,
    detach: Option<DetachFn>,
    detached: AtomicBool,
    // Dropped last: everything above points into the image.
    _image: Box<dyn ModuleImage>,
}

impl LoadedModule {
    /// Decode and validate the image's export table.
    ///
    /// # Safety
    /// The image's export table pointer must be null or point to a table laid
    /// out as [`ExportTable`](crate::ExportTable) whose strings and entries stay
    /// valid while the image is alive.
    pub(crate) unsafe fn from_image(path: PathBuf, image: Box<dyn ModuleImage>) -> Result<Self> {
        let malformed = |reason: String| HostError::module_load(&path, reason);

        let table_ptr = image.export_table();
        if table_ptr.is_null() {
            return Err(malformed("export table is null".into()));
        }
        let table = &*table_ptr;

        if table.abi_version != PLUGIN_ABI_VERSION {
            return Err(malformed(format!(
                "incompatible ABI version: expected {}, got {}",
                PLUGIN_ABI_VERSION, table.abi_version
            )));
        }

        let name = read_name(table.module_name).map_err(|e| malformed(format!("module name {}", e)))?;

        let entries: &[ExportEntry] = if table.entry_count == 0 {
            &[]
        } else if table.entries.is_null() {
            return Err(malformed("entry list is null".into()));
        } else {
            std::slice::from_raw_parts(table.entries, table.entry_count)
        };

        let mut types = HashSet::new();
        let mut exports = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let type_name =
                read_name(entry.type_name).map_err(|e| malformed(format!("entry {} type {}", i, e)))?;
            let member =
                read_name(entry.member).map_err(|e| malformed(format!("entry {} member {}", i, e)))?;
            let symbol = format!("{}::{}", type_name, member);

            let shape = decode_shape(entry).map_err(|e| malformed(format!("{}: {}", symbol, e)))?;
            if entry.address.is_null() {
                return Err(malformed(format!("{}: null address", symbol)));
            }

            types.insert(type_name.clone());
            let decl = ExportDecl {
                shape,
                address: RawAddress(entry.address),
            };
            if exports.insert((type_name, member), decl).is_some() {
                return Err(malformed(format!("{} exported twice", symbol)));
            }
        }

        Ok(Self {
            path,
            name,
            types,
            exports,
            attach: table.attach,
            detach: table.detach,
            detached: AtomicBool::new(false),
            _image: image,
        })
    }

    /// Normalized path the module was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name the module declares for itself.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn export_count(&self) -> usize {
        self.exports.len()
    }

    pub fn has_type(&self, type_name: &str) -> bool {
        self.types.contains(type_name)
    }

    /// Find `qualifier::member`, returning its declared shape and address.
    pub(crate) fn lookup(
        &self,
        qualifier: &TypeQualifier,
        member: &str,
    ) -> Result<(&SignatureShape, RawAddress)> {
        if let Some(module) = qualifier.module() {
            if !module.eq_ignore_ascii_case(&self.name) {
                return Err(HostError::SymbolNotFound(format!(
                    "{} (loaded module is '{}')",
                    qualifier, self.name
                )));
            }
        }
        if !self.has_type(qualifier.type_name()) {
            return Err(HostError::SymbolNotFound(format!(
                "type '{}' not found in module '{}'",
                qualifier.type_name(),
                self.name
            )));
        }
        self.exports
            .get(&(qualifier.type_name().to_string(), member.to_string()))
            .map(|decl| (&decl.shape, decl.address))
            .ok_or_else(|| {
                HostError::SymbolNotFound(format!(
                    "member '{}::{}' not found in module '{}'",
                    qualifier.type_name(),
                    member,
                    self.name
                ))
            })
    }

    /// Run the module's attach hook.
    pub(crate) fn attach(&self, host: *const HostCallbackTable) -> Result<()> {
        let Some(attach) = self.attach else {
            return Ok(());
        };
        let status = unsafe { attach(host) };
        if status == 0 {
            Ok(())
        } else {
            Err(HostError::module_load(
                &self.path,
                format!("attach returned error code: {}", status),
            ))
        }
    }

    /// Run the module's detach hook once.
    pub(crate) fn detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(detach) = self.detach {
            unsafe { detach() };
            tracing::debug!("Detached module '{}'", self.name);
        }
    }
}

impl fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModule")
            .field("path", &self.path)
            .field("name", &self.name)
            .field("exports", &self.exports.len())
            .finish()
    }
}

unsafe fn read_name(ptr: *const c_char) -> std::result::Result<String, &'static str> {
    if ptr.is_null() {
        return Err("is null");
    }
    let name = CStr::from_ptr(ptr).to_str().map_err(|_| "is not UTF-8")?;
    if name.is_empty() {
        return Err("is empty");
    }
    Ok(name.to_string())
}

fn decode_shape(entry: &ExportEntry) -> std::result::Result<SignatureShape, String> {
    let arg_count = entry.arg_count as usize;
    if arg_count > MAX_ARGS {
        return Err(format!("{} arguments exceeds the maximum of {}", arg_count, MAX_ARGS));
    }
    let args = entry.args[..arg_count]
        .iter()
        .map(|&code| match AbiType::from_code(code) {
            Some(AbiType::Void) => Err("void argument".to_string()),
            Some(ty) => Ok(ty),
            None => Err(format!("unknown argument type code {}", code)),
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let ret = AbiType::from_code(entry.ret)
        .ok_or_else(|| format!("unknown return type code {}", entry.ret))?;
    Ok(SignatureShape::new(args, ret))
}
