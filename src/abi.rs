//! C ABI shared between the host and loaded modules.
//!
//! A module publishes a single [`ExportTable`] under [`EXPORT_TABLE_SYMBOL`].
//! The table names the module, lists every exported `(type, member)` pair with
//! the signature it was compiled with, and optionally carries `attach` and
//! `detach` hooks. On attach the module receives the [`HostCallbackTable`],
//! which is how it calls back into host-owned objects it holds tokens for.
//!
//! Plugin crates normally build the table with [`ModuleExports`] and emit the
//! entry symbol with [`declare_export_table!`](crate::declare_export_table).

use std::ffi::{c_char, c_void, CStr, CString};
use std::fmt;

/// Export ABI version understood by this host.
pub const PLUGIN_ABI_VERSION: u32 = 1;

/// Symbol every module must export.
pub const EXPORT_TABLE_SYMBOL: &str = "plugin_host_export_table";

/// Maximum number of arguments an exported function may take.
pub const MAX_ARGS: usize = 6;

/// Host callback succeeded.
pub const CALLBACK_OK: i32 = 0;
/// Token is unknown, released, or refers to an object of another kind.
pub const CALLBACK_UNKNOWN_HANDLE: i32 = 1;
/// Null pointer or invalid UTF-8 passed by the module.
pub const CALLBACK_INVALID_ARGUMENT: i32 = 2;
/// The host object panicked while serving the callback.
pub const CALLBACK_PANICKED: i32 = 3;

/// Returns the module's export table. Exported as [`EXPORT_TABLE_SYMBOL`].
pub type ExportTableFn = unsafe extern "C" fn() -> *const ExportTable;

/// Called once after the module is loaded. Non-zero fails the load.
pub type AttachFn = unsafe extern "C" fn(host: *const HostCallbackTable) -> i32;

/// Called once when the owning context is disposed.
pub type DetachFn = unsafe extern "C" fn();

/// Primitive types that may cross the module boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AbiType {
    Void = 0,
    Bool = 1,
    I8 = 2,
    U8 = 3,
    I16 = 4,
    U16 = 5,
    I32 = 6,
    U32 = 7,
    I64 = 8,
    U64 = 9,
    F32 = 10,
    F64 = 11,
    Pointer = 12,
    Handle = 13,
}

impl AbiType {
    /// Decode a type code read from foreign memory.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => AbiType::Void,
            1 => AbiType::Bool,
            2 => AbiType::I8,
            3 => AbiType::U8,
            4 => AbiType::I16,
            5 => AbiType::U16,
            6 => AbiType::I32,
            7 => AbiType::U32,
            8 => AbiType::I64,
            9 => AbiType::U64,
            10 => AbiType::F32,
            11 => AbiType::F64,
            12 => AbiType::Pointer,
            13 => AbiType::Handle,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for AbiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AbiType::Void => "()",
            AbiType::Bool => "bool",
            AbiType::I8 => "i8",
            AbiType::U8 => "u8",
            AbiType::I16 => "i16",
            AbiType::U16 => "u16",
            AbiType::I32 => "i32",
            AbiType::U32 => "u32",
            AbiType::I64 => "i64",
            AbiType::U64 => "u64",
            AbiType::F32 => "f32",
            AbiType::F64 => "f64",
            AbiType::Pointer => "ptr",
            AbiType::Handle => "handle",
        };
        f.write_str(name)
    }
}

/// Argument and return layout of an exported function.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignatureShape {
    pub args: Vec<AbiType>,
    pub ret: AbiType,
}

impl SignatureShape {
    pub fn new(args: Vec<AbiType>, ret: AbiType) -> Self {
        Self { args, ret }
    }
}

impl fmt::Display for SignatureShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("fn(")?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", arg)?;
        }
        f.write_str(")")?;
        if self.ret != AbiType::Void {
            write!(f, " -> {}", self.ret)?;
        }
        Ok(())
    }
}

/// A Rust type with a fixed [`AbiType`] representation.
///
/// # Safety
/// The type must be passed by value in registers or on the stack exactly like
/// the C type named by `ABI_TYPE`.
pub unsafe trait AbiValue: Copy + 'static {
    const ABI_TYPE: AbiType;
}

/// An [`AbiValue`] that may appear in argument position.
///
/// Everything except `()`, so a void argument is rejected when the export
/// table is built rather than when it is loaded:
///
/// ```compile_fail
/// use native_plugin_host::ModuleExports;
///
/// extern "C" fn takes_void(_: ()) {}
///
/// ModuleExports::new(c"Bad").export(c"Bad.Ops", c"Run", takes_void as extern "C" fn(()));
/// ```
pub trait AbiArg: AbiValue {}

unsafe impl AbiValue for () {
    const ABI_TYPE: AbiType = AbiType::Void;
}

macro_rules! impl_abi_value {
    ($($ty:ty => $abi:ident),* $(,)?) => {
        $(
            unsafe impl AbiValue for $ty {
                const ABI_TYPE: AbiType = AbiType::$abi;
            }

            impl AbiArg for $ty {}
        )*
    };
}

impl_abi_value! {
    bool => Bool,
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
}

unsafe impl<T: 'static> AbiValue for *const T {
    const ABI_TYPE: AbiType = AbiType::Pointer;
}

impl<T: 'static> AbiArg for *const T {}

unsafe impl<T: 'static> AbiValue for *mut T {
    const ABI_TYPE: AbiType = AbiType::Pointer;
}

impl<T: 'static> AbiArg for *mut T {}

/// An `extern "C"` function pointer type that can be bound to an export.
///
/// # Safety
/// `from_address` must only be given addresses whose declared shape equals
/// `shape()`.
pub unsafe trait Signature: Copy + Send + Sync + 'static {
    fn shape() -> SignatureShape;

    fn address(self) -> *const c_void;

    /// # Safety
    /// `address` must point to a function with this exact signature.
    unsafe fn from_address(address: *const c_void) -> Self;
}

macro_rules! impl_signature {
    ($($arg:ident),*) => {
        unsafe impl<R: AbiValue, $($arg: AbiArg),*> Signature for extern "C" fn($($arg),*) -> R {
            fn shape() -> SignatureShape {
                SignatureShape::new(
                    vec![$(<$arg as AbiValue>::ABI_TYPE),*],
                    <R as AbiValue>::ABI_TYPE,
                )
            }

            fn address(self) -> *const c_void {
                self as *const c_void
            }

            unsafe fn from_address(address: *const c_void) -> Self {
                std::mem::transmute_copy::<*const c_void, Self>(&address)
            }
        }
    };
}

impl_signature!();
impl_signature!(A);
impl_signature!(A, B);
impl_signature!(A, B, C);
impl_signature!(A, B, C, D);
impl_signature!(A, B, C, D, E);
impl_signature!(A, B, C, D, E, G);

/// One exported function as laid out in foreign memory.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ExportEntry {
    pub type_name: *const c_char,
    pub member: *const c_char,
    pub ret: u8,
    pub arg_count: u8,
    pub args: [u8; MAX_ARGS],
    pub address: *const c_void,
}

/// Table returned by a module's [`EXPORT_TABLE_SYMBOL`].
#[repr(C)]
#[derive(Debug)]
pub struct ExportTable {
    pub abi_version: u32,
    pub module_name: *const c_char,
    pub entries: *const ExportEntry,
    pub entry_count: usize,
    pub attach: Option<AttachFn>,
    pub detach: Option<DetachFn>,
}

/// Host functions handed to a module on attach.
///
/// Tokens are the raw values of [`HandleToken`](crate::HandleToken)s the host
/// passed into the module.
#[repr(C)]
#[derive(Debug)]
pub struct HostCallbackTable {
    pub abi_version: u32,
    /// Log through a published logger. Returns a `CALLBACK_*` status.
    pub log: extern "C" fn(logger: u64, level: u8, message: *const u8, len: usize) -> i32,
    /// Create a logger from a published factory. Returns the new token, or 0.
    pub create_logger: extern "C" fn(factory: u64, category: *const u8, len: usize) -> u64,
    /// Release a token the module obtained from `create_logger`.
    pub release: extern "C" fn(token: u64) -> i32,
}

/// Builder for a module's export table, used on the plugin side.
///
/// ```rust,ignore
/// extern "C" fn add(a: i32, b: i32) -> i32 { a + b }
///
/// native_plugin_host::declare_export_table!(
///     ModuleExports::new(c"Arith")
///         .export(c"Arith.Calculator", c"Add", add as extern "C" fn(i32, i32) -> i32)
///         .build()
/// );
/// ```
pub struct ModuleExports {
    module_name: CString,
    names: Vec<CString>,
    entries: Vec<ExportEntry>,
    attach: Option<AttachFn>,
    detach: Option<DetachFn>,
}

impl ModuleExports {
    pub fn new(module_name: &CStr) -> Self {
        Self {
            module_name: module_name.to_owned(),
            names: Vec::new(),
            entries: Vec::new(),
            attach: None,
            detach: None,
        }
    }

    /// Export `function` as `type_name::member`.
    pub fn export<F: Signature>(mut self, type_name: &CStr, member: &CStr, function: F) -> Self {
        let shape = F::shape();
        let mut args = [0u8; MAX_ARGS];
        for (slot, arg) in args.iter_mut().zip(&shape.args) {
            *slot = arg.code();
        }

        let type_name = type_name.to_owned();
        let member = member.to_owned();
        // CString data lives on the heap, so these pointers survive moves of `names`.
        let entry = ExportEntry {
            type_name: type_name.as_ptr(),
            member: member.as_ptr(),
            ret: shape.ret.code(),
            arg_count: shape.args.len() as u8,
            args,
            address: function.address(),
        };
        self.names.push(type_name);
        self.names.push(member);
        self.entries.push(entry);
        self
    }

    pub fn on_attach(mut self, hook: AttachFn) -> Self {
        self.attach = Some(hook);
        self
    }

    pub fn on_detach(mut self, hook: DetachFn) -> Self {
        self.detach = Some(hook);
        self
    }

    pub fn build(self) -> ExportedModule {
        let table = ExportTable {
            abi_version: PLUGIN_ABI_VERSION,
            module_name: self.module_name.as_ptr(),
            entries: self.entries.as_ptr(),
            entry_count: self.entries.len(),
            attach: self.attach,
            detach: self.detach,
        };
        ExportedModule {
            _module_name: self.module_name,
            _names: self.names,
            _entries: self.entries,
            table,
        }
    }
}

/// An export table together with the storage it points into.
pub struct ExportedModule {
    _module_name: CString,
    _names: Vec<CString>,
    _entries: Vec<ExportEntry>,
    table: ExportTable,
}

impl ExportedModule {
    /// Pointer to the table. Valid while `self` stays in place.
    pub fn as_ptr(&self) -> *const ExportTable {
        &self.table
    }
}

// Immutable after `build`; every pointer targets heap data owned by `self`
// or code in the module image.
unsafe impl Send for ExportedModule {}
unsafe impl Sync for ExportedModule {}

/// Emit the `plugin_host_export_table` symbol for a plugin crate.
///
/// The expression is evaluated once, on first lookup.
#[macro_export]
macro_rules! declare_export_table {
    ($build:expr) => {
        #[no_mangle]
        pub extern "C" fn plugin_host_export_table() -> *const $crate::ExportTable {
            static EXPORTS: ::std::sync::OnceLock<$crate::ExportedModule> =
                ::std::sync::OnceLock::new();
            EXPORTS.get_or_init(|| $build).as_ptr()
        }
    };
}
