//! Host callbacks that loaded modules can use.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::abi::{
    HostCallbackTable, CALLBACK_INVALID_ARGUMENT, CALLBACK_OK, CALLBACK_PANICKED,
    CALLBACK_UNKNOWN_HANDLE, PLUGIN_ABI_VERSION,
};
use crate::handles::{HandleTable, HandleToken};

/// Severity passed across the boundary as `u8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// 0=trace, 1=debug, 2=info, 3=warn, anything else is error.
    pub fn from_u8(level: u8) -> Self {
        match level {
            0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A host-side logger a module may log through.
///
/// Called from inside foreign code. A panic is caught at the boundary and
/// reported to the module as [`CALLBACK_PANICKED`].
pub trait HostLogger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Creates categorized loggers on behalf of a module.
pub trait LoggerFactory: Send + Sync {
    fn create_logger(&self, category: &str) -> Arc<dyn HostLogger>;
}

/// Logger that forwards to `tracing` with its category as a field.
pub struct TracingLogger {
    category: String,
}

impl TracingLogger {
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
        }
    }

    pub fn category(&self) -> &str {
        &self.category
    }
}

impl HostLogger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        let category = self.category.as_str();
        match level {
            LogLevel::Trace => tracing::trace!(category, "[plugin] {}", message),
            LogLevel::Debug => tracing::debug!(category, "[plugin] {}", message),
            LogLevel::Info => tracing::info!(category, "[plugin] {}", message),
            LogLevel::Warn => tracing::warn!(category, "[plugin] {}", message),
            LogLevel::Error => tracing::error!(category, "[plugin] {}", message),
        }
    }
}

/// Factory producing [`TracingLogger`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLoggerFactory;

impl LoggerFactory for TracingLoggerFactory {
    fn create_logger(&self, category: &str) -> Arc<dyn HostLogger> {
        Arc::new(TracingLogger::new(category))
    }
}

/// Pinned form of a logger inside a [`HandleTable`].
pub struct LoggerHandle(pub Arc<dyn HostLogger>);

/// Pinned form of a logger factory inside a [`HandleTable`].
pub struct LoggerFactoryHandle(pub Arc<dyn LoggerFactory>);

/// Bridge between host objects and the C callback table.
pub struct CallbackBridge;

impl CallbackBridge {
    /// The callback table handed to modules on attach.
    pub fn table() -> &'static HostCallbackTable {
        &HOST_CALLBACKS
    }

    /// Get a pointer to the table.
    pub fn table_ptr() -> *const HostCallbackTable {
        &HOST_CALLBACKS
    }
}

static HOST_CALLBACKS: HostCallbackTable = HostCallbackTable {
    abi_version: PLUGIN_ABI_VERSION,
    log: bridge_log,
    create_logger: bridge_create_logger,
    release: bridge_release,
};

/// Borrow `len` bytes at `ptr` as UTF-8.
///
/// # Safety
/// `ptr` must be null or valid for `len` bytes for the duration of the call.
unsafe fn foreign_str<'a>(ptr: *const u8, len: usize) -> Option<&'a str> {
    if ptr.is_null() {
        return if len == 0 { Some("") } else { None };
    }
    std::str::from_utf8(std::slice::from_raw_parts(ptr, len)).ok()
}

/// Run a callback body, turning a panic into `on_panic`.
fn guarded<T>(callback: &str, on_panic: T, body: impl FnOnce() -> T) -> T {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => value,
        Err(_) => {
            tracing::error!("Host object panicked inside {} callback", callback);
            on_panic
        }
    }
}

extern "C" fn bridge_log(logger: u64, level: u8, message: *const u8, len: usize) -> i32 {
    let Some(message) = (unsafe { foreign_str(message, len) }) else {
        return CALLBACK_INVALID_ARGUMENT;
    };
    let Some(handle) = HandleTable::resolve::<LoggerHandle>(logger) else {
        return CALLBACK_UNKNOWN_HANDLE;
    };
    guarded("log", CALLBACK_PANICKED, || {
        handle.0.log(LogLevel::from_u8(level), message);
        CALLBACK_OK
    })
}

extern "C" fn bridge_create_logger(factory: u64, category: *const u8, len: usize) -> u64 {
    let Some(category) = (unsafe { foreign_str(category, len) }) else {
        return 0;
    };
    let Some(handle) = HandleTable::resolve::<LoggerFactoryHandle>(factory) else {
        tracing::warn!("create_logger called with unknown factory handle {}", factory);
        return 0;
    };
    // The new logger lives exactly as long as the factory's table.
    let Some(owner) = HandleTable::owner_of(factory) else {
        return 0;
    };
    guarded("create_logger", 0, || {
        let logger = handle.0.create_logger(category);
        owner.publish(Arc::new(LoggerHandle(logger))).as_raw()
    })
}

extern "C" fn bridge_release(token: u64) -> i32 {
    match HandleTable::owner_of(token) {
        Some(owner) => match HandleToken::from_raw(token) {
            Some(token) if owner.release(token) => CALLBACK_OK,
            _ => CALLBACK_UNKNOWN_HANDLE,
        },
        None => {
            tracing::warn!("Module released unknown handle {}", token);
            CALLBACK_UNKNOWN_HANDLE
        }
    }
}
