//! Host for a natively loaded plugin module.
//!
//! The host initializes an execution context from a runtime config
//! descriptor, loads one module into it on first use, binds exported members
//! to typed `extern "C"` function pointers, and hands the module opaque
//! tokens for host-owned objects such as loggers.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use native_plugin_host::{HostConfig, PluginHost, TracingLoggerFactory};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let host = PluginHost::native(HostConfig::default());
//!     host.initialize("Calculator.runtimeconfig.json")?;
//!
//!     let add = host.get_function::<extern "C" fn(i32, i32) -> i32>(
//!         "libcalculator.so",
//!         "Calculator.Ops, Calculator",
//!         "Add",
//!     )?;
//!     let set_factory = host.get_function::<extern "C" fn(native_plugin_host::RawHandle)>(
//!         "libcalculator.so",
//!         "Calculator.Ops, Calculator",
//!         "SetLoggerFactory",
//!     )?;
//!
//!     let factory = host.publish_logger_factory("logger-factory", Arc::new(TracingLoggerFactory))?;
//!     set_factory.invoke(factory.into())?;
//!
//!     println!("{}", add.invoke(2, 3)?);
//!
//!     host.dispose();
//!     Ok(())
//! }
//! ```

mod abi;
mod callbacks;
mod config;
mod context;
mod error;
mod handles;
mod host;
mod loader;
mod module;
mod resolver;
mod runtime;

pub use abi::*;
pub use callbacks::*;
pub use config::*;
pub use context::*;
pub use error::*;
pub use handles::*;
pub use host::*;
pub use loader::*;
pub use module::*;
pub use resolver::*;
pub use runtime::*;
