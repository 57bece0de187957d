//! Main plugin host implementation.

use std::any::Any;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::abi::Signature;
use crate::callbacks::{HostLogger, LoggerFactory, LoggerFactoryHandle, LoggerHandle};
use crate::config::HostConfig;
use crate::context::{ContextState, ExecutionContext};
use crate::error::{HostError, Result};
use crate::handles::HandleToken;
use crate::loader::NativeRuntime;
use crate::module::ModuleReference;
use crate::resolver::{BoundFunction, SymbolResolver};
use crate::runtime::Runtime;

/// Plugin host: initialize once, bind typed functions, dispose once.
///
/// Safe to share between threads. Disposal also happens on drop.
pub struct PluginHost {
    config: HostConfig,
    runtime: Arc<dyn Runtime>,
    context: RwLock<Option<Arc<ExecutionContext>>>,
}

impl PluginHost {
    /// Create a host over a custom runtime.
    pub fn new(runtime: Arc<dyn Runtime>, config: HostConfig) -> Self {
        Self {
            config,
            runtime,
            context: RwLock::new(None),
        }
    }

    /// Create a host that loads shared libraries.
    pub fn native(config: HostConfig) -> Self {
        Self::new(Arc::new(NativeRuntime::new()), config)
    }

    /// Get the configuration.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    fn read_context(&self) -> RwLockReadGuard<'_, Option<Arc<ExecutionContext>>> {
        self.context
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_context(&self) -> RwLockWriteGuard<'_, Option<Arc<ExecutionContext>>> {
        self.context
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The current execution context, if `initialize` has been called.
    pub fn context(&self) -> Option<Arc<ExecutionContext>> {
        self.read_context().clone()
    }

    fn active_context(&self) -> Result<Arc<ExecutionContext>> {
        self.context()
            .ok_or_else(|| HostError::InvalidOperation("plugin host is not initialized".into()))
    }

    pub fn is_initialized(&self) -> bool {
        self.context()
            .is_some_and(|ctx| ctx.state() == ContextState::Ready)
    }

    // === Lifecycle ===

    /// Create an execution context from the runtime config at `config_path`.
    ///
    /// After `dispose`, calling this again starts a fresh context.
    pub fn initialize(&self, config_path: impl AsRef<Path>) -> Result<()> {
        let mut slot = self.write_context();
        if let Some(existing) = slot.as_ref() {
            if existing.state() != ContextState::Disposed {
                return Err(HostError::InvalidOperation(
                    "plugin host is already initialized".into(),
                ));
            }
        }

        let context = Arc::new(ExecutionContext::new(
            self.runtime.clone(),
            self.config.clone(),
        ));
        if let Err(e) = context.initialize(config_path.as_ref()) {
            tracing::error!("Failed to initialize plugin host: {}", e);
            return Err(e);
        }

        *slot = Some(context);
        Ok(())
    }

    /// Dispose the current execution context. Idempotent.
    pub fn dispose(&self) {
        if let Some(context) = self.read_context().as_ref() {
            context.dispose();
        }
    }

    // === Binding ===

    /// Bind `type_name::member` from the module at `module_path` as `F`.
    ///
    /// `type_name` is `Namespace.Type` optionally followed by `, ModuleName`.
    /// The module is loaded on first use.
    pub fn get_function<F: Signature>(
        &self,
        module_path: impl AsRef<Path>,
        type_name: &str,
        member: &str,
    ) -> Result<BoundFunction<F>> {
        let context = self.active_context()?;
        let module_ref = ModuleReference::new(module_path.as_ref(), type_name, member)?;
        SymbolResolver::new(context).resolve(&module_ref).map_err(|e| {
            tracing::warn!("Failed to bind {}::{}: {}", type_name, member, e);
            e
        })
    }

    // === Handles ===

    /// Pin `object` under `slot`, replacing whatever was published there.
    pub fn publish<T: Any + Send + Sync>(&self, slot: &str, object: Arc<T>) -> Result<HandleToken> {
        self.active_context()?.publish(slot, object)
    }

    /// Publish a logger the module can log through.
    pub fn publish_logger(&self, slot: &str, logger: Arc<dyn HostLogger>) -> Result<HandleToken> {
        self.publish(slot, Arc::new(LoggerHandle(logger)))
    }

    /// Publish a factory the module can create loggers from.
    pub fn publish_logger_factory(
        &self,
        slot: &str,
        factory: Arc<dyn LoggerFactory>,
    ) -> Result<HandleToken> {
        self.publish(slot, Arc::new(LoggerFactoryHandle(factory)))
    }

    /// Retract a published token. Unknown tokens are ignored.
    pub fn release(&self, token: HandleToken) -> bool {
        match self.context() {
            Some(context) => context.handles().release(token),
            None => {
                tracing::warn!("Ignoring release of {} before initialization", token);
                false
            }
        }
    }

    /// Number of host objects currently pinned for the module.
    pub fn pinned_count(&self) -> usize {
        self.context()
            .map(|ctx| ctx.handles().pinned_count())
            .unwrap_or(0)
    }
}

impl Drop for PluginHost {
    fn drop(&mut self) {
        self.dispose();
    }
}
