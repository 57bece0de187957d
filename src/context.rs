//! Execution context: one runtime instance hosting a loaded module.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use crate::abi::{SignatureShape, PLUGIN_ABI_VERSION};
use crate::callbacks::CallbackBridge;
use crate::config::{HostConfig, RuntimeConfig};
use crate::error::{HostError, Result};
use crate::handles::{HandleTable, HandleToken};
use crate::module::{LoadedModule, RawAddress, TypeQualifier};
use crate::runtime::{Isolation, Runtime};

/// Lifecycle of an [`ExecutionContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Uninitialized,
    Initializing,
    Ready,
    /// Terminal.
    Disposed,
}

/// Disposed flag shared with every binding made under a context.
#[derive(Debug, Default)]
pub(crate) struct Liveness {
    disposed: AtomicBool,
}

impl Liveness {
    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn mark_disposed(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}

static EXCLUSIVE_RUNTIMES: LazyLock<Mutex<HashSet<String>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// Claim on a process-exclusive runtime, released on drop.
struct ExclusiveGuard {
    runtime: String,
}

impl ExclusiveGuard {
    fn acquire(runtime: &str) -> Result<Self> {
        let mut active = EXCLUSIVE_RUNTIMES
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !active.insert(runtime.to_string()) {
            return Err(HostError::ContextConflict(runtime.to_string()));
        }
        Ok(Self {
            runtime: runtime.to_string(),
        })
    }
}

impl Drop for ExclusiveGuard {
    fn drop(&mut self) {
        EXCLUSIVE_RUNTIMES
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.runtime);
    }
}

struct ContextInner {
    state: ContextState,
    runtime_config: Option<Arc<RuntimeConfig>>,
    guard: Option<ExclusiveGuard>,
}

/// One runtime instance and the module loaded into it.
///
/// All methods take `&self`; the context is meant to be shared behind an
/// `Arc`. Module loads are serialized by the module cache lock, so concurrent
/// first use of a path maps the image exactly once.
pub struct ExecutionContext {
    runtime: Arc<dyn Runtime>,
    config: HostConfig,
    inner: Mutex<ContextInner>,
    modules: Mutex<HashMap<PathBuf, Arc<LoadedModule>>>,
    handles: HandleTable,
    liveness: Arc<Liveness>,
    load_count: AtomicUsize,
}

impl ExecutionContext {
    pub fn new(runtime: Arc<dyn Runtime>, config: HostConfig) -> Self {
        Self {
            runtime,
            config,
            inner: Mutex::new(ContextInner {
                state: ContextState::Uninitialized,
                runtime_config: None,
                guard: None,
            }),
            modules: Mutex::new(HashMap::new()),
            handles: HandleTable::new(),
            liveness: Arc::new(Liveness::default()),
            load_count: AtomicUsize::new(0),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, ContextInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_modules(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<LoadedModule>>> {
        self.modules
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ContextState {
        self.lock_inner().state
    }

    fn ensure_ready(&self, action: &str) -> Result<()> {
        match self.state() {
            ContextState::Ready => Ok(()),
            ContextState::Disposed => Err(HostError::InvalidOperation(format!(
                "cannot {}: execution context has been disposed",
                action
            ))),
            state => Err(HostError::InvalidOperation(format!(
                "cannot {}: execution context is {:?}",
                action, state
            ))),
        }
    }

    /// Read the runtime config descriptor and bring the context to `Ready`.
    ///
    /// On failure the context stays `Uninitialized` and may be initialized again.
    pub fn initialize(&self, config_path: &Path) -> Result<()> {
        {
            let mut inner = self.lock_inner();
            if inner.state != ContextState::Uninitialized {
                return Err(HostError::InvalidOperation(format!(
                    "cannot initialize: execution context is {:?}",
                    inner.state
                )));
            }
            inner.state = ContextState::Initializing;
        }

        let result = self.load_runtime_config(config_path);

        let mut inner = self.lock_inner();
        match result {
            Ok((runtime_config, guard)) => {
                if inner.state == ContextState::Disposed {
                    return Err(HostError::InvalidOperation(
                        "execution context was disposed during initialization".into(),
                    ));
                }
                inner.state = ContextState::Ready;
                inner.runtime_config = Some(Arc::new(runtime_config));
                inner.guard = guard;
                tracing::info!("Execution context ready on runtime '{}'", self.runtime.name());
                Ok(())
            }
            Err(e) => {
                if inner.state == ContextState::Initializing {
                    inner.state = ContextState::Uninitialized;
                }
                Err(e)
            }
        }
    }

    fn load_runtime_config(
        &self,
        config_path: &Path,
    ) -> Result<(RuntimeConfig, Option<ExclusiveGuard>)> {
        let path = self.config.resolve_path(config_path);
        tracing::debug!("Reading runtime config from {:?}", path);
        let runtime_config = RuntimeConfig::from_file(&path)?;

        if runtime_config.runtime.name != self.runtime.name() {
            return Err(HostError::IncompatibleRuntime {
                expected: self.runtime.name().to_string(),
                actual: runtime_config.runtime.name.clone(),
            });
        }
        if runtime_config.runtime.abi_version != PLUGIN_ABI_VERSION {
            return Err(HostError::IncompatibleRuntime {
                expected: format!("ABI v{}", PLUGIN_ABI_VERSION),
                actual: format!("ABI v{}", runtime_config.runtime.abi_version),
            });
        }

        let guard = match self.runtime.isolation() {
            Isolation::ProcessExclusive => Some(ExclusiveGuard::acquire(self.runtime.name())?),
            Isolation::Shared => None,
        };
        Ok((runtime_config, guard))
    }

    /// Load the module at `path`, or return the cached instance.
    pub fn load_module(&self, path: &Path) -> Result<Arc<LoadedModule>> {
        let normalized = self.config.resolve_path(path);

        let mut modules = self.lock_modules();
        self.ensure_ready("load a module")?;

        if let Some(module) = modules.get(&normalized) {
            return Ok(module.clone());
        }

        if !self.config.allow_multiple_modules {
            if let Some(existing) = modules.keys().next() {
                return Err(HostError::module_load(
                    &normalized,
                    format!("execution context already hosts {:?}", existing),
                ));
            }
        }

        tracing::info!("Loading module from {:?}", normalized);
        let image = self.runtime.load(&normalized)?;
        let module = unsafe { LoadedModule::from_image(normalized.clone(), image)? };
        module.attach(CallbackBridge::table_ptr())?;

        self.load_count.fetch_add(1, Ordering::SeqCst);
        let module = Arc::new(module);
        modules.insert(normalized, module.clone());

        tracing::debug!(
            "Loaded module '{}' with {} exports",
            module.name(),
            module.export_count()
        );
        Ok(module)
    }

    /// Address of `qualifier::member` if it is declared with exactly `shape`.
    pub fn resolve_entry_point(
        &self,
        module: &LoadedModule,
        qualifier: &TypeQualifier,
        member: &str,
        shape: &SignatureShape,
    ) -> Result<RawAddress> {
        self.ensure_ready("resolve an entry point")?;

        let (declared, address) = module.lookup(qualifier, member)?;
        if declared != shape {
            return Err(HostError::SignatureMismatch {
                symbol: format!("{}::{}", qualifier.type_name(), member),
                requested: shape.clone(),
                declared: declared.clone(),
            });
        }
        Ok(address)
    }

    /// Pin `object` under `slot` in this context's handle table.
    pub fn publish<T: Any + Send + Sync>(&self, slot: &str, object: Arc<T>) -> Result<HandleToken> {
        // Held across publish so dispose cannot interleave and miss the token.
        let inner = self.lock_inner();
        if inner.state != ContextState::Ready {
            return Err(HostError::InvalidOperation(format!(
                "cannot publish '{}': execution context is {:?}",
                slot, inner.state
            )));
        }
        Ok(self.handles.publish_slot(slot, object))
    }

    /// Tear down the context. Idempotent.
    pub fn dispose(&self) {
        let guard = {
            let mut inner = self.lock_inner();
            if inner.state == ContextState::Disposed {
                return;
            }
            inner.state = ContextState::Disposed;
            self.liveness.mark_disposed();
            inner.guard.take()
        };

        let modules: Vec<Arc<LoadedModule>> = self.lock_modules().drain().map(|(_, m)| m).collect();
        for module in &modules {
            module.detach();
        }
        let released = self.handles.release_all();
        drop(guard);

        tracing::info!(
            "Disposed execution context ({} modules unloaded, {} handles released)",
            modules.len(),
            released
        );
    }

    /// Parsed runtime config descriptor, once initialized.
    pub fn runtime_config(&self) -> Option<Arc<RuntimeConfig>> {
        self.lock_inner().runtime_config.clone()
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Number of physical module loads performed.
    pub fn load_count(&self) -> usize {
        self.load_count.load(Ordering::SeqCst)
    }

    /// Normalized paths of the modules currently loaded.
    pub fn loaded_modules(&self) -> Vec<PathBuf> {
        self.lock_modules().keys().cloned().collect()
    }

    pub(crate) fn liveness(&self) -> Arc<Liveness> {
        self.liveness.clone()
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.dispose();
    }
}
