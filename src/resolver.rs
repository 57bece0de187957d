//! Binding exported members to typed function pointers.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::abi::{AbiArg, AbiValue, Signature, SignatureShape};
use crate::context::{ExecutionContext, Liveness};
use crate::error::{HostError, Result};
use crate::module::{LoadedModule, ModuleReference};

/// Normalized identity of a bound symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolId {
    pub module: PathBuf,
    pub type_name: String,
    pub member: String,
}

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{} in {:?}", self.type_name, self.member, self.module)
    }
}

/// Resolves module references against one execution context.
pub struct SymbolResolver {
    context: Arc<ExecutionContext>,
}

impl SymbolResolver {
    pub fn new(context: Arc<ExecutionContext>) -> Self {
        Self { context }
    }

    /// Load the referenced module if needed and bind its member as `F`.
    pub fn resolve<F: Signature>(&self, module_ref: &ModuleReference) -> Result<BoundFunction<F>> {
        let module = self.context.load_module(&module_ref.path)?;
        let address = self.context.resolve_entry_point(
            &module,
            &module_ref.qualifier,
            &module_ref.member,
            &F::shape(),
        )?;

        // Shape equality was checked against the module's declaration above
        let function = unsafe { F::from_address(address.as_ptr()) };

        let symbol = SymbolId {
            module: module.path().to_path_buf(),
            type_name: module_ref.qualifier.type_name().to_string(),
            member: module_ref.member.clone(),
        };
        tracing::debug!("Bound {} as {}", symbol, F::shape());

        Ok(BoundFunction {
            function,
            symbol: Arc::new(symbol),
            liveness: self.context.liveness(),
            module,
        })
    }
}

/// A typed entry point bound under an execution context.
///
/// The binding keeps the module image mapped, but refuses to call once the
/// context has been disposed.
pub struct BoundFunction<F: Signature> {
    function: F,
    symbol: Arc<SymbolId>,
    liveness: Arc<Liveness>,
    module: Arc<LoadedModule>,
}

impl<F: Signature> BoundFunction<F> {
    fn checked(&self) -> Result<F> {
        if self.liveness.is_disposed() {
            return Err(HostError::InvalidOperation(format!(
                "{} was bound in an execution context that has been disposed",
                self.symbol
            )));
        }
        Ok(self.function)
    }

    /// The bare function pointer, if the owning context is still alive.
    ///
    /// Prefer `invoke`, which repeats the liveness check on every call and
    /// keeps the module mapped while the call runs.
    ///
    /// # Safety
    /// The pointer is not tied to the module image. The caller must not call
    /// it once this binding (and every clone of it) has been dropped, or once
    /// the owning context has been disposed.
    ///
    /// ```compile_fail
    /// # use native_plugin_host::BoundFunction;
    /// fn detach(bound: &BoundFunction<extern "C" fn(i32) -> i32>) -> extern "C" fn(i32) -> i32 {
    ///     bound.get().unwrap()
    /// }
    /// ```
    pub unsafe fn get(&self) -> Result<F> {
        self.checked()
    }

    pub fn is_valid(&self) -> bool {
        !self.liveness.is_disposed()
    }

    pub fn symbol(&self) -> &SymbolId {
        &self.symbol
    }

    pub fn shape(&self) -> SignatureShape {
        F::shape()
    }

    pub fn module_path(&self) -> &Path {
        self.module.path()
    }
}

impl<F: Signature> Clone for BoundFunction<F> {
    fn clone(&self) -> Self {
        Self {
            function: self.function,
            symbol: self.symbol.clone(),
            liveness: self.liveness.clone(),
            module: self.module.clone(),
        }
    }
}

impl<F: Signature> fmt::Debug for BoundFunction<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundFunction")
            .field("symbol", &self.symbol)
            .field("shape", &F::shape())
            .field("valid", &self.is_valid())
            .finish()
    }
}

macro_rules! impl_invoke {
    ($($arg:ident: $ty:ident),*) => {
        impl<R: AbiValue, $($ty: AbiArg),*> BoundFunction<extern "C" fn($($ty),*) -> R> {
            /// Call the entry point. Fails if the context has been disposed.
            pub fn invoke(&self, $($arg: $ty),*) -> Result<R> {
                let function = self.checked()?;
                Ok(function($($arg),*))
            }
        }
    };
}

impl_invoke!();
impl_invoke!(a: A);
impl_invoke!(a: A, b: B);
impl_invoke!(a: A, b: B, c: C);
impl_invoke!(a: A, b: B, c: C, d: D);
impl_invoke!(a: A, b: B, c: C, d: D, e: E);
impl_invoke!(a: A, b: B, c: C, d: D, e: E, g: G);
