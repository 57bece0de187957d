//! Opaque tokens for host objects handed to a loaded module.
//!
//! The module never sees an address. It receives a [`HandleToken`], a
//! process-unique integer, and passes it back to host callbacks, which look
//! the pinned object up in a process-wide directory. Each [`HandleTable`]
//! owns the tokens it published and releases them on `release_all` or drop.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{
    Arc, LazyLock, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};

use crate::abi::{AbiArg, AbiType, AbiValue};

/// Opaque reference to a host-owned object.
///
/// Never zero. Pass it to a module as a [`RawHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleToken(NonZeroU64);

impl HandleToken {
    /// Rebuild a token from the raw value a module passed back.
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn as_raw(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for HandleToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A token as it crosses the module boundary (ABI type `handle`).
///
/// Unlike [`HandleToken`] any bit pattern is valid, so a module may pass or
/// return [`RawHandle::NULL`] to mean "no token".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RawHandle(pub u64);

impl RawHandle {
    pub const NULL: RawHandle = RawHandle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The token this value names, or `None` for null.
    pub fn token(self) -> Option<HandleToken> {
        HandleToken::from_raw(self.0)
    }
}

impl From<HandleToken> for RawHandle {
    fn from(token: HandleToken) -> Self {
        RawHandle(token.as_raw())
    }
}

impl From<Option<HandleToken>> for RawHandle {
    fn from(token: Option<HandleToken>) -> Self {
        token.map_or(RawHandle::NULL, RawHandle::from)
    }
}

unsafe impl AbiValue for RawHandle {
    const ABI_TYPE: AbiType = AbiType::Handle;
}

impl AbiArg for RawHandle {}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

static DIRECTORY: LazyLock<RwLock<HashMap<HandleToken, Pinned>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

fn read_directory() -> RwLockReadGuard<'static, HashMap<HandleToken, Pinned>> {
    DIRECTORY
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_directory() -> RwLockWriteGuard<'static, HashMap<HandleToken, Pinned>> {
    DIRECTORY
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Pinned {
    object: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
    owner: Weak<TableInner>,
}

#[derive(Default)]
struct TableState {
    live: HashSet<HandleToken>,
    slots: HashMap<String, HandleToken>,
}

struct TableInner {
    state: Mutex<TableState>,
}

impl TableInner {
    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release_all(&self) -> usize {
        let mut state = self.lock();
        state.slots.clear();
        let tokens: Vec<HandleToken> = state.live.drain().collect();
        let mut directory = write_directory();
        for token in &tokens {
            directory.remove(token);
        }
        tokens.len()
    }
}

impl Drop for TableInner {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Thread-safe table of host objects pinned for a loaded module.
///
/// Clones share the same table.
#[derive(Clone)]
pub struct HandleTable {
    inner: Arc<TableInner>,
}

impl HandleTable {
    /// Create a new empty table.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TableInner {
                state: Mutex::new(TableState::default()),
            }),
        }
    }

    /// Pin `object` and return a fresh token for it.
    pub fn publish<T: Any + Send + Sync>(&self, object: Arc<T>) -> HandleToken {
        let mut state = self.inner.lock();
        self.publish_locked(&mut state, object)
    }

    /// Pin `object` under `slot`, releasing the token previously published there.
    pub fn publish_slot<T: Any + Send + Sync>(&self, slot: &str, object: Arc<T>) -> HandleToken {
        let mut state = self.inner.lock();

        if let Some(previous) = state.slots.remove(slot) {
            if state.live.remove(&previous) {
                unpin(previous);
                tracing::debug!("Released handle {} previously published as '{}'", previous, slot);
            }
        }

        let token = self.publish_locked(&mut state, object);
        state.slots.insert(slot.to_string(), token);
        token
    }

    fn publish_locked<T: Any + Send + Sync>(
        &self,
        state: &mut TableState,
        object: Arc<T>,
    ) -> HandleToken {
        let raw = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        let token = HandleToken(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN));

        let pinned = Pinned {
            object,
            type_name: std::any::type_name::<T>(),
            owner: Arc::downgrade(&self.inner),
        };
        write_directory().insert(token, pinned);
        state.live.insert(token);

        tracing::debug!("Published handle {} for {}", token, std::any::type_name::<T>());
        token
    }

    /// Unpin a token. Unknown or already released tokens are tolerated.
    pub fn release(&self, token: HandleToken) -> bool {
        let mut state = self.inner.lock();

        if !state.live.remove(&token) {
            tracing::warn!("Ignoring release of unknown handle {}", token);
            return false;
        }
        state.slots.retain(|_, t| *t != token);
        unpin(token);
        tracing::debug!("Released handle {}", token);
        true
    }

    /// Release every outstanding token. Returns how many were released.
    pub fn release_all(&self) -> usize {
        let released = self.inner.release_all();
        if released > 0 {
            tracing::debug!("Released {} outstanding handles", released);
        }
        released
    }

    /// Number of objects currently pinned by this table.
    pub fn pinned_count(&self) -> usize {
        self.inner.lock().live.len()
    }

    /// Token currently published under `slot`.
    pub fn slot(&self, slot: &str) -> Option<HandleToken> {
        self.inner.lock().slots.get(slot).copied()
    }

    /// Check whether `token` is live in this table.
    pub fn contains(&self, token: HandleToken) -> bool {
        self.inner.lock().live.contains(&token)
    }

    /// Get the object behind a token owned by this table.
    pub fn get<T: Any + Send + Sync>(&self, token: HandleToken) -> Option<Arc<T>> {
        if !self.contains(token) {
            return None;
        }
        Self::resolve(token.as_raw())
    }

    /// Look up a raw token coming back from a module, regardless of owner.
    pub fn resolve<T: Any + Send + Sync>(raw: u64) -> Option<Arc<T>> {
        let token = HandleToken::from_raw(raw)?;
        let directory = read_directory();
        let pinned = directory.get(&token)?;
        match pinned.object.clone().downcast::<T>() {
            Ok(object) => Some(object),
            Err(_) => {
                tracing::warn!(
                    "Handle {} refers to {}, not {}",
                    token,
                    pinned.type_name,
                    std::any::type_name::<T>()
                );
                None
            }
        }
    }

    /// Table that owns a raw token, if it is live.
    pub(crate) fn owner_of(raw: u64) -> Option<HandleTable> {
        let token = HandleToken::from_raw(raw)?;
        let directory = read_directory();
        let inner = directory.get(&token)?.owner.upgrade()?;
        Some(HandleTable { inner })
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("pinned", &self.pinned_count())
            .finish()
    }
}

fn unpin(token: HandleToken) {
    write_directory().remove(&token);
}
