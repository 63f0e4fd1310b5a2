//! Correlation context shared by dispatched work.
//!
//! Every dispatched operation runs inside an [`ExecutionContext`] identified by a
//! unique [`ExecutionId`]. Overrides are stored per execution id rather than per OS
//! thread, so a worker thread that hosts many operations over its lifetime never
//! carries one message's correlation id into the next.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// Key under which the per-message correlation id is stored.
pub const CONTEXT_ID: &str = "ContextId";

/// Process-wide default for [`CONTEXT_ID`] outside any dispatched operation.
pub const GLOBAL_CONTEXT_ID: &str = "global";

/// Identifies one logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionId(u64);

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exec-{}", self.0)
    }
}

/// The value that was active before [`ExecutionContext::enter`].
///
/// Opaque; hand it back to [`ExecutionContext::restore`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "the previous value must be restored when the operation ends"]
pub struct PreviousValue(Option<String>);

/// Holds process-wide defaults and the per-operation overrides.
#[derive(Debug)]
pub struct CorrelationStore {
    defaults: RwLock<HashMap<String, String>>,
    fallback: String,
    overrides: Mutex<HashMap<ExecutionId, HashMap<String, String>>>,
    next_id: AtomicU64,
}

impl CorrelationStore {
    /// Creates a store whose `ContextId` resolves to `global_context_id` when no
    /// operation has overridden it.
    pub fn new(global_context_id: impl Into<String>) -> Arc<Self> {
        let global_context_id = global_context_id.into();
        let mut defaults = HashMap::new();
        defaults.insert(CONTEXT_ID.to_string(), global_context_id.clone());
        Arc::new(Self {
            defaults: RwLock::new(defaults),
            fallback: global_context_id,
            overrides: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Sets the process-wide default for `key`.
    pub fn set_default(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut defaults = self.defaults.write().unwrap_or_else(PoisonError::into_inner);
        defaults.insert(key.into(), value.into());
    }

    /// Starts a new logical operation with no overrides.
    pub fn execution(self: &Arc<Self>) -> ExecutionContext {
        let id = ExecutionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        ExecutionContext {
            id,
            store: Arc::clone(self),
        }
    }

    /// Number of operations currently holding at least one override.
    pub fn active_overrides(&self) -> usize {
        self.lock_overrides().len()
    }

    fn lock_overrides(&self) -> MutexGuard<'_, HashMap<ExecutionId, HashMap<String, String>>> {
        self.overrides.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, id: ExecutionId, key: &str, value: Option<String>) -> Option<String> {
        let mut overrides = self.lock_overrides();
        match value {
            Some(value) => overrides.entry(id).or_default().insert(key.to_string(), value),
            None => {
                let slot = overrides.get_mut(&id)?;
                let previous = slot.remove(key);
                if slot.is_empty() {
                    overrides.remove(&id);
                }
                previous
            }
        }
    }

    fn resolve(&self, id: ExecutionId, key: &str) -> String {
        if let Some(value) = self.lock_overrides().get(&id).and_then(|slot| slot.get(key)) {
            return value.clone();
        }
        let defaults = self.defaults.read().unwrap_or_else(PoisonError::into_inner);
        defaults.get(key).cloned().unwrap_or_else(|| self.fallback.clone())
    }
}

/// Handle to one logical operation's view of the [`CorrelationStore`].
///
/// Clones share the same execution id.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    id: ExecutionId,
    store: Arc<CorrelationStore>,
}

impl ExecutionContext {
    pub fn id(&self) -> ExecutionId {
        self.id
    }

    /// Makes `value` the active value for `key` in this operation.
    pub fn enter(&self, key: &str, value: impl Into<String>) -> PreviousValue {
        PreviousValue(self.store.set(self.id, key, Some(value.into())))
    }

    /// Reinstates the value returned by [`enter`](Self::enter).
    pub fn restore(&self, key: &str, previous: PreviousValue) {
        let _ = self.store.set(self.id, key, previous.0);
    }

    /// Override for this operation, else the process-wide default.
    pub fn resolve(&self, key: &str) -> String {
        self.store.resolve(self.id, key)
    }

    /// Shorthand for resolving [`CONTEXT_ID`].
    pub fn correlation_id(&self) -> String {
        self.resolve(CONTEXT_ID)
    }

    /// Enters `value` and restores the previous value when the guard drops,
    /// including during unwinding.
    pub fn scope(&self, key: &str, value: impl Into<String>) -> ContextGuard {
        let previous = self.enter(key, value);
        ContextGuard {
            context: self.clone(),
            key: key.to_string(),
            previous: Some(previous),
        }
    }
}

/// Restores a key on drop. Created by [`ExecutionContext::scope`].
#[derive(Debug)]
pub struct ContextGuard {
    context: ExecutionContext,
    key: String,
    previous: Option<PreviousValue>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.context.restore(&self.key, previous);
        }
    }
}
