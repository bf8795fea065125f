use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Callback pair attached to an observed entry.
pub(crate) struct Observer<V> {
    pub(crate) getter: Box<dyn Fn() -> V + Send + Sync>,
    pub(crate) on_change: Box<dyn Fn(&V, Option<&V>) + Send + Sync>,
    pub(crate) last: Mutex<Option<V>>,
}

/// A single `(namespace, key)` slot.
pub(crate) struct Entry<N, K, V> {
    pub(crate) namespace: N,
    pub(crate) key: K,
    /// Creation order, used to list a namespace in insertion order.
    pub(crate) seq: u64,
    state: Mutex<EntryState<N, K, V>>,
}

pub(crate) struct EntryState<N, K, V> {
    pub(crate) value: Option<V>,
    pub(crate) version: u64,
    pub(crate) valid: bool,
    pub(crate) deps: Vec<Arc<Entry<N, K, V>>>,
    pub(crate) dependents: Vec<Weak<Entry<N, K, V>>>,
    pub(crate) observer: Option<Arc<Observer<V>>>,
    pub(crate) queued: bool,
}

impl<N, K, V> Entry<N, K, V> {
    pub(crate) fn new(namespace: N, key: K, seq: u64) -> Self {
        Self {
            namespace,
            key,
            seq,
            state: Mutex::new(EntryState {
                value: None,
                version: 0,
                valid: false,
                deps: Vec::new(),
                dependents: Vec::new(),
                observer: None,
                queued: false,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EntryState<N, K, V>> {
        self.state.lock().expect("cache entry lock poisoned")
    }

    /// Record that `dependent` read this entry while resolving.
    pub(crate) fn add_dependent(&self, dependent: &Arc<Self>) {
        let mut state = self.lock();
        let known = state
            .dependents
            .iter()
            .any(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(dependent)));
        if !known {
            state.dependents.push(Arc::downgrade(dependent));
        }
    }

    /// Record that this entry read `dep` while resolving.
    pub(crate) fn add_dep(&self, dep: &Arc<Self>) {
        let mut state = self.lock();
        if !state.deps.iter().any(|d| Arc::ptr_eq(d, dep)) {
            state.deps.push(Arc::clone(dep));
        }
    }

    pub(crate) fn remove_dependent(&self, dependent: *const Self) {
        self.lock()
            .dependents
            .retain(|weak| !std::ptr::eq(weak.as_ptr(), dependent) && weak.strong_count() > 0);
    }
}
