use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::ThreadId;

use tracing::{debug, trace};

use crate::entry::{Entry, Observer};
use crate::error::{CacheError, CacheResult};
use crate::observe::Observation;

type EntryRef<N, K, V> = Arc<Entry<N, K, V>>;

/// Validity predicate consulted before a cached value is returned.
pub type Validate<'a, V> = &'a dyn Fn(Option<&V>) -> bool;

/// Keyed memoization with dependency tracking.
///
/// Entries are grouped by namespace. Reading an entry while another entry's
/// resolver is running on the same thread records a dependency edge; changing
/// or invalidating the read entry later marks the reader stale.
pub struct Cache<N, K, V> {
    namespaces: RwLock<HashMap<N, HashMap<K, EntryRef<N, K, V>>>>,
    stacks: Mutex<HashMap<ThreadId, Vec<EntryRef<N, K, V>>>>,
    queue: Mutex<Vec<EntryRef<N, K, V>>>,
    seq: AtomicU64,
}

/// Pops the resolving entry off the thread's stack, even on unwind.
struct StackGuard<'a, N, K, V> {
    stacks: &'a Mutex<HashMap<ThreadId, Vec<EntryRef<N, K, V>>>>,
    thread: ThreadId,
}

impl<N, K, V> Drop for StackGuard<'_, N, K, V> {
    fn drop(&mut self) {
        let popped = {
            let mut stacks = match self.stacks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let popped = stacks.get_mut(&self.thread).and_then(Vec::pop);
            if stacks.get(&self.thread).is_some_and(Vec::is_empty) {
                stacks.remove(&self.thread);
            }
            popped
        };
        drop(popped);
    }
}

impl<N, K, V> Cache<N, K, V>
where
    N: Clone + Eq + Hash,
    K: Clone + Eq + Hash,
    V: Clone + PartialEq,
{
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            namespaces: RwLock::new(HashMap::new()),
            stacks: Mutex::new(HashMap::new()),
            queue: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
        }
    }

    fn lookup(&self, namespace: &N, key: &K) -> Option<EntryRef<N, K, V>> {
        self.namespaces
            .read()
            .expect("lock poisoned")
            .get(namespace)
            .and_then(|entries| entries.get(key))
            .cloned()
    }

    fn entry(&self, namespace: &N, key: &K) -> EntryRef<N, K, V> {
        if let Some(entry) = self.lookup(namespace, key) {
            return entry;
        }
        let mut map = self.namespaces.write().expect("lock poisoned");
        let entries = map.entry(namespace.clone()).or_default();
        Arc::clone(entries.entry(key.clone()).or_insert_with(|| {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            Arc::new(Entry::new(namespace.clone(), key.clone(), seq))
        }))
    }

    fn current(&self) -> Option<EntryRef<N, K, V>> {
        let stacks = self.stacks.lock().expect("lock poisoned");
        stacks
            .get(&std::thread::current().id())
            .and_then(|stack| stack.last())
            .cloned()
    }

    fn is_resolving(&self, entry: &EntryRef<N, K, V>) -> bool {
        let stacks = self.stacks.lock().expect("lock poisoned");
        stacks
            .get(&std::thread::current().id())
            .is_some_and(|stack| stack.iter().any(|e| Arc::ptr_eq(e, entry)))
    }

    fn push(&self, entry: &EntryRef<N, K, V>) -> StackGuard<'_, N, K, V> {
        let thread = std::thread::current().id();
        self.stacks
            .lock()
            .expect("lock poisoned")
            .entry(thread)
            .or_default()
            .push(Arc::clone(entry));
        StackGuard {
            stacks: &self.stacks,
            thread,
        }
    }

    /// Read `(namespace, key)`, running `resolver` when no valid value is
    /// cached or `validate` rejects the cached one.
    ///
    /// The resolver receives the last value of the entry (if any). Any entry
    /// read from inside the resolver becomes a dependency of this one. A value
    /// written to the entry while the resolver runs is kept over the
    /// resolver's result.
    pub fn get<F>(
        &self,
        namespace: &N,
        key: &K,
        resolver: F,
        validate: Option<Validate<'_, V>>,
    ) -> CacheResult<V>
    where
        F: FnOnce(Option<V>) -> V,
    {
        let entry = self.entry(namespace, key);

        if self.is_resolving(&entry) {
            return Err(CacheError::Circular);
        }

        if let Some(context) = self.current() {
            context.add_dep(&entry);
            entry.add_dependent(&context);
        }

        let cached = {
            let state = entry.lock();
            if state.valid {
                state.value.clone()
            } else {
                None
            }
        };
        if let Some(value) = cached {
            if validate.map_or(true, |check| check(Some(&value))) {
                return Ok(value);
            }
        }

        let (previous, stale_deps, version) = {
            let mut state = entry.lock();
            (
                state.value.clone(),
                std::mem::take(&mut state.deps),
                state.version,
            )
        };
        for dep in &stale_deps {
            dep.remove_dependent(Arc::as_ptr(&entry));
        }
        drop(stale_deps);

        let next = {
            let _guard = self.push(&entry);
            resolver(previous)
        };

        let replaced = {
            let mut state = entry.lock();
            if state.version != version {
                // Written from another thread while the resolver ran; the
                // write wins and the entry stays stale.
                trace!("resolver result superseded by a concurrent write");
                return Ok(state.value.clone().unwrap_or(next));
            }
            let replaced = if state.value.as_ref() != Some(&next) {
                state.version += 1;
                Some(state.value.replace(next.clone()))
            } else {
                None
            };
            state.valid = true;
            replaced
        };

        if replaced.is_some() {
            self.dispatch(&entry, false);
        }
        drop(replaced);

        Ok(next)
    }

    /// Publish `value` under `(namespace, key)` and return the value it
    /// replaced.
    ///
    /// When the value differs from the stored one, dependents are marked
    /// stale and the entry is resolved again on its next read.
    pub fn set(&self, namespace: &N, key: &K, value: V) -> Option<V> {
        let entry = self.entry(namespace, key);
        let (previous, changed) = {
            let mut state = entry.lock();
            if state.value.as_ref() == Some(&value) {
                (state.value.clone(), false)
            } else {
                state.version += 1;
                state.valid = false;
                (state.value.replace(value), true)
            }
        };
        if changed {
            self.dispatch(&entry, true);
        }
        previous
    }

    /// Mark one entry stale. With `clear_value` the last value is discarded,
    /// otherwise resolvers still see it as their previous value.
    pub fn invalidate(&self, namespace: &N, key: &K, clear_value: bool) {
        if let Some(entry) = self.lookup(namespace, key) {
            self.invalidate_entry(&entry, clear_value);
        }
    }

    /// Mark every entry of a namespace stale.
    pub fn invalidate_all(&self, namespace: &N, clear_value: bool) {
        let entries: Vec<_> = self
            .namespaces
            .read()
            .expect("lock poisoned")
            .get(namespace)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default();
        for entry in &entries {
            self.invalidate_entry(entry, clear_value);
        }
    }

    fn invalidate_entry(&self, entry: &EntryRef<N, K, V>, clear_value: bool) {
        let discarded = {
            let mut state = entry.lock();
            state.valid = false;
            if clear_value {
                state.version += 1;
                state.value.take()
            } else {
                None
            }
        };
        self.dispatch(entry, true);
        drop(discarded);
    }

    /// Current value of an entry without resolving or tracking it.
    pub fn value(&self, namespace: &N, key: &K) -> Option<V> {
        self.lookup(namespace, key)
            .and_then(|entry| entry.lock().value.clone())
    }

    /// Version counter of an entry; bumped on every change of its value.
    pub fn version(&self, namespace: &N, key: &K) -> u64 {
        self.lookup(namespace, key)
            .map_or(0, |entry| entry.lock().version)
    }

    /// All entries of a namespace in creation order.
    pub fn entries(&self, namespace: &N) -> Vec<(K, Option<V>)> {
        let mut entries: Vec<_> = self
            .namespaces
            .read()
            .expect("lock poisoned")
            .get(namespace)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default();
        entries.sort_by_key(|entry| entry.seq);
        entries
            .iter()
            .map(|entry| (entry.key.clone(), entry.lock().value.clone()))
            .collect()
    }

    /// Remove a namespace with all its entries.
    ///
    /// Entries still referenced as dependencies stay alive until their
    /// dependents resolve again.
    pub fn drop_namespace(&self, namespace: &N) {
        let removed = self
            .namespaces
            .write()
            .expect("lock poisoned")
            .remove(namespace);
        if let Some(entries) = removed {
            trace!(entries = entries.len(), "dropping cache namespace");
            let values: Vec<_> = entries
                .into_values()
                .map(|entry| {
                    let mut state = entry.lock();
                    state.observer = None;
                    (state.value.take(), std::mem::take(&mut state.deps))
                })
                .collect();
            drop(values);
        }
    }

    /// Number of live namespaces.
    pub fn namespace_count(&self) -> usize {
        self.namespaces.read().expect("lock poisoned").len()
    }

    /// Mark every transitive dependent of `origin` stale and queue the
    /// observed ones.
    fn dispatch(&self, origin: &EntryRef<N, K, V>, include_origin: bool) {
        let mut visited: HashSet<*const Entry<N, K, V>> = HashSet::new();
        visited.insert(Arc::as_ptr(origin));
        let mut pending: Vec<EntryRef<N, K, V>> = origin
            .lock()
            .dependents
            .iter()
            .filter_map(|weak| weak.upgrade())
            .collect();

        if include_origin {
            self.enqueue(origin);
        }

        while let Some(entry) = pending.pop() {
            if !visited.insert(Arc::as_ptr(&entry)) {
                continue;
            }
            let next: Vec<_> = {
                let mut state = entry.lock();
                state.valid = false;
                state
                    .dependents
                    .iter()
                    .filter_map(|weak| weak.upgrade())
                    .collect()
            };
            self.enqueue(&entry);
            pending.extend(next);
        }
    }

    fn enqueue(&self, entry: &EntryRef<N, K, V>) {
        let queue = {
            let mut state = entry.lock();
            if state.observer.is_some() && !state.queued {
                state.queued = true;
                true
            } else {
                false
            }
        };
        if queue {
            self.queue
                .lock()
                .expect("lock poisoned")
                .push(Arc::clone(entry));
        }
    }

    /// Observe `(namespace, key)`.
    ///
    /// On the next [`Cache::flush`], and on every flush after the entry or one
    /// of its dependencies changed, `getter` is resolved through the cache and
    /// `on_change(new, old)` runs if the result differs from the last one
    /// reported.
    pub fn observe<G, C>(&self, namespace: &N, key: &K, getter: G, on_change: C) -> Observation
    where
        G: Fn() -> V + Send + Sync + 'static,
        C: Fn(&V, Option<&V>) + Send + Sync + 'static,
        N: Send + Sync + 'static,
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let entry = self.entry(namespace, key);
        let observer = Arc::new(Observer {
            getter: Box::new(getter),
            on_change: Box::new(on_change),
            last: Mutex::new(None),
        });
        let id = Arc::as_ptr(&observer) as usize;
        {
            let mut state = entry.lock();
            state.observer = Some(observer);
            state.valid = false;
        }
        self.enqueue(&entry);
        debug!(observer = id, "cache entry observed");
        Observation::new(id, move || {
            let detached = {
                let mut state = entry.lock();
                match &state.observer {
                    Some(current) if Arc::as_ptr(current) as usize == id => state.observer.take(),
                    _ => None,
                }
            };
            drop(detached);
        })
    }

    /// Stop an observation. Dropping the [`Observation`] has the same effect.
    pub fn unobserve(&self, observation: Observation) {
        drop(observation);
    }

    /// Deliver change notifications for every queued observed entry.
    ///
    /// Returns the number of `on_change` calls made.
    pub fn flush(&self) -> usize {
        let queued = std::mem::take(&mut *self.queue.lock().expect("lock poisoned"));
        let mut delivered = 0;
        for entry in queued {
            let observer = {
                let mut state = entry.lock();
                state.queued = false;
                state.observer.clone()
            };
            let Some(observer) = observer else { continue };

            let value = match self.get(
                &entry.namespace,
                &entry.key,
                |_| (observer.getter)(),
                None,
            ) {
                Ok(value) => value,
                Err(err) => {
                    debug!(error = %err, "observer resolution failed");
                    continue;
                }
            };

            let last = observer.last.lock().expect("lock poisoned").clone();
            if last.as_ref() != Some(&value) {
                (observer.on_change)(&value, last.as_ref());
                let replaced = observer
                    .last
                    .lock()
                    .expect("lock poisoned")
                    .replace(value);
                drop(replaced);
                delivered += 1;
            }
        }
        delivered
    }
}

impl<N, K, V> Default for Cache<N, K, V>
where
    N: Clone + Eq + Hash,
    K: Clone + Eq + Hash,
    V: Clone + PartialEq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<N, K, V> std::fmt::Debug for Cache<N, K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let namespaces = self.namespaces.read().map(|m| m.len()).unwrap_or(0);
        f.debug_struct("Cache")
            .field("namespaces", &namespaces)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    type TestCache = Cache<&'static str, &'static str, i64>;

    fn counting(counter: &AtomicUsize, value: i64) -> impl FnOnce(Option<i64>) -> i64 + '_ {
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            value
        }
    }

    // -----------------------------------------------------------------------
    // Memoization
    // -----------------------------------------------------------------------

    #[test]
    fn get_memoizes_resolver_result() {
        let cache = TestCache::new();
        let calls = AtomicUsize::new(0);

        assert_eq!(cache.get(&"ns", &"a", counting(&calls, 1), None).unwrap(), 1);
        assert_eq!(cache.get(&"ns", &"a", counting(&calls, 2), None).unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn validate_rejection_reruns_resolver_with_previous_value() {
        let cache = TestCache::new();
        cache.get(&"ns", &"a", |_| 1, None).unwrap();

        let reject: Validate<'_, i64> = &|_| false;
        let value = cache
            .get(&"ns", &"a", |prev| prev.unwrap_or(0) + 10, Some(reject))
            .unwrap();
        assert_eq!(value, 11);
    }

    #[test]
    fn resolver_sees_none_on_first_read() {
        let cache = TestCache::new();
        let value = cache
            .get(&"ns", &"a", |prev| if prev.is_none() { 7 } else { 0 }, None)
            .unwrap();
        assert_eq!(value, 7);
    }

    // -----------------------------------------------------------------------
    // Invalidation
    // -----------------------------------------------------------------------

    #[test]
    fn invalidate_with_clear_discards_value() {
        let cache = TestCache::new();
        cache.get(&"ns", &"a", |_| 1, None).unwrap();
        cache.invalidate(&"ns", &"a", true);

        assert_eq!(cache.value(&"ns", &"a"), None);
        let seen = cache.get(&"ns", &"a", |prev| prev.unwrap_or(-1), None).unwrap();
        assert_eq!(seen, -1);
    }

    #[test]
    fn invalidate_without_clear_keeps_previous_value() {
        let cache = TestCache::new();
        cache.get(&"ns", &"a", |_| 1, None).unwrap();
        cache.invalidate(&"ns", &"a", false);

        assert_eq!(cache.value(&"ns", &"a"), Some(1));
        let seen = cache.get(&"ns", &"a", |prev| prev.unwrap_or(-1) + 1, None).unwrap();
        assert_eq!(seen, 2);
    }

    #[test]
    fn invalidate_all_touches_only_one_namespace() {
        let cache = TestCache::new();
        let calls = AtomicUsize::new(0);
        cache.get(&"one", &"a", counting(&calls, 1), None).unwrap();
        cache.get(&"one", &"b", counting(&calls, 1), None).unwrap();
        cache.get(&"two", &"a", counting(&calls, 1), None).unwrap();

        cache.invalidate_all(&"one", true);

        cache.get(&"one", &"a", counting(&calls, 1), None).unwrap();
        cache.get(&"one", &"b", counting(&calls, 1), None).unwrap();
        cache.get(&"two", &"a", counting(&calls, 1), None).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    // -----------------------------------------------------------------------
    // Dependencies
    // -----------------------------------------------------------------------

    #[test]
    fn changing_a_dependency_invalidates_dependents_transitively() {
        let cache = TestCache::new();
        cache.set(&"ns", &"base", 1);

        let read_base = |cache: &TestCache| {
            cache
                .get(&"ns", &"base", |prev| prev.unwrap_or(0), None)
                .unwrap()
        };
        let middle = |cache: &TestCache| {
            cache
                .get(&"ns", &"middle", |_| read_base(cache) * 10, None)
                .unwrap()
        };
        let top = cache.get(&"ns", &"top", |_| middle(&cache) + 1, None).unwrap();
        assert_eq!(top, 11);

        cache.set(&"ns", &"base", 2);
        let top = cache.get(&"ns", &"top", |_| middle(&cache) + 1, None).unwrap();
        assert_eq!(top, 21);
    }

    #[test]
    fn setting_an_equal_value_keeps_dependents_valid() {
        let cache = TestCache::new();
        let calls = AtomicUsize::new(0);
        cache.set(&"ns", &"base", 1);

        let resolve = |cache: &TestCache| {
            cache
                .get(
                    &"ns",
                    &"top",
                    |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        cache.get(&"ns", &"base", |p| p.unwrap_or(0), None).unwrap()
                    },
                    None,
                )
                .unwrap()
        };
        resolve(&cache);
        cache.set(&"ns", &"base", 1);
        resolve(&cache);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn set_returns_replaced_value() {
        let cache = TestCache::new();
        assert_eq!(cache.set(&"ns", &"a", 1), None);
        assert_eq!(cache.set(&"ns", &"a", 2), Some(1));
        assert_eq!(cache.version(&"ns", &"a"), 2);
    }

    #[test]
    fn concurrent_write_during_resolution_wins() {
        let cache = TestCache::new();
        let value = cache
            .get(
                &"ns",
                &"a",
                |_| {
                    std::thread::scope(|scope| {
                        scope.spawn(|| cache.set(&"ns", &"a", 2));
                    });
                    1
                },
                None,
            )
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(cache.value(&"ns", &"a"), Some(2));
        assert_eq!(cache.version(&"ns", &"a"), 1);
        let calls = AtomicUsize::new(0);
        assert_eq!(cache.get(&"ns", &"a", |prev| prev.unwrap_or(0), None).unwrap(), 2);
        assert_eq!(cache.get(&"ns", &"a", counting(&calls, 9), None).unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn circular_resolution_is_rejected() {
        let cache = TestCache::new();
        let result = cache.get(
            &"ns",
            &"a",
            |_| match cache.get(&"ns", &"a", |_| 1, None) {
                Ok(_) => 0,
                Err(CacheError::Circular) => -1,
            },
            None,
        );
        assert_eq!(result.unwrap(), -1);
    }

    // -----------------------------------------------------------------------
    // Enumeration
    // -----------------------------------------------------------------------

    #[test]
    fn entries_follow_creation_order() {
        let cache = TestCache::new();
        cache.set(&"ns", &"c", 3);
        cache.set(&"ns", &"a", 1);
        cache.set(&"ns", &"b", 2);
        cache.invalidate(&"ns", &"a", true);

        let entries = cache.entries(&"ns");
        assert_eq!(entries, vec![("c", Some(3)), ("a", None), ("b", Some(2))]);
    }

    #[test]
    fn drop_namespace_removes_entries() {
        let cache = TestCache::new();
        cache.set(&"ns", &"a", 1);
        cache.set(&"other", &"a", 1);
        cache.drop_namespace(&"ns");

        assert!(cache.entries(&"ns").is_empty());
        assert_eq!(cache.namespace_count(), 1);
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    #[test]
    fn observer_fires_on_first_flush_and_after_change() {
        let cache = Arc::new(TestCache::new());
        cache.set(&"ns", &"base", 1);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let getter_cache = Arc::clone(&cache);
        let sink = Arc::clone(&seen);
        let observation = cache.observe(
            &"ns",
            &"view",
            move || {
                getter_cache
                    .get(&"ns", &"base", |p| p.unwrap_or(0), None)
                    .unwrap()
                    * 2
            },
            move |new, old| sink.lock().unwrap().push((*new, old.copied())),
        );

        assert_eq!(cache.flush(), 1);
        assert_eq!(cache.flush(), 0);

        cache.set(&"ns", &"base", 5);
        assert_eq!(cache.flush(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![(2, None), (10, Some(2))]);

        cache.unobserve(observation);
        cache.set(&"ns", &"base", 6);
        assert_eq!(cache.flush(), 0);
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    proptest! {
        #[test]
        fn reads_after_writes_see_the_last_value(
            values in proptest::collection::vec(any::<i64>(), 1..20)
        ) {
            let cache = TestCache::new();
            for value in &values {
                cache.set(&"ns", &"k", *value);
            }
            let seen = cache
                .get(&"ns", &"k", |previous| previous.unwrap_or(i64::MIN), None)
                .unwrap();
            prop_assert_eq!(Some(&seen), values.last());
        }

        #[test]
        fn version_counts_changes_only(
            values in proptest::collection::vec(0i64..4, 0..30)
        ) {
            let cache = TestCache::new();
            let mut current = None;
            let mut expected = 0;
            for value in values {
                cache.set(&"ns", &"k", value);
                if current != Some(value) {
                    current = Some(value);
                    expected += 1;
                }
            }
            prop_assert_eq!(cache.version(&"ns", &"k"), expected);
        }
    }
}
