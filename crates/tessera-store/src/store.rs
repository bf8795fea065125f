//! The store: shared state and the public operations.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tessera_cache::{Cache, Observation};
use tokio::sync::watch;
use tracing::debug;

use crate::clock::{Clock, FrameEpoch, SystemClock};
use crate::compiler::Config;
use crate::config::StoreConfig;
use crate::data::Data;
use crate::error::{StoreError, StoreResult};
use crate::list::ListConfig;
use crate::model::{Model, ModelError};
use crate::mutate::{self, SetFuture};
use crate::params::Parameters;
use crate::resolve;
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::schema::Schema;
use crate::storage::Operation;
use crate::value::Value;

/// Cache namespace. Every compiled definition and every live instance owns
/// one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct Namespace(u64);

impl Namespace {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Namespace(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ns{}", self.0)
    }
}

/// Key of a cache entry within a namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum CacheKey {
    /// Instance of a definition; `None` for singletons.
    Id(Option<String>),
    /// Frame in which a definition last invalidated.
    Marker,
    /// Memoized computed or foreign field of an instance.
    Field(Arc<str>),
    /// Memoized item of a list.
    Index(usize),
    /// Pending flag of an instance.
    Pending,
    /// Root of an observation.
    Observed,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Slot {
    Value(Value),
    Flag(bool),
    Stamp(u64),
}

impl Slot {
    pub(crate) fn into_value(self) -> Option<Value> {
        match self {
            Slot::Value(value) => Some(value),
            _ => None,
        }
    }

    pub(crate) fn as_value(&self) -> Option<&Value> {
        match self {
            Slot::Value(value) => Some(value),
            _ => None,
        }
    }
}

/// Decrements the in-flight task count when the task finishes or is dropped.
struct InflightGuard(Arc<watch::Sender<usize>>);

impl InflightGuard {
    fn new(counter: Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(counter)
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// State shared by a store, its compiled definitions and its instances.
pub(crate) struct Shared {
    pub(crate) cache: Cache<Namespace, CacheKey, Slot>,
    pub(crate) epoch: FrameEpoch,
    pub(crate) settings: StoreConfig,
    scheduler: Arc<dyn Scheduler>,
    models: RwLock<HashMap<usize, Arc<Config>>>,
    lists: RwLock<HashMap<(usize, bool), Arc<ListConfig>>>,
    inflight: Arc<watch::Sender<usize>>,
}

impl Shared {
    /// Compiled definition of `schema`, compiling on first use.
    pub(crate) fn compile(self: &Arc<Self>, schema: &Schema) -> StoreResult<Arc<Config>> {
        let key = schema.key();
        if let Some(config) = self.models.read().expect("lock poisoned").get(&key) {
            return Ok(Arc::clone(config));
        }
        let compiled = Arc::new(Config::compile(self, schema)?);
        let mut models = self.models.write().expect("lock poisoned");
        Ok(Arc::clone(models.entry(key).or_insert(compiled)))
    }

    /// Compiled list definition over `schema`. Lists nested in a model field
    /// and top-level lists are compiled separately: only the latter need a
    /// listing adapter.
    pub(crate) fn compile_list(
        self: &Arc<Self>,
        schema: &Schema,
        nested: bool,
    ) -> StoreResult<Arc<ListConfig>> {
        let key = (schema.key(), nested);
        if let Some(list) = self.lists.read().expect("lock poisoned").get(&key) {
            return Ok(Arc::clone(list));
        }
        let item = self.compile(schema)?;
        let compiled = Arc::new(ListConfig::compile(self, item, nested)?);
        let mut lists = self.lists.write().expect("lock poisoned");
        Ok(Arc::clone(lists.entry(key).or_insert(compiled)))
    }

    /// Run `task` on the scheduler, counting it as in flight until it ends.
    pub(crate) fn spawn<F>(&self, task: F) -> StoreResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = InflightGuard::new(Arc::clone(&self.inflight));
        self.scheduler.spawn(Box::pin(async move {
            task.await;
            drop(guard);
        }))
    }

    pub(crate) fn resolve_model(
        self: &Arc<Self>,
        config: &Arc<Config>,
        id: Option<String>,
        parameters: Parameters,
    ) -> StoreResult<Value> {
        resolve::get(self, config, id, parameters)
    }

    /// Pending flag of the instance owning `namespace`. Reading it inside a
    /// resolver makes the resolver depend on it.
    pub(crate) fn is_pending(&self, namespace: Namespace) -> bool {
        matches!(
            self.cache.get(
                &namespace,
                &CacheKey::Pending,
                |last| last.unwrap_or(Slot::Flag(false)),
                None
            ),
            Ok(Slot::Flag(true))
        )
    }

    /// Placeholders are always pending.
    pub(crate) fn pending(&self, value: &Value) -> bool {
        if value.is_placeholder() {
            return true;
        }
        value.meta().is_some_and(|meta| self.is_pending(meta.namespace))
    }

    pub(crate) fn set_pending(&self, value: &Value, pending: bool) {
        let Some(meta) = value.meta() else { return };
        if !pending && self.cache.value(&meta.namespace, &CacheKey::Pending).is_none() {
            return;
        }
        self.cache
            .set(&meta.namespace, &CacheKey::Pending, Slot::Flag(pending));
    }

    /// Publish `value` as the current instance for `id` and clear its
    /// pending flag. Returns `true` if an instance was replaced.
    pub(crate) fn publish(&self, namespace: Namespace, id: Option<String>, value: Value) -> bool {
        let previous = self
            .cache
            .set(&namespace, &CacheKey::Id(id), Slot::Value(value.clone()));
        self.set_pending(&value, false);
        // Released here, after the cache has let go of its locks.
        previous.and_then(Slot::into_value).is_some()
    }

    /// Memoized computation under `(namespace, key)`. Failures are not
    /// cached.
    pub(crate) fn memo<F>(&self, namespace: Namespace, key: CacheKey, compute: F) -> StoreResult<Value>
    where
        F: FnOnce(Option<Value>) -> StoreResult<Value>,
    {
        let mut failure = None;
        let slot = self.cache.get(
            &namespace,
            &key,
            |last| {
                let last = last.and_then(Slot::into_value);
                match compute(last.clone()) {
                    Ok(value) => Slot::Value(value),
                    Err(err) => {
                        failure = Some(err);
                        Slot::Value(last.unwrap_or_default())
                    }
                }
            },
            None,
        )?;
        if let Some(err) = failure {
            self.cache.invalidate(&namespace, &key, false);
            return Err(err);
        }
        Ok(slot.into_value().unwrap_or_default())
    }

    /// Load timestamp of `value`, stamping it with the current frame if it
    /// has none yet.
    pub(crate) fn stamp(&self, value: &Value) -> u64 {
        match value.meta() {
            Some(meta) => match meta.stamp() {
                0 => meta.stamp_once(self.epoch.now()),
                stamp => stamp,
            },
            None => self.epoch.now(),
        }
    }

    /// Stamp `value` as loaded in the current frame.
    pub(crate) fn touch(&self, value: &Value) {
        if let Some(meta) = value.meta() {
            meta.set_stamp(self.epoch.now());
        }
    }

    /// Frame in which `config` last invalidated. A first read records the
    /// current frame.
    pub(crate) fn marker(&self, config: &Config) -> u64 {
        let slot = self.cache.get(
            &config.namespace,
            &CacheKey::Marker,
            |last| match last {
                Some(stamp @ Slot::Stamp(_)) => stamp,
                _ => Slot::Stamp(self.epoch.now()),
            },
            None,
        );
        match slot {
            Ok(Slot::Stamp(stamp)) => stamp,
            _ => self.epoch.now(),
        }
    }
}

/// What to read with [`Store::get`].
#[derive(Clone, Debug)]
pub enum Definition {
    Model(Schema),
    List(Schema),
}

impl From<Schema> for Definition {
    fn from(schema: Schema) -> Self {
        Definition::Model(schema)
    }
}

impl From<&Schema> for Definition {
    fn from(schema: &Schema) -> Self {
        Definition::Model(schema.clone())
    }
}

/// What to write with [`Store::set`]: a definition to create a new
/// instance, or an existing instance to update or delete.
#[derive(Clone, Debug)]
pub enum SetTarget {
    Schema(Schema),
    Model(Model),
}

impl From<Schema> for SetTarget {
    fn from(schema: Schema) -> Self {
        SetTarget::Schema(schema)
    }
}

impl From<&Schema> for SetTarget {
    fn from(schema: &Schema) -> Self {
        SetTarget::Schema(schema.clone())
    }
}

impl From<Model> for SetTarget {
    fn from(model: Model) -> Self {
        SetTarget::Model(model)
    }
}

impl From<&Model> for SetTarget {
    fn from(model: &Model) -> Self {
        SetTarget::Model(model.clone())
    }
}

/// What to invalidate with [`Store::clear`].
#[derive(Clone, Debug)]
pub enum ClearTarget {
    /// Every cached instance of a definition.
    Definition(Definition),
    /// A single instance or error, by reference.
    Value(Value),
}

impl From<&Schema> for ClearTarget {
    fn from(schema: &Schema) -> Self {
        ClearTarget::Definition(Definition::Model(schema.clone()))
    }
}

impl From<Definition> for ClearTarget {
    fn from(definition: Definition) -> Self {
        ClearTarget::Definition(definition)
    }
}

impl From<&Model> for ClearTarget {
    fn from(model: &Model) -> Self {
        ClearTarget::Value(Value::Model(model.clone()))
    }
}

impl From<&ModelError> for ClearTarget {
    fn from(err: &ModelError) -> Self {
        ClearTarget::Value(Value::Error(err.clone()))
    }
}

impl From<&Value> for ClearTarget {
    fn from(value: &Value) -> Self {
        ClearTarget::Value(value.clone())
    }
}

impl From<Value> for ClearTarget {
    fn from(value: Value) -> Self {
        ClearTarget::Value(value)
    }
}

/// Builder for [`Store`].
pub struct StoreBuilder {
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl StoreBuilder {
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Time source for cache validity.
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Executor for background work. Defaults to the ambient tokio runtime.
    pub fn scheduler(mut self, scheduler: impl Scheduler + 'static) -> Self {
        self.scheduler = Some(Arc::new(scheduler));
        self
    }

    pub fn build(self) -> Store {
        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Arc::new(TokioScheduler::default()));
        let (inflight, _) = watch::channel(0);
        debug!(
            log_errors = self.config.log_errors,
            memory_cache = ?self.config.memory_cache,
            "store created"
        );
        Store(Arc::new(Shared {
            cache: Cache::new(),
            epoch: FrameEpoch::new(self.clock),
            settings: self.config,
            scheduler,
            models: RwLock::new(HashMap::new()),
            lists: RwLock::new(HashMap::new()),
            inflight: Arc::new(inflight),
        }))
    }
}

/// A declarative model store.
///
/// Reads are synchronous: [`Store::get`] returns the cached instance, a
/// placeholder while a deferred load is in flight, or an error instance.
/// Writes return a future resolving once the adapter has confirmed them.
/// Clones share the same cache.
#[derive(Clone)]
pub struct Store(pub(crate) Arc<Shared>);

impl Store {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> StoreBuilder {
        StoreBuilder {
            config: StoreConfig::default(),
            clock: Arc::new(SystemClock),
            scheduler: None,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.0.settings
    }

    /// Read a model instance or a list.
    ///
    /// Returns contract errors (unsupported operation, parameters on a
    /// singleton, malformed schema) synchronously. Data failures come back
    /// as [`Value::Error`].
    pub fn get(
        &self,
        definition: impl Into<Definition>,
        parameters: impl Into<Parameters>,
    ) -> StoreResult<Value> {
        let parameters = parameters.into();
        match definition.into() {
            Definition::Model(schema) => {
                let config = self.0.compile(&schema)?;
                if !config.storage.supports(Operation::Get) {
                    return Err(StoreError::Unsupported(Operation::Get));
                }
                if !config.enumerable && !parameters.is_none() {
                    return Err(StoreError::ParametersNotSupported);
                }
                let id = parameters.canonical()?;
                self.0.resolve_model(&config, id, parameters)
            }
            Definition::List(schema) => {
                let list = self.0.compile_list(&schema, false)?;
                let id = parameters.canonical()?;
                resolve::get(&self.0, &list, id, parameters)
            }
        }
    }

    /// Create, update or delete.
    ///
    /// With a schema target, creates an instance from `values`. With a model
    /// target, merges `values` into a new instance replacing the model, or
    /// deletes it when `values` is [`Data::Null`]. The instance being written
    /// is pending until the returned future resolves.
    pub fn set(
        &self,
        target: impl Into<SetTarget>,
        values: impl Into<Data>,
    ) -> StoreResult<SetFuture> {
        mutate::set(&self.0, target.into(), values.into())
    }

    /// Invalidate cached instances so the next read loads them again.
    ///
    /// With `clear_value` the cached instance is dropped as well; without
    /// it, the instance is kept and returned again if it is still valid.
    pub fn clear(&self, target: impl Into<ClearTarget>, clear_value: bool) -> StoreResult<()> {
        match target.into() {
            ClearTarget::Definition(Definition::Model(schema)) => {
                let config = self.0.compile(&schema)?;
                debug!(namespace = %config.namespace, clear_value, "clearing definition");
                self.0.cache.invalidate_all(&config.namespace, clear_value);
            }
            ClearTarget::Definition(Definition::List(schema)) => {
                let list = self.0.compile_list(&schema, false)?;
                debug!(namespace = %list.namespace, clear_value, "clearing list definition");
                self.0.cache.invalidate_all(&list.namespace, clear_value);
            }
            ClearTarget::Value(Value::Model(model)) => {
                let schema = model.schema().ok_or(StoreError::Untracked)?;
                let config = self.0.compile(&schema)?;
                let key = CacheKey::Id(model.id().map(str::to_string));
                self.0.cache.invalidate(&config.namespace, &key, clear_value);
            }
            ClearTarget::Value(Value::Error(err)) => {
                let key = CacheKey::Id(err.id().map(str::to_string));
                self.0.cache.invalidate(&err.origin(), &key, clear_value);
            }
            ClearTarget::Value(other) => {
                return Err(StoreError::NotClearable {
                    found: other.kind_name(),
                });
            }
        }
        Ok(())
    }

    /// `true` while `value` is a placeholder or a write or reload of it is
    /// in flight.
    pub fn pending(&self, value: &Value) -> bool {
        self.0.pending(value)
    }

    /// `true` for a loaded model or list.
    pub fn ready(&self, value: &Value) -> bool {
        matches!(value, Value::Model(_) | Value::List(_)) && !value.is_placeholder()
    }

    /// The error instance, if `value` is one.
    pub fn error<'a>(&self, value: &'a Value) -> Option<&'a ModelError> {
        value.as_error()
    }

    /// Call `on_change(new, old)` whenever the result of `getter` changes.
    ///
    /// Notifications are delivered by [`Store::next_frame`]; the first one
    /// carries the initial result. Dropping the returned [`Subscription`]
    /// stops them.
    pub fn observe<G, C>(&self, getter: G, on_change: C) -> Subscription
    where
        G: Fn(&Store) -> Value + Send + Sync + 'static,
        C: Fn(&Value, Option<&Value>) + Send + Sync + 'static,
    {
        let namespace = Namespace::next();
        let store = Arc::downgrade(&self.0);
        let observation = self.0.cache.observe(
            &namespace,
            &CacheKey::Observed,
            move || match store.upgrade() {
                Some(shared) => Slot::Value(getter(&Store(shared))),
                None => Slot::Value(Value::Undefined),
            },
            move |next, last| {
                if let Slot::Value(next) = next {
                    on_change(next, last.and_then(Slot::as_value));
                }
            },
        );
        Subscription {
            observation: Some(observation),
            namespace,
            store: Arc::downgrade(&self.0),
        }
    }

    /// Mark a frame boundary and deliver pending change notifications.
    /// Returns the number of notifications delivered.
    pub fn next_frame(&self) -> usize {
        self.0.epoch.reset();
        self.0.cache.flush()
    }

    /// Wait until every deferred load, write continuation and invalidation
    /// flush started so far has finished.
    pub async fn settle(&self) {
        let mut inflight = self.0.inflight.subscribe();
        let _ = inflight.wait_for(|count| *count == 0).await;
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("config", &self.0.settings)
            .field("epoch", &self.0.epoch)
            .field("cache", &self.0.cache)
            .finish()
    }
}

/// Handle of an observation started with [`Store::observe`].
#[must_use = "dropping a subscription stops its notifications"]
pub struct Subscription {
    observation: Option<Observation>,
    namespace: Namespace,
    store: Weak<Shared>,
}

impl Subscription {
    pub fn id(&self) -> usize {
        self.observation.as_ref().map_or(0, Observation::id)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        drop(self.observation.take());
        if let Some(shared) = self.store.upgrade() {
            shared.cache.drop_namespace(&self.namespace);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id())
            .field("namespace", &self.namespace)
            .finish()
    }
}
