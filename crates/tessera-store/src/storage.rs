use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::data::Data;
use crate::error::StoreError;
use crate::model::Model;
use crate::params::Parameters;

/// Boxed, sendable future.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Storage adapter operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Set,
    List,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Get => f.write_str("get"),
            Operation::Set => f.write_str("set"),
            Operation::List => f.write_str("list"),
        }
    }
}

/// Result of an adapter call: available now, or later.
pub enum Fetch<T> {
    Ready(anyhow::Result<T>),
    Deferred(BoxFuture<anyhow::Result<T>>),
}

impl<T: Send + 'static> Fetch<T> {
    pub fn ready(value: T) -> Self {
        Fetch::Ready(Ok(value))
    }

    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        Fetch::Ready(Err(err.into()))
    }

    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Fetch::Deferred(Box::pin(future))
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Fetch::Deferred(_))
    }

    pub fn map<U, F>(self, f: F) -> Fetch<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        match self {
            Fetch::Ready(result) => Fetch::Ready(result.map(f)),
            Fetch::Deferred(future) => Fetch::Deferred(Box::pin(async move { future.await.map(f) })),
        }
    }

    /// Await the result regardless of how it was produced.
    pub async fn resolve(self) -> anyhow::Result<T> {
        match self {
            Fetch::Ready(result) => result,
            Fetch::Deferred(future) => future.await,
        }
    }
}

impl<T> From<anyhow::Result<T>> for Fetch<T> {
    fn from(result: anyhow::Result<T>) -> Self {
        Fetch::Ready(result)
    }
}

impl<T> fmt::Debug for Fetch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fetch::Ready(Ok(_)) => f.write_str("Fetch::Ready(Ok(..))"),
            Fetch::Ready(Err(err)) => write!(f, "Fetch::Ready(Err({err}))"),
            Fetch::Deferred(_) => f.write_str("Fetch::Deferred(..)"),
        }
    }
}

/// How long a loaded instance stays valid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CachePolicy {
    /// Valid until explicitly cleared or invalidated.
    #[default]
    Forever,
    /// Valid only within the frame it was loaded in.
    Frame,
    /// Valid while `loaded_at + millis > now`.
    Window(u64),
}

impl CachePolicy {
    /// `0` means a single frame.
    pub fn from_millis(millis: u64) -> Self {
        if millis == 0 {
            CachePolicy::Frame
        } else {
            CachePolicy::Window(millis)
        }
    }

    /// Whether an instance stamped at `stamp` is still valid at `now`.
    pub fn is_fresh(self, stamp: u64, now: u64) -> bool {
        match self {
            CachePolicy::Forever => true,
            CachePolicy::Frame => stamp == now,
            CachePolicy::Window(millis) => stamp.saturating_add(millis) > now,
        }
    }
}

/// Storage adapter backing a model definition.
///
/// Implementations must satisfy these invariants:
/// - `supports` reports exactly the operations that are implemented; the
///   store checks it before calling and fails with a contract error
///   otherwise.
/// - `get` returns `None` (or a non-object) when no record exists.
/// - `set` receives `None` as the model to delete, and `None` as the id when
///   creating. It may return the stored record, which then replaces the
///   local instance.
/// - `list` returns ids or raw objects, in display order.
pub trait Storage: Send + Sync {
    /// Whether `operation` is implemented.
    fn supports(&self, operation: Operation) -> bool;

    /// Load a single record.
    fn get(&self, parameters: &Parameters) -> Fetch<Option<Data>> {
        let _ = parameters;
        Fetch::failed(StoreError::Unsupported(Operation::Get))
    }

    /// Create, update or delete a record.
    fn set(&self, id: Option<&str>, model: Option<&Model>) -> Fetch<Option<Data>> {
        let _ = (id, model);
        Fetch::failed(StoreError::Unsupported(Operation::Set))
    }

    /// List records.
    fn list(&self, parameters: &Parameters) -> Fetch<Vec<Data>> {
        let _ = parameters;
        Fetch::failed(StoreError::Unsupported(Operation::List))
    }

    /// Validity policy for loaded instances.
    fn cache(&self) -> CachePolicy {
        CachePolicy::Forever
    }
}

type GetFn = Arc<dyn Fn(&Parameters) -> Fetch<Option<Data>> + Send + Sync>;
type SetFn = Arc<dyn Fn(Option<&str>, Option<&Model>) -> Fetch<Option<Data>> + Send + Sync>;
type ListFn = Arc<dyn Fn(&Parameters) -> Fetch<Vec<Data>> + Send + Sync>;

/// Adapter assembled from closures.
#[derive(Clone, Default)]
pub struct FnStorage {
    get: Option<GetFn>,
    set: Option<SetFn>,
    list: Option<ListFn>,
    cache: CachePolicy,
}

impl FnStorage {
    /// Adapter with only a `get` operation.
    pub fn new<F>(get: F) -> Self
    where
        F: Fn(&Parameters) -> Fetch<Option<Data>> + Send + Sync + 'static,
    {
        Self::default().with_get(get)
    }

    pub fn with_get<F>(mut self, get: F) -> Self
    where
        F: Fn(&Parameters) -> Fetch<Option<Data>> + Send + Sync + 'static,
    {
        self.get = Some(Arc::new(get));
        self
    }

    pub fn with_set<F>(mut self, set: F) -> Self
    where
        F: Fn(Option<&str>, Option<&Model>) -> Fetch<Option<Data>> + Send + Sync + 'static,
    {
        self.set = Some(Arc::new(set));
        self
    }

    pub fn with_list<F>(mut self, list: F) -> Self
    where
        F: Fn(&Parameters) -> Fetch<Vec<Data>> + Send + Sync + 'static,
    {
        self.list = Some(Arc::new(list));
        self
    }

    pub fn with_cache(mut self, cache: CachePolicy) -> Self {
        self.cache = cache;
        self
    }
}

impl Storage for FnStorage {
    fn supports(&self, operation: Operation) -> bool {
        match operation {
            Operation::Get => self.get.is_some(),
            Operation::Set => self.set.is_some(),
            Operation::List => self.list.is_some(),
        }
    }

    fn get(&self, parameters: &Parameters) -> Fetch<Option<Data>> {
        match &self.get {
            Some(get) => get(parameters),
            None => Fetch::failed(StoreError::Unsupported(Operation::Get)),
        }
    }

    fn set(&self, id: Option<&str>, model: Option<&Model>) -> Fetch<Option<Data>> {
        match &self.set {
            Some(set) => set(id, model),
            None => Fetch::failed(StoreError::Unsupported(Operation::Set)),
        }
    }

    fn list(&self, parameters: &Parameters) -> Fetch<Vec<Data>> {
        match &self.list {
            Some(list) => list(parameters),
            None => Fetch::failed(StoreError::Unsupported(Operation::List)),
        }
    }

    fn cache(&self) -> CachePolicy {
        self.cache
    }
}

impl fmt::Debug for FnStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStorage")
            .field("get", &self.get.is_some())
            .field("set", &self.set.is_some())
            .field("list", &self.list.is_some())
            .field("cache", &self.cache)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_policy_freshness() {
        assert!(CachePolicy::Forever.is_fresh(1, u64::MAX));
        assert!(CachePolicy::Frame.is_fresh(5, 5));
        assert!(!CachePolicy::Frame.is_fresh(5, 6));
        assert!(CachePolicy::Window(100).is_fresh(5, 104));
        assert!(!CachePolicy::Window(100).is_fresh(5, 105));
        assert_eq!(CachePolicy::from_millis(0), CachePolicy::Frame);
        assert_eq!(CachePolicy::from_millis(10), CachePolicy::Window(10));
    }

    #[test]
    fn fn_storage_reports_supported_operations() {
        let storage = FnStorage::new(|_| Fetch::ready(None));
        assert!(storage.supports(Operation::Get));
        assert!(!storage.supports(Operation::Set));
        assert!(!storage.supports(Operation::List));
        assert!(matches!(
            Storage::set(&storage, None, None),
            Fetch::Ready(Err(_))
        ));
    }

    #[tokio::test]
    async fn fetch_map_applies_to_deferred_results() {
        let fetch = Fetch::deferred(async { Ok(2) }).map(|n| n * 21);
        assert!(fetch.is_deferred());
        assert_eq!(fetch.resolve().await.unwrap(), 42);
    }
}
