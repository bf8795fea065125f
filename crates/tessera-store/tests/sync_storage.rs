//! Definitions connected to an adapter that answers synchronously.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tessera_store::{
    CachePolicy, Data, ErrorCause, Fetch, FnStorage, ListOptions, Schema, Store, StoreConfig,
    StoreError, Value,
};

fn store() -> Store {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Store::builder().config(StoreConfig::quiet()).build()
}

/// In-memory records in insertion order, with call counters.
#[derive(Clone, Default)]
struct Backend {
    records: Arc<Mutex<Vec<(String, Data)>>>,
    gets: Arc<AtomicUsize>,
    lists: Arc<AtomicUsize>,
}

impl Backend {
    fn seeded<'a>(records: impl IntoIterator<Item = (&'a str, Data)>) -> Self {
        let backend = Backend::default();
        backend.records.lock().unwrap().extend(
            records
                .into_iter()
                .map(|(id, data)| (id.to_string(), data.with_id(id))),
        );
        backend
    }

    fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    fn lists(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    /// Adapter over the records. Writes store the written instance itself
    /// and confirm it without a replacement record.
    fn storage(&self) -> FnStorage {
        let (records, gets) = (Arc::clone(&self.records), Arc::clone(&self.gets));
        let get = move |params: &tessera_store::Parameters| {
            gets.fetch_add(1, Ordering::SeqCst);
            let id = params.id().unwrap_or_default();
            let records = records.lock().unwrap();
            Fetch::ready(records.iter().find(|(k, _)| *k == id).map(|(_, d)| d.clone()))
        };

        let records = Arc::clone(&self.records);
        let set = move |id: Option<&str>, model: Option<&tessera_store::Model>| {
            let mut records = records.lock().unwrap();
            match model {
                Some(model) => {
                    let key = model.id().unwrap_or_default().to_string();
                    match records.iter_mut().find(|(k, _)| *k == key) {
                        Some((_, data)) => *data = Data::from(model),
                        None => records.push((key, Data::from(model))),
                    }
                }
                None => records.retain(|(k, _)| Some(k.as_str()) != id),
            }
            Fetch::ready(None)
        };

        let (records, lists) = (Arc::clone(&self.records), Arc::clone(&self.lists));
        let list = move |_: &tessera_store::Parameters| {
            lists.fetch_add(1, Ordering::SeqCst);
            let records = records.lock().unwrap();
            Fetch::ready(records.iter().map(|(_, d)| d.clone()).collect())
        };

        FnStorage::new(get).with_set(set).with_list(list)
    }
}

fn record(value: &str) -> Data {
    Data::from_pairs([("value", value)])
}

fn schema_over(backend: &Backend) -> Schema {
    Schema::builder()
        .id()
        .field("value", "")
        .connect(backend.storage())
        .build()
}

fn value_of(value: &Value) -> String {
    let model = value.as_model().expect("expected a model");
    model.get("value").unwrap().as_str().unwrap_or_default().to_string()
}

// ---------------------------------------------------------------------------
// get()
// ---------------------------------------------------------------------------

#[test]
fn loads_instances_from_storage() {
    let backend = Backend::seeded([("1", record("one")), ("2", record("two"))]);
    let schema = schema_over(&backend);
    let store = store();

    let one = store.get(&schema, "1").unwrap();
    assert!(store.ready(&one));
    assert_eq!(value_of(&one), "one");
    assert_eq!(one.as_model().unwrap().id(), Some("1"));

    assert_eq!(store.get(&schema, 1).unwrap(), one);
    assert_eq!(backend.gets(), 1);

    assert_eq!(value_of(&store.get(&schema, "2").unwrap()), "two");
    assert_eq!(backend.gets(), 2);
}

#[test]
fn get_errors_are_cached_until_cleared() {
    let failing = Arc::new(AtomicBool::new(true));
    let calls = Arc::new(AtomicUsize::new(0));
    let (flag, counter) = (Arc::clone(&failing), Arc::clone(&calls));
    let schema = Schema::builder()
        .id()
        .field("value", "")
        .connect(FnStorage::new(move |params| {
            counter.fetch_add(1, Ordering::SeqCst);
            if flag.load(Ordering::SeqCst) {
                Fetch::failed(anyhow::anyhow!("unreachable backend"))
            } else {
                Fetch::ready(Some(record("ok").with_id(&params.id().unwrap_or_default())))
            }
        }))
        .build();
    let store = store();

    let failed = store.get(&schema, "1").unwrap();
    let err = store.error(&failed).unwrap();
    assert_eq!(err.message(), "unreachable backend");
    assert!(!store.ready(&failed));
    assert!(!store.pending(&failed));
    assert_eq!(store.get(&schema, "1").unwrap(), failed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    failing.store(false, Ordering::SeqCst);
    store.clear(&failed, true).unwrap();
    let loaded = store.get(&schema, "1").unwrap();
    assert_eq!(value_of(&loaded), "ok");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn clear_forces_a_reload() {
    let backend = Backend::seeded([("1", record("one"))]);
    let schema = schema_over(&backend);
    let store = store();

    let first = store.get(&schema, "1").unwrap();
    backend.records.lock().unwrap()[0].1 = record("changed").with_id("1");
    assert_eq!(store.get(&schema, "1").unwrap(), first);

    store.clear(first.as_model().unwrap(), true).unwrap();
    let second = store.get(&schema, "1").unwrap();
    assert_eq!(value_of(&second), "changed");
    assert_eq!(backend.gets(), 2);

    backend.records.lock().unwrap()[0].1 = record("again").with_id("1");
    store.clear(&schema, true).unwrap();
    assert_eq!(value_of(&store.get(&schema, "1").unwrap()), "again");
}

// ---------------------------------------------------------------------------
// Cache policies
// ---------------------------------------------------------------------------

#[test]
fn frame_lists_reload_per_frame_without_item_gets() {
    let backend = Backend::seeded([("1", record("one")), ("2", record("two"))]);
    let schema = Schema::builder()
        .id()
        .field("value", "")
        .connect(backend.storage().with_cache(CachePolicy::Frame))
        .build();
    let store = store();

    let list = store.get(schema.list(), ()).unwrap();
    assert_eq!(store.get(schema.list(), ()).unwrap(), list);
    assert_eq!(list.to_json(), json!([{ "value": "one" }, { "value": "two" }]));
    assert_eq!(backend.lists(), 1);
    assert_eq!(backend.gets(), 0);

    store.next_frame();
    let next = store.get(schema.list(), ()).unwrap();
    assert_ne!(next, list);
    assert_eq!(backend.lists(), 2);
}

// ---------------------------------------------------------------------------
// Lists and writes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lists_follow_creation_and_deletion() {
    let backend = Backend::seeded([("1", record("one")), ("2", record("two"))]);
    let schema = schema_over(&backend);
    let store = store();

    let list = store.get(schema.list(), ()).unwrap();
    assert_eq!(list.as_list().unwrap().len(), 2);

    let created = store.set(&schema, record("three")).unwrap().await.unwrap();
    let list = store.get(schema.list(), ()).unwrap();
    let items = list.as_list().unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(items.get(2).unwrap(), created);
    assert_eq!(backend.lists(), 2);

    let first = items.get(0).unwrap();
    store
        .set(first.as_model().unwrap(), Data::Null)
        .unwrap()
        .await
        .unwrap();
    let list = store.get(schema.list(), ()).unwrap();
    assert_eq!(
        list.to_json(),
        json!([{ "value": "two" }, { "value": "three" }])
    );
}

#[tokio::test]
async fn updating_an_item_keeps_the_list() {
    let backend = Backend::seeded([("1", record("one")), ("2", record("two"))]);
    let schema = schema_over(&backend);
    let store = store();

    let list = store.get(schema.list(), ()).unwrap();
    let first = list.as_list().unwrap().get(0).unwrap();
    let updated = store
        .set(first.as_model().unwrap(), record("new"))
        .unwrap()
        .await
        .unwrap();

    let again = store.get(schema.list(), ()).unwrap();
    assert_eq!(again, list);
    assert_eq!(again.as_list().unwrap().get(0).unwrap(), updated);
    assert_eq!(value_of(&updated), "new");
    assert_eq!(backend.lists(), 1);
}

#[tokio::test]
async fn returned_record_replaces_the_local_instance() {
    let schema = Schema::builder()
        .id()
        .field("value", "")
        .field("stamp", 0)
        .connect(
            FnStorage::new(|_| Fetch::ready(None)).with_set(|_, model| {
                let data = model.map(|m| m.to_data()).unwrap_or(Data::Null);
                let mut stored = match data {
                    Data::Object(map) => map,
                    _ => return Fetch::ready(None),
                };
                stored.insert("stamp".into(), Data::from(7));
                Fetch::ready(Some(Data::Object(stored)))
            }),
        )
        .build();
    let store = store();

    let created = store.set(&schema, record("x")).unwrap().await.unwrap();
    let model = created.as_model().unwrap();
    assert_eq!(model.get("stamp").unwrap(), Value::from(7));
    assert_eq!(model.get("value").unwrap(), Value::from("x"));
    assert_eq!(store.get(&schema, model.id().unwrap()).unwrap(), created);
}

#[tokio::test]
async fn rejects_a_record_with_another_id() {
    let schema = Schema::builder()
        .id()
        .field("value", "")
        .connect(
            FnStorage::new(|params| Fetch::ready(Some(record("one").with_id(&params.id().unwrap_or_default()))))
                .with_set(|_, _| Fetch::ready(Some(record("one").with_id("other")))),
        )
        .build();
    let store = store();

    let model = store.get(&schema, "1").unwrap();
    let err = store
        .set(model.as_model().unwrap(), record("two"))
        .unwrap()
        .await
        .unwrap_err();
    assert!(matches!(
        err.cause(),
        ErrorCause::Contract(StoreError::IdMismatch { .. })
    ));
    assert_eq!(store.get(&schema, "1").unwrap(), model);
    assert!(!store.pending(&model));
}

#[tokio::test]
async fn failed_writes_are_not_cached() {
    let schema = Schema::builder()
        .id()
        .field("value", "")
        .connect(
            FnStorage::new(|params| Fetch::ready(Some(record("one").with_id(&params.id().unwrap_or_default()))))
                .with_set(|_, _| Fetch::failed(anyhow::anyhow!("read only"))),
        )
        .build();
    let store = store();

    let model = store.get(&schema, "1").unwrap();
    let err = store
        .set(model.as_model().unwrap(), record("two"))
        .unwrap()
        .await
        .unwrap_err();
    assert_eq!(err.message(), "read only");
    assert!(matches!(err.cause(), ErrorCause::Storage(_)));

    let current = store.get(&schema, "1").unwrap();
    assert_eq!(current, model);
    assert!(store.ready(&current));
    assert!(!store.pending(&current));
}

#[test]
fn writes_need_a_set_operation() {
    let schema = Schema::builder()
        .id()
        .connect(FnStorage::new(|_| Fetch::ready(None)))
        .build();
    assert!(matches!(
        store().set(&schema, Data::object()),
        Err(StoreError::Unsupported(tessera_store::Operation::Set))
    ));
}

// ---------------------------------------------------------------------------
// Loose arrays
// ---------------------------------------------------------------------------

fn host_over(backend: &Backend, item: &Schema, loose: bool) -> Schema {
    let builder = Schema::builder().id();
    let builder = if loose {
        builder.list_with("items", item, ListOptions::loose())
    } else {
        builder.list("items", item)
    };
    builder.connect(backend.storage()).build()
}

fn host_record() -> Data {
    Data::from_pairs([("items", Data::Array(vec![Data::from("a")]))])
}

#[tokio::test]
async fn loose_arrays_reload_the_host_when_items_change() {
    let items = Backend::seeded([("a", record("a"))]);
    let item = schema_over(&items);
    let hosts = Backend::seeded([("1", host_record())]);
    let host = host_over(&hosts, &item, true);
    let store = store();

    let first = store.get(&host, "1").unwrap();
    assert_eq!(first.to_json(), json!({ "items": [{ "value": "a" }] }));

    store.set(&item, record("b")).unwrap().await.unwrap();
    let second = store.get(&host, "1").unwrap();
    assert_ne!(second, first);
    assert_eq!(hosts.gets(), 2);
    assert_eq!(store.get(&host, "1").unwrap(), second);
}

#[tokio::test]
async fn strict_arrays_keep_the_host_when_items_change() {
    let items = Backend::seeded([("a", record("a"))]);
    let item = schema_over(&items);
    let hosts = Backend::seeded([("1", host_record())]);
    let host = host_over(&hosts, &item, false);
    let store = store();

    let first = store.get(&host, "1").unwrap();
    store.set(&item, record("b")).unwrap().await.unwrap();
    assert_eq!(store.get(&host, "1").unwrap(), first);
    assert_eq!(hosts.gets(), 1);
}

fn items_of(host: &Value) -> tessera_store::ModelList {
    let items = host.as_model().expect("expected a model").get("items").unwrap();
    items.as_list().expect("expected a list").clone()
}

/// Host whose stored `items` always name the item records that exist.
fn host_listing(items: &Backend, item: &Schema, loose: bool) -> (Schema, Arc<AtomicUsize>) {
    let (records, gets) = (Arc::clone(&items.records), Arc::new(AtomicUsize::new(0)));
    let count = Arc::clone(&gets);
    let storage = FnStorage::new(move |_| {
        count.fetch_add(1, Ordering::SeqCst);
        let ids = records.lock().unwrap().iter().map(|(id, _)| Data::from(id.as_str())).collect();
        Fetch::ready(Some(Data::from_pairs([("items", Data::Array(ids))])))
    });
    let builder = Schema::builder().id();
    let builder = if loose {
        builder.list_with("items", item, ListOptions::loose())
    } else {
        builder.list("items", item)
    };
    (builder.connect(storage).build(), gets)
}

#[tokio::test]
async fn loose_arrays_drop_deleted_items() {
    let items = Backend::seeded([("a", record("a")), ("b", record("b"))]);
    let item = schema_over(&items);
    let (host, gets) = host_listing(&items, &item, true);
    let store = store();

    assert_eq!(items_of(&store.get(&host, "1").unwrap()).len(), 2);

    let a = store.get(&item, "a").unwrap();
    store.set(a.as_model().unwrap(), Data::Null).unwrap().await.unwrap();

    let list = items_of(&store.get(&host, "1").unwrap());
    assert_eq!(list.len(), 1);
    let first = list.get(0).unwrap();
    assert!(!first.is_error());
    assert_eq!(value_of(&first), "b");
    assert_eq!(gets.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn strict_arrays_keep_deleted_items_as_errors() {
    let items = Backend::seeded([("a", record("a")), ("b", record("b"))]);
    let item = schema_over(&items);
    let (host, gets) = host_listing(&items, &item, false);
    let store = store();

    let first = store.get(&host, "1").unwrap();
    assert_eq!(items_of(&first).len(), 2);

    let a = store.get(&item, "a").unwrap();
    store.set(a.as_model().unwrap(), Data::Null).unwrap().await.unwrap();

    let again = store.get(&host, "1").unwrap();
    assert_eq!(again, first);
    let list = items_of(&again);
    assert_eq!(list.len(), 2);
    assert!(list.get(0).unwrap().is_error());
    assert_eq!(value_of(&list.get(1).unwrap()), "b");
    assert_eq!(gets.load(Ordering::SeqCst), 1);
}
