use enclave_storage::{KeyValueStore, MemoryStore, SqliteStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Record {
    id: String,
    count: u32,
}

fn exercise(store: Arc<dyn KeyValueStore>) {
    let rec = Record { id: "acme.x".into(), count: 3 };
    store.set_json("enclave_plugin_acme.x", &rec).unwrap();
    store.set_json("enclave_plugin_acme.y", &rec).unwrap();
    store.set("enclave_logs", "[]").unwrap();

    let back: Record = store.get_json("enclave_plugin_acme.x").unwrap().unwrap();
    assert_eq!(back, rec);
    assert!(store.get_json::<Record>("missing").unwrap().is_none());

    assert_eq!(
        store.keys_with_prefix("enclave_plugin_").unwrap(),
        vec!["enclave_plugin_acme.x", "enclave_plugin_acme.y"]
    );

    store.remove("enclave_plugin_acme.x").unwrap();
    assert_eq!(store.keys_with_prefix("enclave_plugin_").unwrap().len(), 1);
}

#[test]
fn memory_store_contract() {
    exercise(Arc::new(MemoryStore::new()));
}

#[test]
fn sqlite_store_contract() {
    exercise(Arc::new(SqliteStore::open_in_memory().unwrap()));
}

#[test]
fn sqlite_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("enclave.db");
    {
        let store = SqliteStore::open(&path).unwrap();
        store.set("plugin_acme.x_state", r#"{"theme":"dark"}"#).unwrap();
    }
    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(
        store.get("plugin_acme.x_state").unwrap().as_deref(),
        Some(r#"{"theme":"dark"}"#)
    );
}

#[test]
fn json_decode_failure_is_an_error() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    store.set("k", "not json").unwrap();
    assert!(store.get_json::<Record>("k").is_err());
}
