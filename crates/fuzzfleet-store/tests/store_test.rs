// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend conformance tests run against both the memory and SQLite stores.

use std::sync::Arc;

use fuzzfleet_store::{EntityStore, MemoryStore, QueryFilter, SqliteStore, StoredRecord};
use serde_json::json;

async fn backends() -> Vec<Arc<dyn EntityStore>> {
    let sqlite = SqliteStore::in_memory()
        .await
        .expect("Failed to create in-memory SQLite store");
    vec![Arc::new(MemoryStore::new()), Arc::new(sqlite)]
}

fn node(machine_id: &str, scaleset: &str, state: &str) -> StoredRecord {
    StoredRecord::new(
        "Node",
        "pool-a",
        machine_id,
        json!({ "machine_id": machine_id, "scaleset_id": scaleset, "state": state }),
    )
}

#[tokio::test]
async fn test_racing_writers_only_one_wins() {
    for backend in backends().await {
        let original = backend.insert(node("m1", "s1", "free")).await.unwrap();

        let mut a = original.clone();
        a.body["state"] = json!("busy");
        let mut b = original.clone();
        b.body["state"] = json!("done");

        let first = backend.replace(a).await;
        let second = backend.replace(b).await;

        assert!(first.is_ok(), "{}: first writer must win", backend.backend_name());
        assert!(
            second.unwrap_err().is_conflict(),
            "{}: second writer must conflict",
            backend.backend_name()
        );

        let current = backend.get("Node", "pool-a", "m1").await.unwrap().unwrap();
        assert_eq!(current.body["state"], "busy");
    }
}

#[tokio::test]
async fn test_query_by_scaleset_and_state() {
    for backend in backends().await {
        backend.insert(node("m1", "s1", "free")).await.unwrap();
        backend.insert(node("m2", "s1", "done")).await.unwrap();
        backend.insert(node("m3", "s2", "done")).await.unwrap();

        let filter = QueryFilter::new()
            .field_eq("scaleset_id", "s1")
            .field_in("state", ["done", "shutdown", "halt"]);
        let rows = backend.query("Node", &filter).await.unwrap();

        assert_eq!(rows.len(), 1, "{}", backend.backend_name());
        assert_eq!(rows[0].row_key, "m2");
    }
}

#[tokio::test]
async fn test_tables_are_isolated() {
    for backend in backends().await {
        backend.insert(node("m1", "s1", "free")).await.unwrap();
        let rows = backend.query("Task", &QueryFilter::new()).await.unwrap();
        assert!(rows.is_empty(), "{}", backend.backend_name());
    }
}

#[tokio::test]
async fn test_delete_then_insert_reuses_key() {
    for backend in backends().await {
        let stored = backend.insert(node("m1", "s1", "free")).await.unwrap();
        assert!(
            backend
                .delete("Node", "pool-a", "m1", stored.etag.as_deref())
                .await
                .unwrap()
        );
        backend.insert(node("m1", "s1", "init")).await.unwrap();

        let current = backend.get("Node", "pool-a", "m1").await.unwrap().unwrap();
        assert_eq!(current.body["state"], "init", "{}", backend.backend_name());
    }
}
