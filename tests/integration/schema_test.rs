//! Schema snapshots, caching, and drift detection.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use neobase::models::SelectedTables;
use neobase::storage::ChatStore;

use super::{postgres_connection, test_core, MockDriverFactory};
use neobase::db::{DbManager, DriverRegistry, DatabaseType};
use neobase::llm::MockLlmClient;

#[tokio::test]
async fn schema_snapshot_is_cached_until_invalidated() {
    let mut registry = DriverRegistry::new();
    registry.register(DatabaseType::Postgres, Arc::new(MockDriverFactory));
    let db = Arc::new(DbManager::new(registry));
    db.connect("c1", postgres_connection()).await.unwrap();

    let ctx = CancellationToken::new();
    let first = db
        .get_schema(&ctx, "c1", &SelectedTables::All, false)
        .await
        .unwrap();
    let second = db
        .get_schema(&ctx, "c1", &SelectedTables::All, false)
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second), "second read must hit the cache");

    let refreshed = db
        .get_schema(&ctx, "c1", &SelectedTables::All, true)
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&second, &refreshed));
}

#[tokio::test]
async fn selected_tables_filter_is_applied_to_prompt_context() {
    let client = Arc::new(MockLlmClient::new());
    let core = test_core(client.clone(), Default::default()).await;

    // Narrow the chat to a table the mock schema does not have.
    let mut chat = core.stores.chats.get("c1").await.unwrap().unwrap();
    chat.selected_tables = SelectedTables::parse("payments");
    core.stores.chats.update(&chat).await.unwrap();

    core.hub.register("s1", "c1", "u1");
    core.service
        .send_message("u1", "c1", "s1", "anything")
        .await
        .unwrap();

    let requests = client.requests.lock().unwrap();
    let context = requests[0].schema_context.as_deref().unwrap();
    assert!(
        !context.contains("Table: users"),
        "filtered-out tables must not reach the model"
    );
}

#[tokio::test]
async fn drift_detection_reports_no_change_for_static_schema() {
    let mut registry = DriverRegistry::new();
    registry.register(DatabaseType::Postgres, Arc::new(MockDriverFactory));
    let db = Arc::new(DbManager::new(registry));
    db.connect("c1", postgres_connection()).await.unwrap();

    let ctx = CancellationToken::new();
    db.get_schema(&ctx, "c1", &SelectedTables::All, false)
        .await
        .unwrap();

    let changed = db.detect_schema_drift(&ctx, "c1").await.unwrap();
    assert!(changed.is_empty());
}

#[test]
fn checksums_bucket_row_counts() {
    use neobase::db::row_count_bucket;
    assert_eq!(row_count_bucket(999), 100);
    assert_eq!(row_count_bucket(1000), 1000);
    assert_eq!(row_count_bucket(1001), 1000);
}
