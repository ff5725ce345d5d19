//! Pipeline integration tests.
//!
//! Import -> sync -> query against an in-memory document store, the way the
//! shell drives the library.
//!
//! Run with: `cargo test --test pipeline`

use std::sync::Arc;
use std::time::Duration;

use route_hub::{
    ConnectionState, DocumentStore, FieldFilter, MemoryStore, PathScheme, QueryParams, SortKey,
    SyncClient, SyncConfig, UsageFilter, UserId, WriteAck,
};
use serde_json::json;

const CATALOG_CSV: &str = "\
dest.id,dest.name,dest.iata,direct_dist,profit_pt,aircraft,origin
a,Lisboa,LIS,500,100,X,JFK
b,Porto,OPO,900,50,Y,JFK
";

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Helper: connected client over a fresh memory store.
async fn connected_client(user: &str) -> (SyncClient, Arc<MemoryStore>) {
    init_logs();
    let store = Arc::new(MemoryStore::new());
    let dyn_store: Arc<dyn DocumentStore> = store.clone();
    let client = SyncClient::new(dyn_store, SyncConfig::default());
    client.connect(user).await.expect("connect failed");
    wait_for(&client, |c| c.state() == ConnectionState::Synced).await;
    (client, store)
}

/// Helper: poll until the client reaches a condition.
async fn wait_for<F>(client: &SyncClient, condition: F)
where
    F: Fn(&SyncClient) -> bool,
{
    for _ in 0..400 {
        if condition(client) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached: {:?}", client.stats());
}

fn ids(client: &SyncClient, params: &QueryParams) -> Vec<String> {
    client
        .evaluate(params)
        .page
        .into_iter()
        .map(|r| r.id)
        .collect()
}

// ============================================================================
// Import -> Query
// ============================================================================

#[tokio::test]
async fn test_used_filter_over_synced_catalog() {
    let (client, _store) = connected_client("user-1").await;

    assert_eq!(client.import(CATALOG_CSV, "export.csv").await.unwrap(), WriteAck::Confirmed);
    assert_eq!(client.set_active("a", true).await.unwrap(), WriteAck::Confirmed);
    wait_for(&client, |c| !c.has_unconfirmed_writes()).await;

    let result = client.evaluate(&QueryParams {
        usage_filter: UsageFilter::Used,
        ..QueryParams::default()
    });
    assert_eq!(result.page.len(), 1);
    assert_eq!(result.page[0].id, "a");
    assert_eq!(result.aggregates.active_count, 1);
    assert_eq!(result.aggregates.estimated_profit, 100.0);
    assert_eq!(result.aggregates.catalog_count, 2);
}

#[tokio::test]
async fn test_sort_by_distance() {
    let (client, _store) = connected_client("user-1").await;
    client.import(CATALOG_CSV, "export.csv").await.unwrap();
    client.set_active("a", true).await.unwrap();

    let params = QueryParams {
        sort_key: SortKey::Distance,
        usage_filter: UsageFilter::All,
        ..QueryParams::default()
    };
    assert_eq!(ids(&client, &params), vec!["b", "a"]);

    let by_profit = QueryParams::default();
    assert_eq!(ids(&client, &by_profit), vec!["a", "b"]);
}

#[tokio::test]
async fn test_filter_options_follow_catalog() {
    let (client, _store) = connected_client("user-1").await;
    client.import(CATALOG_CSV, "export.csv").await.unwrap();

    let options = client.filter_options();
    assert_eq!(options.aircraft, vec!["X", "Y"]);
    assert_eq!(options.origins, vec!["JFK"]);

    let params = QueryParams {
        aircraft_filter: FieldFilter::from("Y"),
        ..QueryParams::default()
    };
    assert_eq!(ids(&client, &params), vec!["b"]);
}

#[tokio::test]
async fn test_label_hints_tag_whole_import() {
    let (client, _store) = connected_client("user-1").await;
    client
        .import("dest.id,dest.name\n1,Lisboa\n2,Porto\n", "JFK_MC214_routes.csv")
        .await
        .unwrap();

    let catalog = client.catalog();
    assert!(catalog.iter().all(|r| r.aircraft == "MC-21-400"));
    assert!(catalog.iter().all(|r| r.origin == "JFK"));
}

// ============================================================================
// Activation
// ============================================================================

#[tokio::test]
async fn test_activation_map_is_order_independent() {
    let (client, store) = connected_client("user-1").await;

    client.set_active("other", true).await.unwrap();
    client.set_active("b", false).await.unwrap();
    client.set_active("a", true).await.unwrap();

    let path = PathScheme::default().activation(&UserId::new("user-1"));
    let stored = store.read(&path).await.unwrap().unwrap();
    assert_eq!(stored["active"]["a"], json!(true));
    assert_eq!(stored["active"]["b"], json!(false));

    wait_for(&client, |c| !c.has_unconfirmed_writes()).await;
    let activation = client.activation();
    assert_eq!(activation.get("a"), Some(true));
    assert_eq!(activation.get("b"), Some(false));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_activation_writes_converge() {
    let (client, store) = connected_client("user-1").await;
    let client = Arc::new(client);

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.set_active(&format!("r{}", i), i % 2 == 0).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // The final stored map holds every id; local state converges to it
    let path = PathScheme::default().activation(&UserId::new("user-1"));
    let stored = store.read(&path).await.unwrap().unwrap();
    assert_eq!(stored["active"].as_object().unwrap().len(), 10);

    wait_for(&client, |c| !c.has_unconfirmed_writes() && c.activation().len() == 10).await;
    assert_eq!(client.activation().active_count(), 5);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_switching_identity_isolates_documents() {
    let (client, store) = connected_client("user-1").await;
    client.import(CATALOG_CSV, "export.csv").await.unwrap();
    client.set_active("a", true).await.unwrap();

    client.connect("user-2").await.unwrap();
    wait_for(&client, |c| c.state() == ConnectionState::Synced).await;
    assert!(client.catalog().is_empty());
    assert!(client.activation().is_empty());

    // Going back restores the first identity's documents from the store
    client.connect("user-1").await.unwrap();
    wait_for(&client, |c| c.state() == ConnectionState::Synced).await;
    wait_for(&client, |c| c.catalog().len() == 2).await;
    assert!(client.activation().is_active("a"));

    let user_2 = PathScheme::default().catalog(&UserId::new("user-2"));
    assert_eq!(store.read(&user_2).await.unwrap(), None);
}

#[tokio::test]
async fn test_offline_write_is_reported_and_kept() {
    let (client, store) = connected_client("user-1").await;
    client.import(CATALOG_CSV, "export.csv").await.unwrap();
    wait_for(&client, |c| !c.has_unconfirmed_writes()).await;

    store.set_offline(true);
    assert!(client.set_active("b", true).await.is_err());

    let result = client.evaluate(&QueryParams {
        usage_filter: UsageFilter::Used,
        ..QueryParams::default()
    });
    assert_eq!(result.page.len(), 1);
    assert_eq!(result.page[0].id, "b");
    assert!(client.has_unconfirmed_writes());
}

#[tokio::test]
async fn test_no_identity_skips_everything() {
    init_logs();
    let store = Arc::new(MemoryStore::new());
    let dyn_store: Arc<dyn DocumentStore> = store.clone();
    let client = SyncClient::new(dyn_store, SyncConfig::default());

    assert_eq!(client.import(CATALOG_CSV, "export.csv").await.unwrap(), WriteAck::Skipped);
    assert_eq!(client.toggle("a").await.unwrap(), WriteAck::Skipped);
    assert_eq!(store.write_count(), 0);
    assert_eq!(client.evaluate(&QueryParams::default()).total_count, 0);
}

#[cfg(feature = "persistence")]
#[tokio::test]
async fn test_sqlite_store_survives_restart() {
    use route_hub::SqliteStore;
    use tempfile::TempDir;

    init_logs();
    let tmp = TempDir::new().expect("failed to create temp dir");
    let db_path = tmp.path().join("docs.db");
    let db_path = db_path.to_str().unwrap();

    {
        let store: Arc<dyn DocumentStore> = Arc::new(SqliteStore::open(db_path).unwrap());
        let client = SyncClient::new(store, SyncConfig::default());
        client.connect("user-1").await.unwrap();
        client.import(CATALOG_CSV, "export.csv").await.unwrap();
        client.set_active("b", true).await.unwrap();
    }

    let store: Arc<dyn DocumentStore> = Arc::new(SqliteStore::open(db_path).unwrap());
    let client = SyncClient::new(store, SyncConfig::default());
    client.connect("user-1").await.unwrap();
    wait_for(&client, |c| c.state() == ConnectionState::Synced).await;

    assert_eq!(client.catalog().len(), 2);
    assert!(client.activation().is_active("b"));
}
