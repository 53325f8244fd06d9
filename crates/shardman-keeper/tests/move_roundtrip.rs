//! Full pipeline: the coordinator's move executor driving this
//! container's admin surface, with duplicate deliveries.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use common::{spec, wait_until, RecordingApp};
use shardman_core::keys;
use shardman_core::lease::{Lease, ShardLease};
use shardman_core::shard::MoveAction;
use shardman_core::store::mem::MemStore;
use shardman_core::store::StoreClient;
use shardman_keeper::{admin_router, KeeperOptions, MemShardLog, ShardKeeper};
use shardman_server::MoveExecutor;

const SERVICE: &str = "orders";

async fn serve_keeper() -> (Arc<ShardKeeper>, Arc<RecordingApp>, SocketAddr, i64) {
    let store = Arc::new(MemStore::new());
    let guard = store.grant_lease(60).await.unwrap();
    let value = serde_json::to_string(&ShardLease {
        lease: Lease::new(guard, 0),
        guard_lease_id: 0,
        bridge_lease_id: 0,
        assignment: None,
    })
    .unwrap();
    store
        .put(&keys::lease_guard(SERVICE), &value, guard)
        .await
        .unwrap();

    let app = Arc::new(RecordingApp::new());
    let keeper = ShardKeeper::new(
        KeeperOptions {
            service: SERVICE.into(),
            container_id: "c1".into(),
            drop_expired_shard: false,
        },
        store,
        Arc::new(MemShardLog::new()),
        app.clone(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = admin_router(keeper.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (keeper, app, addr, guard)
}

#[tokio::test]
async fn duplicated_moves_converge_to_the_same_membership() {
    let (_keeper, app, addr, guard) = serve_keeper().await;

    let add = MoveAction {
        service: SERVICE.into(),
        shard_id: "s1".into(),
        drop_endpoint: None,
        add_endpoint: Some(addr.to_string()),
        allow_drop: false,
        spec: spec(SERVICE, "s1", guard),
    };
    let payload = serde_json::to_vec(&vec![add]).unwrap();

    let executor = MoveExecutor::new(SERVICE).unwrap();
    executor.execute(&payload).await.unwrap();
    // At-least-once delivery: the same task lands twice.
    executor.execute(&payload).await.unwrap();

    let probe = app.clone();
    assert!(
        wait_until(Duration::from_secs(3), move || probe.live_set().contains("s1")).await,
        "moved shard never reached the application"
    );
    sleep(Duration::from_millis(500)).await;
    assert_eq!(app.live_set().len(), 1, "duplicate move must not fork the shard");

    let drop = MoveAction {
        service: SERVICE.into(),
        shard_id: "s1".into(),
        drop_endpoint: Some(addr.to_string()),
        add_endpoint: None,
        allow_drop: false,
        spec: spec(SERVICE, "s1", guard),
    };
    let payload = serde_json::to_vec(&vec![drop]).unwrap();
    executor.execute(&payload).await.unwrap();
    executor.execute(&payload).await.unwrap();

    let probe = app.clone();
    assert!(
        wait_until(Duration::from_secs(3), move || probe.live_set().is_empty()).await,
        "dropped shard stayed live"
    );
    assert_eq!(app.drop_calls("s1"), 1, "application saw more than one effective drop");
}

#[tokio::test]
async fn moves_with_a_stale_lease_are_refused() {
    let (_keeper, app, addr, _guard) = serve_keeper().await;

    let add = MoveAction {
        service: SERVICE.into(),
        shard_id: "s1".into(),
        drop_endpoint: None,
        add_endpoint: Some(addr.to_string()),
        allow_drop: false,
        spec: spec(SERVICE, "s1", 424242),
    };
    let payload = serde_json::to_vec(&vec![add]).unwrap();

    let executor = MoveExecutor::new(SERVICE).unwrap();
    let err = executor.execute(&payload).await;
    assert!(err.is_err(), "a lease-mismatched add must fail the task");
    sleep(Duration::from_millis(500)).await;
    assert!(app.live_set().is_empty());
}
