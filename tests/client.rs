//! End-to-end tests: a real listener, the typed client, a scratch data directory.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ring_builder_service::catalog::types::{Catalog, Category, DeviceId, DeviceSpec};
use ring_builder_service::client::{RetryPolicy, RingBuilderClient};
use ring_builder_service::mutation::service::CatalogService;
use ring_builder_service::ring::builder::WeightedRebalancer;
use ring_builder_service::server::router;
use ring_builder_service::store::file::FileStore;
use ring_builder_service::store::lock::LockManager;
use ring_builder_service::store::publisher::RingArtifact;
use ring_builder_service::store::version::VersionToken;

const KEY: &str = "integration-key";

struct Node {
    _dir: tempfile::TempDir,
    addr: SocketAddr,
    service: Arc<CatalogService>,
}

async fn start_node(lock_timeout: Duration) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(
        dir.path().join("data"),
        dir.path().join("backups"),
    ));
    store
        .create(&Catalog::new(Category::Object, 6, 3, 1))
        .await
        .unwrap();

    let service = Arc::new(CatalogService::new(
        store,
        LockManager::new(lock_timeout),
        Arc::new(WeightedRebalancer::new()),
    ));
    let app = router(service.clone(), KEY);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Node {
        _dir: dir,
        addr,
        service,
    }
}

fn client(node: &Node) -> RingBuilderClient {
    RingBuilderClient::new(format!("http://{}", node.addr), KEY)
}

fn devices(n: u32) -> Vec<DeviceSpec> {
    (0..n)
        .map(|i| DeviceSpec {
            zone: i % 4 + 1,
            ip: format!("192.168.1.{}", i + 10),
            port: 6200,
            device: format!("d{}", i),
            weight: 100.0,
            meta: format!("node{}", i),
        })
        .collect()
}

#[tokio::test]
async fn test_build_and_publish_a_ring() {
    let node = start_node(Duration::from_secs(1)).await;
    let client = client(&node);

    let fetched = client.fetch_builder(Category::Object).await.unwrap();
    assert_eq!(fetched.hash, VersionToken::of(&fetched.bytes));

    let t1 = client
        .add(Category::Object, &fetched.hash, &devices(8))
        .await
        .unwrap();
    assert_eq!(client.builder_hash(Category::Object).await.unwrap(), t1);

    let listed = client.list(Category::Object).await.unwrap();
    assert_eq!(listed.hash, t1);
    assert_eq!(listed.devices.len(), 8);

    let rebalanced = client.rebalance(Category::Object, &t1).await.unwrap();
    assert_eq!(rebalanced.partitions, 64);
    assert_eq!(rebalanced.reassigned, 64);

    let ring = client.fetch_ring(Category::Object).await.unwrap();
    let artifact = RingArtifact::decode(&ring.bytes).unwrap();
    assert_eq!(artifact.replica_count, 3);
    assert_eq!(artifact.devs.len(), 8);
    assert!(artifact.replica2part2dev.iter().all(|row| row.len() == 64));

    let found = client.search(Category::Object, "z2").await.unwrap();
    assert_eq!(found.hash, rebalanced.hash);
    assert_eq!(found.devices.len(), 2);
}

#[tokio::test]
async fn test_stale_and_unchanged_writes_are_reported() {
    let node = start_node(Duration::from_secs(1)).await;
    let client = client(&node);

    let t0 = client.builder_hash(Category::Object).await.unwrap();
    let t1 = client
        .add(Category::Object, &t0, &devices(4))
        .await
        .unwrap();

    let err = client
        .add(Category::Object, &t1, &devices(2))
        .await
        .unwrap_err();
    assert!(err.is_unchanged());
    assert_eq!(err.status().map(|s| s.as_u16()), Some(400));

    let weights: BTreeMap<_, _> = [(DeviceId(1), 50.0)].into();
    let err = client
        .set_weight(Category::Object, &t0, &weights)
        .await
        .unwrap_err();
    assert!(err.is_stale());

    let metas: BTreeMap<_, _> = [(DeviceId(3), "rack9".to_string())].into();
    let t2 = client.set_meta(Category::Object, &t1, &metas).await.unwrap();
    let t3 = client
        .remove(Category::Object, &t2, &[DeviceId(0)])
        .await
        .unwrap();
    assert_ne!(t3, t2);

    let err = client.fetch_ring(Category::Object).await.unwrap_err();
    assert_eq!(err.status().map(|s| s.as_u16()), Some(404));
}

#[tokio::test]
async fn test_client_retries_while_category_is_locked() {
    let node = start_node(Duration::from_millis(50)).await;
    let client = client(&node).with_retry(RetryPolicy {
        attempts: 8,
        base_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
    });
    let t0 = client.builder_hash(Category::Object).await.unwrap();

    let held = node
        .service
        .locks()
        .acquire(Category::Object)
        .await
        .unwrap();
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        drop(held);
    });

    let t1 = client
        .add(Category::Object, &t0, &devices(3))
        .await
        .unwrap();
    release.await.unwrap();
    assert_ne!(t1, t0);

    let impatient = RingBuilderClient::new(format!("http://{}", node.addr), KEY).with_retry(
        RetryPolicy {
            attempts: 1,
            ..RetryPolicy::default()
        },
    );
    let _held = node
        .service
        .locks()
        .acquire(Category::Object)
        .await
        .unwrap();
    let err = impatient.list(Category::Object).await.unwrap_err();
    assert!(err.is_lock_conflict());
}
