//! Mutation Module Tests
//!
//! Exercises the protocol end to end against a scratch data directory.
//!
//! ## Test Scopes
//! - **Protocol**: body parsing into typed mutations.
//! - **Service**: CAS, batch atomicity, no-op adds, guarded rebalance, lock contention.
//! - **Router**: status codes, headers and bodies as seen by an HTTP client.

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tower::ServiceExt;

    use crate::catalog::types::{Catalog, Category, DeviceId, DeviceSpec};
    use crate::error::{Error, ErrorResponse};
    use crate::mutation::protocol::{
        Action, HEADER_CURRENT_HASH, HEADER_KEY, HEADER_LAST_HASH, ListResponse, Mutation,
        RebalanceResponse, SearchResponse,
    };
    use crate::mutation::service::{Applied, CatalogService, FileKind};
    use crate::ring::builder::WeightedRebalancer;
    use crate::ring::{RebalanceReport, Recompute, RecomputeError};
    use crate::server::router;
    use crate::store::file::{CatalogStore, FileStore};
    use crate::store::lock::LockManager;
    use crate::store::publisher::RingArtifact;
    use crate::store::version::VersionToken;

    const KEY: &str = "s3cr3t";

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<FileStore>,
        service: Arc<CatalogService>,
    }

    impl Harness {
        async fn builder_bytes(&self) -> Vec<u8> {
            self.store.read("object.builder").await.unwrap()
        }

        async fn token(&self) -> VersionToken {
            VersionToken::of(&self.builder_bytes().await)
        }

        async fn catalog(&self) -> Catalog {
            self.store.load(Category::Object).await.unwrap().0
        }

        async fn backups(&self, file: &str) -> usize {
            self.store.backups(file).await.unwrap().len()
        }

        fn app(&self) -> Router {
            router(self.service.clone(), KEY)
        }
    }

    fn device(i: u32) -> DeviceSpec {
        DeviceSpec {
            zone: i % 3 + 1,
            ip: format!("10.0.0.{}", i + 1),
            port: 6000,
            device: "sdb1".to_string(),
            weight: 1.0,
            meta: String::new(),
        }
    }

    /// Devices 0..=4, weight 1.0, as left behind by an add that was never rebalanced.
    fn five_device_catalog() -> Catalog {
        let mut catalog = Catalog::new(Category::Object, 4, 3, 1);
        for i in 0..5 {
            catalog.insert_device(device(i).into_device(DeviceId(i)));
        }
        catalog.devs_changed = true;
        catalog
    }

    async fn harness_with(catalog: Catalog, recompute: Arc<dyn Recompute>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::new(
            dir.path().join("data"),
            dir.path().join("backups"),
        ));
        store.create(&catalog).await.unwrap();
        let service = Arc::new(CatalogService::new(
            store.clone(),
            LockManager::default(),
            recompute,
        ));
        Harness {
            _dir: dir,
            store,
            service,
        }
    }

    async fn builder_token(store: &FileStore) -> VersionToken {
        VersionToken::of(&store.read("object.builder").await.unwrap())
    }

    async fn harness() -> Harness {
        harness_with(five_device_catalog(), Arc::new(WeightedRebalancer::new())).await
    }

    /// Always reports a small improvement on an otherwise valid assignment.
    struct Nudge;

    impl Recompute for Nudge {
        fn rebalance(
            &self,
            catalog: &mut Catalog,
            _now: u64,
        ) -> Result<RebalanceReport, RecomputeError> {
            catalog.assignment =
                vec![vec![Some(DeviceId(1)); catalog.partition_count()]; catalog.replicas];
            Ok(RebalanceReport {
                reassigned: 4,
                balance: catalog.balance + 0.5,
            })
        }

        fn validate(&self, _catalog: &Catalog) -> Result<(), RecomputeError> {
            Ok(())
        }
    }

    /// Never manages to move anything.
    struct Stuck;

    impl Recompute for Stuck {
        fn rebalance(
            &self,
            _catalog: &mut Catalog,
            _now: u64,
        ) -> Result<RebalanceReport, RecomputeError> {
            Ok(RebalanceReport {
                reassigned: 0,
                balance: 50.0,
            })
        }

        fn validate(&self, _catalog: &Catalog) -> Result<(), RecomputeError> {
            Ok(())
        }
    }

    /// Places every replica but never passes the structural check.
    struct Broken;

    impl Recompute for Broken {
        fn rebalance(
            &self,
            catalog: &mut Catalog,
            _now: u64,
        ) -> Result<RebalanceReport, RecomputeError> {
            Nudge.rebalance(catalog, 0)
        }

        fn validate(&self, _catalog: &Catalog) -> Result<(), RecomputeError> {
            Err(RecomputeError::Validation(
                "partition 0 has two replicas on device 1".to_string(),
            ))
        }
    }

    /// File store whose first ring write fails, as if the disk filled up between the
    /// catalog write and the ring write.
    struct FailFirstRingWrite {
        inner: Arc<FileStore>,
        failed: AtomicBool,
    }

    #[async_trait::async_trait]
    impl CatalogStore for FailFirstRingWrite {
        async fn read(&self, file_name: &str) -> crate::error::Result<Vec<u8>> {
            self.inner.read(file_name).await
        }

        async fn write(&self, file_name: &str, bytes: &[u8]) -> crate::error::Result<VersionToken> {
            if file_name.ends_with(".ring.gz") && !self.failed.swap(true, Ordering::SeqCst) {
                return Err(Error::Internal(anyhow::anyhow!("disk full")));
            }
            self.inner.write(file_name, bytes).await
        }
    }

    // ============================================================
    // PROTOCOL TESTS
    // ============================================================

    #[test]
    fn test_parse_add_accepts_numeric_strings() {
        let body = json!({"devices": [
            {"zone": "2", "ip": "10.0.0.9", "port": 6000, "device": "sdd1", "weight": "2.5"},
            {"zone": 1, "ip": "10.0.0.9", "port": "6001", "device": "sde1", "weight": 1, "meta": 7}
        ]});
        let Mutation::AddDevices(specs) = Mutation::parse(Action::Add, &body).unwrap() else {
            panic!("expected an add");
        };
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].zone, 2);
        assert_eq!(specs[0].weight, 2.5);
        assert_eq!(specs[0].meta, "");
        assert_eq!(specs[1].port, 6001);
        assert_eq!(specs[1].meta, "7");
    }

    #[test]
    fn test_parse_rejects_malformed_bodies() {
        let cases = [
            (Action::Add, json!({})),
            (Action::Add, json!({"devices": []})),
            (Action::Add, json!({"devices": [{"zone": 1, "ip": "10.0.0.1"}]})),
            (Action::Add, json!({"devices": [{"zone": 1, "ip": "10.0.0.1", "port": 70000, "device": "sda", "weight": 1}]})),
            (Action::Remove, json!({"devices": ["x"]})),
            (Action::Remove, json!({"devices": {"1": 1}})),
            (Action::Weight, json!({"devices": {"1": "heavy"}})),
            (Action::Weight, json!({"devices": {"one": 1.0}})),
            (Action::Weight, json!({"devices": {"1": 1.0, "01": 2.0}})),
            (Action::Meta, json!({"devices": {"1": ["a"]}})),
        ];
        for (action, body) in cases {
            let err = Mutation::parse(action, &body).unwrap_err();
            assert!(matches!(err, Error::BadRequest(_)), "{:?} {}", action, body);
        }
    }

    #[test]
    fn test_parse_weight_and_meta_maps() {
        let weights = Mutation::parse(Action::Weight, &json!({"devices": {"1": "5.0", "3": 0}}))
            .unwrap();
        let expected: BTreeMap<_, _> = [(DeviceId(1), 5.0), (DeviceId(3), 0.0)].into();
        assert_eq!(weights, Mutation::SetWeight(expected));

        let metas =
            Mutation::parse(Action::Meta, &json!({"devices": {"2": true}})).unwrap();
        let expected: BTreeMap<_, _> = [(DeviceId(2), "true".to_string())].into();
        assert_eq!(metas, Mutation::SetMeta(expected));
    }

    // ============================================================
    // SERVICE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_remove_then_reweight_scenario() {
        let h = harness().await;
        let t0 = h.token().await;

        let remove = Mutation::RemoveDevices(vec![DeviceId(0)]);
        let applied = h.service.apply(Category::Object, &t0, remove).await.unwrap();
        let t1 = applied.token().clone();
        assert!(matches!(applied, Applied::Written(_)));
        assert_ne!(t1, t0);
        assert_eq!(t1, h.token().await);
        assert_eq!(h.backups("object.builder").await, 1);

        let removed = h.catalog().await.device(DeviceId(0)).cloned().unwrap();
        assert_eq!(removed.weight, 0.0);
        assert!(removed.removed);

        let body = json!({"devices": {"1": "5.0"}});
        let weight = Mutation::parse(Action::Weight, &body).unwrap();
        let applied = h.service.apply(Category::Object, &t1, weight).await.unwrap();
        assert_ne!(applied.token(), &t1);
        assert_eq!(h.catalog().await.device(DeviceId(1)).unwrap().weight, 5.0);
        assert_eq!(h.backups("object.builder").await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_writers_with_same_token() {
        let h = harness().await;
        let t0 = h.token().await;

        let mut tasks = Vec::new();
        for meta in ["left", "right"] {
            let service = h.service.clone();
            let t0 = t0.clone();
            let mutation = Mutation::SetMeta([(DeviceId(2), meta.to_string())].into());
            tasks.push(tokio::spawn(async move {
                service.apply(Category::Object, &t0, mutation).await
            }));
        }

        let mut wins = Vec::new();
        let mut conflicts = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(applied) => wins.push(applied.token().clone()),
                Err(Error::StaleVersion { expected, .. }) => {
                    assert_eq!(expected, t0);
                    conflicts += 1;
                }
                Err(other) => panic!("unexpected error: {}", other),
            }
        }

        assert_eq!(wins.len(), 1);
        assert_eq!(conflicts, 1);
        assert_ne!(wins[0], t0);
        assert_eq!(wins[0], h.token().await);
        assert_eq!(h.backups("object.builder").await, 1);
    }

    #[tokio::test]
    async fn test_invalid_id_rejects_whole_batch() {
        let h = harness().await;
        let before = h.builder_bytes().await;
        let t0 = VersionToken::of(&before);

        let remove = Mutation::RemoveDevices(vec![DeviceId(1), DeviceId(9)]);
        let err = h.service.apply(Category::Object, &t0, remove).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));

        let weight = Mutation::SetWeight([(DeviceId(1), 2.0), (DeviceId(2), -1.0)].into());
        let err = h.service.apply(Category::Object, &t0, weight).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));

        let twice = Mutation::RemoveDevices(vec![DeviceId(3), DeviceId(3)]);
        assert!(h.service.apply(Category::Object, &t0, twice).await.is_err());

        assert_eq!(h.builder_bytes().await, before);
        assert_eq!(h.backups("object.builder").await, 0);
    }

    #[tokio::test]
    async fn test_removed_device_cannot_be_removed_or_reweighted() {
        let h = harness().await;
        let t0 = h.token().await;
        let t1 = h
            .service
            .apply(Category::Object, &t0, Mutation::RemoveDevices(vec![DeviceId(4)]))
            .await
            .unwrap()
            .token()
            .clone();

        let again = Mutation::RemoveDevices(vec![DeviceId(4)]);
        assert!(h.service.apply(Category::Object, &t1, again).await.is_err());

        let revive = Mutation::SetWeight([(DeviceId(4), 1.0)].into());
        assert!(h.service.apply(Category::Object, &t1, revive).await.is_err());
        assert_eq!(h.token().await, t1);
    }

    #[tokio::test]
    async fn test_noop_add_keeps_token() {
        let h = harness().await;
        let before = h.builder_bytes().await;
        let t0 = VersionToken::of(&before);

        let add = Mutation::AddDevices(vec![device(1), device(3)]);
        let applied = h.service.apply(Category::Object, &t0, add).await.unwrap();

        assert_eq!(applied, Applied::Unchanged(t0));
        assert_eq!(h.builder_bytes().await, before);
        assert_eq!(h.backups("object.builder").await, 0);
    }

    #[tokio::test]
    async fn test_add_skips_duplicates_and_numbers_in_order() {
        let h = harness().await;
        let t0 = h.token().await;

        let add = Mutation::AddDevices(vec![device(7), device(2), device(8), device(7)]);
        h.service.apply(Category::Object, &t0, add).await.unwrap();

        let catalog = h.catalog().await;
        assert_eq!(catalog.live_devices().count(), 7);
        assert_eq!(catalog.device(DeviceId(5)).unwrap().ip, "10.0.0.8");
        assert_eq!(catalog.device(DeviceId(6)).unwrap().ip, "10.0.0.9");

        let mut identities: Vec<_> = catalog.live_devices().map(|d| d.identity()).collect();
        let total = identities.len();
        identities.sort();
        identities.dedup();
        assert_eq!(identities.len(), total);
    }

    #[tokio::test]
    async fn test_stale_token_is_checked_first() {
        let h = harness().await;
        let before = h.builder_bytes().await;
        let stale = VersionToken::of(b"something else");

        let remove = Mutation::RemoveDevices(vec![DeviceId(42)]);
        let err = h.service.apply(Category::Object, &stale, remove).await.unwrap_err();
        assert!(matches!(err, Error::StaleVersion { .. }));
        assert_eq!(h.builder_bytes().await, before);
    }

    #[tokio::test]
    async fn test_out_of_band_edit_changes_token() {
        let h = harness().await;
        let t0 = h.token().await;

        let path = h.store.path_of("object.builder");
        let mut bytes = tokio::fs::read(&path).await.unwrap();
        bytes.push(b'\n');
        tokio::fs::write(&path, &bytes).await.unwrap();

        let meta = Mutation::SetMeta([(DeviceId(0), "x".to_string())].into());
        let err = h.service.apply(Category::Object, &t0, meta).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_rebalance_persists_then_publishes() {
        let h = harness().await;
        let t0 = h.token().await;

        let applied = h
            .service
            .apply(Category::Object, &t0, Mutation::Rebalance)
            .await
            .unwrap();
        let Applied::Rebalanced {
            token,
            ring,
            report,
            partitions,
        } = applied
        else {
            panic!("expected a rebalance");
        };

        assert_eq!(partitions, 16);
        assert_eq!(report.reassigned, 16);
        assert_eq!(token, h.token().await);

        let catalog = h.catalog().await;
        assert!(!catalog.devs_changed);
        assert_eq!(catalog.balance, report.balance);

        let ring_bytes = h.store.read("object.ring.gz").await.unwrap();
        assert_eq!(ring, VersionToken::of(&ring_bytes));
        let artifact = RingArtifact::decode(&ring_bytes).unwrap();
        assert_eq!(artifact.replica2part2dev.len(), 3);
        assert_eq!(artifact.part_shift, 28);

        // Settled ring: nothing left to move.
        let err = h
            .service
            .apply(Category::Object, &token, Mutation::Rebalance)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("min_part_hours [1]"));
        assert_eq!(h.token().await, token);
    }

    #[tokio::test]
    async fn test_anti_thrash_guard_keeps_both_tokens() {
        let mut catalog = five_device_catalog();
        catalog.devs_changed = false;
        catalog.balance = 20.0;
        let h = harness_with(catalog, Arc::new(Nudge)).await;
        h.store.write("object.ring.gz", b"previous ring").await.unwrap();

        let t0 = h.token().await;
        let ring0 = h
            .service
            .current_token(Category::Object, FileKind::Ring)
            .await
            .unwrap();

        let err = h
            .service
            .apply(Category::Object, &t0, Mutation::Rebalance)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Refusing to save rebalance. Did not change at least 1%."
        );

        assert_eq!(h.token().await, t0);
        let ring1 = h
            .service
            .current_token(Category::Object, FileKind::Ring)
            .await
            .unwrap();
        assert_eq!(ring1, ring0);
        assert_eq!(h.backups("object.builder").await, 0);
    }

    #[tokio::test]
    async fn test_small_change_accepted_after_device_change() {
        let h = harness_with(five_device_catalog(), Arc::new(Nudge)).await;
        let t0 = h.token().await;

        let applied = h
            .service
            .apply(Category::Object, &t0, Mutation::Rebalance)
            .await
            .unwrap();
        assert!(matches!(applied, Applied::Rebalanced { .. }));
        assert!(!h.catalog().await.devs_changed);
    }

    #[tokio::test]
    async fn test_rebalance_that_moves_nothing_is_refused() {
        let h = harness_with(five_device_catalog(), Arc::new(Stuck)).await;
        let t0 = h.token().await;

        let err = h
            .service
            .apply(Category::Object, &t0, Mutation::Rebalance)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Either none need to be assigned or none can be due to min_part_hours [1]."
        );
        assert_eq!(h.token().await, t0);
        assert!(h.store.read("object.ring.gz").await.is_err());
    }

    #[tokio::test]
    async fn test_failed_validation_is_refused() {
        let h = harness_with(five_device_catalog(), Arc::new(Broken)).await;
        let t0 = h.token().await;

        let err = h
            .service
            .apply(Category::Object, &t0, Mutation::Rebalance)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("two replicas on device 1"));

        assert_eq!(h.token().await, t0);
        assert!(h.catalog().await.devs_changed);
        assert!(matches!(
            h.store.read("object.ring.gz").await,
            Err(Error::NotFound(_))
        ));
        assert_eq!(h.backups("object.builder").await, 0);
    }

    #[tokio::test]
    async fn test_rerun_rebalance_republishes_after_failed_publish() {
        let dir = tempfile::tempdir().unwrap();
        let files = Arc::new(FileStore::new(
            dir.path().join("data"),
            dir.path().join("backups"),
        ));
        files.create(&five_device_catalog()).await.unwrap();
        let store = Arc::new(FailFirstRingWrite {
            inner: files.clone(),
            failed: AtomicBool::new(false),
        });
        let service = CatalogService::new(
            store,
            LockManager::default(),
            Arc::new(WeightedRebalancer::new()),
        );
        let t0 = builder_token(&files).await;
        let err = service
            .apply(Category::Object, &t0, Mutation::Rebalance)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disk full"));

        // The catalog made it to disk, the ring did not.
        let t1 = builder_token(&files).await;
        assert_ne!(t1, t0);
        assert!(files.read("object.ring.gz").await.is_err());

        let applied = service
            .apply(Category::Object, &t1, Mutation::Rebalance)
            .await
            .unwrap();
        let Applied::Rebalanced {
            token: t2,
            ring,
            report,
            partitions,
        } = applied
        else {
            panic!("expected a republish");
        };
        assert_eq!(t2, t1);
        assert_eq!(builder_token(&files).await, t1);
        assert_eq!(report.reassigned, 0);
        assert_eq!(partitions, 16);

        let ring_bytes = files.read("object.ring.gz").await.unwrap();
        assert_eq!(ring, VersionToken::of(&ring_bytes));
        let (stored, _) = files.load(Category::Object).await.unwrap();
        assert_eq!(
            RingArtifact::decode(&ring_bytes).unwrap(),
            RingArtifact::from_catalog(&stored).unwrap()
        );

        // Ring and catalog agree again, so the usual refusal is back.
        let err = service
            .apply(Category::Object, &t1, Mutation::Rebalance)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
        assert_eq!(files.backups("object.ring.gz").await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_held_lock_times_out_reads_and_writes() {
        let h = harness().await;
        let t0 = h.token().await;
        let _held = h.service.locks().acquire(Category::Object).await.unwrap();

        let err = h.service.list(Category::Object).await.unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));

        let meta = Mutation::SetMeta([(DeviceId(0), "x".to_string())].into());
        let err = h.service.apply(Category::Object, &t0, meta).await.unwrap_err();
        assert_eq!(err.to_string(), "object.builder locked.");

        // Other categories are unaffected.
        let err = h.service.list(Category::Account).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_search_rejects_invalid_term() {
        let h = harness().await;
        let err = h.service.search(Category::Object, "sdb1").await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));

        let (found, token) = h.service.search(Category::Object, "z2").await.unwrap();
        assert_eq!(token, h.token().await);
        let ids: Vec<_> = found.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![DeviceId(1), DeviceId(4)]);
    }

    // ============================================================
    // ROUTER TESTS
    // ============================================================

    fn request(method: &str, uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(HEADER_KEY, KEY)
    }

    async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    async fn error_of(response: axum::response::Response) -> String {
        let body: ErrorResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
        body.error
    }

    fn hash_of(response: &axum::response::Response) -> String {
        response
            .headers()
            .get(HEADER_CURRENT_HASH)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_router_requires_key() {
        let h = harness().await;

        let missing = Request::builder()
            .uri("/ringbuilder/object.builder")
            .body(Body::empty())
            .unwrap();
        let response = h.app().oneshot(missing).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let wrong = Request::builder()
            .uri("/ringbuilder/object.builder")
            .header(HEADER_KEY, "guess")
            .body(Body::empty())
            .unwrap();
        let response = h.app().oneshot(wrong).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_router_fetch_and_head() {
        let h = harness().await;
        let token = h.token().await;

        let req = request("GET", "/ringbuilder/object.builder")
            .body(Body::empty())
            .unwrap();
        let response = h.app().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(hash_of(&response), token.0);
        assert_eq!(body_bytes(response).await, h.builder_bytes().await);

        let req = request("HEAD", "/ringbuilder/object.builder")
            .body(Body::empty())
            .unwrap();
        let response = h.app().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(hash_of(&response), token.0);
        assert!(body_bytes(response).await.is_empty());

        for uri in ["/ringbuilder/bogus.builder", "/ring/object.ring.gz", "/ring/object.builder"] {
            let req = request("GET", uri).body(Body::empty()).unwrap();
            let response = h.app().oneshot(req).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_router_rejects_bad_requests() {
        let h = harness().await;
        let token = h.token().await;

        let req = request("POST", "/ringbuilder/bogus/add")
            .header(HEADER_LAST_HASH, &token.0)
            .body(Body::from("{}"))
            .unwrap();
        let response = h.app().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_of(response).await, "Invalid builder type.");

        let req = request("POST", "/ringbuilder/object/add")
            .header(HEADER_LAST_HASH, &token.0)
            .body(Body::from("{not json"))
            .unwrap();
        let response = h.app().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_of(response).await, "Malformed json.");

        let req = request("POST", "/ringbuilder/object/remove")
            .body(Body::from(r#"{"devices": [1]}"#))
            .unwrap();
        let response = h.app().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let req = request("POST", "/ringbuilder/object/explode")
            .body(Body::from("{}"))
            .unwrap();
        let response = h.app().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        assert_eq!(h.token().await, token);
    }

    #[tokio::test]
    async fn test_router_write_flow() {
        let h = harness().await;
        let t0 = h.token().await;

        let duplicate = json!({"devices": [
            {"zone": 2, "ip": "10.0.0.2", "port": 6000, "device": "sdb1", "weight": 1.0}
        ]});
        let req = request("POST", "/ringbuilder/object/add")
            .header(HEADER_LAST_HASH, &t0.0)
            .body(Body::from(duplicate.to_string()))
            .unwrap();
        let response = h.app().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(hash_of(&response), t0.0);
        assert_eq!(error_of(response).await, "Ring remains unchanged.");

        let req = request("POST", "/ringbuilder/object/weight")
            .header(HEADER_LAST_HASH, &t0.0)
            .body(Body::from(r#"{"devices": {"1": "5.0"}}"#))
            .unwrap();
        let response = h.app().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let t1 = hash_of(&response);
        assert_ne!(t1, t0.0);
        assert_eq!(t1, h.token().await.0);

        // Replaying the old token is a conflict.
        let req = request("POST", "/ringbuilder/object/weight")
            .header(HEADER_LAST_HASH, &t0.0)
            .body(Body::from(r#"{"devices": {"1": "6.0"}}"#))
            .unwrap();
        let response = h.app().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let req = request("POST", "/ringbuilder/object/rebalance")
            .header(HEADER_LAST_HASH, &t1)
            .body(Body::empty())
            .unwrap();
        let response = h.app().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let t2 = hash_of(&response);
        let body: RebalanceResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body.hash.0, t2);
        assert_eq!(body.partitions, 16);
        assert!(body.reassigned > 0);

        let req = request("HEAD", "/ring/object.ring.gz")
            .body(Body::empty())
            .unwrap();
        let response = h.app().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_router_list_and_search() {
        let h = harness().await;
        let token = h.token().await;

        let req = request("GET", "/ringbuilder/object/list")
            .body(Body::empty())
            .unwrap();
        let response = h.app().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let listed: ListResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(listed.hash, token);
        assert_eq!(listed.devices.len(), 5);

        let req = request("POST", "/ringbuilder/object/search")
            .body(Body::from(r#"{"value": "10.0.0.3"}"#))
            .unwrap();
        let response = h.app().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let found: SearchResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(found.devices.len(), 1);
        assert_eq!(found.devices[0].id, DeviceId(2));

        let req = request("POST", "/ringbuilder/object/search")
            .body(Body::from(r#"{"value": "/nothing"}"#))
            .unwrap();
        let response = h.app().oneshot(req).await.unwrap();
        let found: SearchResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert!(found.devices.is_empty());

        for uri in ["/ringbuilder/object/stats", "/ringbuilder/bogus/list"] {
            let req = request("GET", uri).body(Body::empty()).unwrap();
            let response = h.app().oneshot(req).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", uri);
        }
    }
}
