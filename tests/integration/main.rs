//! Integration tests for Layerkeep

mod store_tests {
    use layerkeep::config::WorkerConfig;
    use layerkeep::executor::StorageOnlyExecutor;
    use layerkeep::index::RefKind;
    use layerkeep::snapshot::SnapshotterFactory;
    use layerkeep::{LayerkeepError, Worker};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn worker_with(dir: &TempDir, interval_ms: u64) -> Worker {
        let mut config = WorkerConfig {
            root: dir.path().to_path_buf(),
            ..Default::default()
        };
        config.gc.interval_ms = interval_ms;
        Worker::open(
            &config,
            &SnapshotterFactory::native(),
            &StorageOnlyExecutor::factory(),
        )
        .await
        .unwrap()
    }

    /// Worker whose background collector stays out of the way
    async fn worker(dir: &TempDir) -> Worker {
        worker_with(dir, 3_600_000).await
    }

    #[tokio::test]
    async fn leased_resources_survive_collection() {
        let dir = TempDir::new().unwrap();
        let w = worker(&dir).await;

        let lease = w.leases().create("buildkit").await.unwrap();
        let d = w.content().put_with_lease(&lease, b"base layer").await.unwrap();
        w.snapshots()
            .create_with_lease(&lease, "base", None, &[d.clone()])
            .await
            .unwrap();
        w.snapshots().create("derived", Some("base"), &[]).await.unwrap();

        for _ in 0..3 {
            w.collect_now().await.unwrap();
        }

        assert!(w.snapshots().get("base").await.is_ok());
        assert!(w.content().contains(&d).await);
        // Nothing leases the child, so it goes.
        assert!(w.snapshots().get("derived").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn release_then_collect_then_rebuild_with_shared_ancestor() {
        let dir = TempDir::new().unwrap();
        let w = worker(&dir).await;

        // Lease A holds S1 over "x".
        let a = w.leases().create("buildkit").await.unwrap();
        let d1 = w.content().put_with_lease(&a, b"x").await.unwrap();
        w.snapshots()
            .create_with_lease(&a, "S1", None, &[d1.clone()])
            .await
            .unwrap();

        w.leases().release(&a).await.unwrap();
        assert!(w.gc_trigger().is_pending());
        w.collect_now().await.unwrap();

        assert!(w.snapshots().get("S1").await.unwrap_err().is_not_found());
        assert!(w.content().get(&d1).await.unwrap_err().is_not_found());

        // Lease B rebuilds S1 over "y" and adds S2 on top; C keeps S2.
        let b = w.leases().create("buildkit").await.unwrap();
        let d2 = w.content().put_with_lease(&b, b"y").await.unwrap();
        w.snapshots()
            .create_with_lease(&b, "S1", None, &[d2.clone()])
            .await
            .unwrap();
        w.snapshots()
            .create_with_lease(&b, "S2", Some("S1"), &[])
            .await
            .unwrap();

        let c = w.leases().create("buildkit").await.unwrap();
        w.leases()
            .add_reference(&c, RefKind::Snapshot, "S2")
            .await
            .unwrap();
        w.leases().release(&b).await.unwrap();
        w.collect_now().await.unwrap();

        assert!(w.snapshots().get("S1").await.is_ok());
        assert!(w.snapshots().get("S2").await.is_ok());
        assert_eq!(w.content().get(&d2).await.unwrap(), b"y");
        assert_eq!(
            w.snapshots().parent_of("S2").await.unwrap().as_deref(),
            Some("S1")
        );

        w.leases().release(&c).await.unwrap();
        let stats = w.collect_now().await.unwrap();
        assert_eq!(stats.snapshots_removed, 2);
        assert_eq!(stats.blobs_removed, 1);
        assert!(w.snapshots().list().await.is_empty());
    }

    #[tokio::test]
    async fn reput_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let w = worker(&dir).await;

        let first = w.content().put(b"same bytes").await.unwrap();
        let usage = w.content().usage().await;
        let second = w.content().put(b"same bytes").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(w.content().usage().await, usage);
        assert_eq!(usage.blobs, 1);
    }

    #[tokio::test]
    async fn deleting_referenced_resources_is_in_use() {
        let dir = TempDir::new().unwrap();
        let w = worker(&dir).await;

        let d = w.content().put(b"diff").await.unwrap();
        w.snapshots().create("parent", None, &[d.clone()]).await.unwrap();
        w.snapshots().create("child", Some("parent"), &[]).await.unwrap();

        let err = w.snapshots().remove("parent").await.unwrap_err();
        assert!(err.is_in_use());
        let err = w.content().delete(&d).await.unwrap_err();
        assert!(err.is_in_use());

        // Leaves first, then the rest unwinds.
        w.snapshots().remove("child").await.unwrap();
        w.snapshots().remove("parent").await.unwrap();
        assert_eq!(w.content().delete(&d).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn leased_blob_cannot_be_deleted() {
        let dir = TempDir::new().unwrap();
        let w = worker(&dir).await;

        let lease = w.leases().create("buildkit").await.unwrap();
        let d = w.content().put_with_lease(&lease, b"held").await.unwrap();

        let err = w.content().delete(&d).await.unwrap_err();
        assert!(matches!(err, LayerkeepError::InUse { .. }));
    }

    #[tokio::test]
    async fn shared_ownership_outlives_first_release() {
        let dir = TempDir::new().unwrap();
        let w = worker(&dir).await;

        let a = w.leases().create("buildkit").await.unwrap();
        let b = w.leases().create("buildkit").await.unwrap();
        let d = w.content().put_with_lease(&a, b"shared").await.unwrap();
        w.leases()
            .add_reference(&b, RefKind::Blob, &d.to_string())
            .await
            .unwrap();

        w.leases().release(&a).await.unwrap();
        w.collect_now().await.unwrap();
        assert!(w.content().contains(&d).await);

        w.leases().release(&b).await.unwrap();
        w.collect_now().await.unwrap();
        assert!(!w.content().contains(&d).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn references_taken_during_collection_are_honoured() {
        let dir = TempDir::new().unwrap();
        let w = Arc::new(worker(&dir).await);
        let done = Arc::new(AtomicBool::new(false));

        let collector = {
            let (w, done) = (w.clone(), done.clone());
            tokio::spawn(async move {
                while !done.load(Ordering::SeqCst) {
                    w.collect_now().await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut held = Vec::new();
        for i in 0..50u32 {
            let lease = w.leases().create("buildkit").await.unwrap();
            let data = format!("layer {i}");
            let d = w.content().put(data.as_bytes()).await.unwrap();

            // The blob is unleased until the reference lands, so the
            // collector may win the race; it must never win after.
            match w
                .leases()
                .add_reference(&lease, RefKind::Blob, &d.to_string())
                .await
            {
                Ok(()) => held.push(d),
                Err(e) => assert!(e.is_not_found(), "unexpected error: {e}"),
            }

            let key = format!("snap-{i}");
            w.snapshots()
                .create_with_lease(&lease, &key, None, &[])
                .await
                .unwrap();
        }

        done.store(true, Ordering::SeqCst);
        collector.await.unwrap();
        w.collect_now().await.unwrap();

        for d in &held {
            assert!(w.content().contains(d).await, "leased blob {d} was collected");
        }
        assert_eq!(w.snapshots().list().await.len(), 50);
    }

    #[tokio::test]
    async fn burst_of_triggers_runs_one_cycle() {
        let dir = TempDir::new().unwrap();
        let w = worker_with(&dir, 100).await;
        let journal = w.root().join("gc.log");
        let cycles = || {
            std::fs::read_to_string(&journal)
                .map(|s| s.lines().filter(|l| l.contains("gc.completed")).count())
                .unwrap_or(0)
        };

        for _ in 0..20 {
            w.gc_trigger().trigger();
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(cycles(), 1);

        w.gc_trigger().trigger();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(cycles(), 2);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let (lease, d) = {
            let w = worker(&dir).await;
            let lease = w.leases().create("buildkit").await.unwrap();
            let d = w.content().put_with_lease(&lease, b"durable").await.unwrap();
            (lease, d)
        };

        let w = worker(&dir).await;
        w.collect_now().await.unwrap();
        assert_eq!(w.content().get(&d).await.unwrap(), b"durable");
        assert_eq!(w.leases().get(&lease).await.unwrap().reference_count(), 1);
    }
}

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    /// Command isolated from the user's config and storage
    fn layerkeep(dir: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("layerkeep");
        cmd.arg("--root")
            .arg(dir.path())
            .arg("--config")
            .arg(dir.path().join("config.toml"));
        cmd
    }

    #[test]
    fn help_displays() {
        cargo_bin_cmd!("layerkeep")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("build-cache storage"));
    }

    #[test]
    fn version_displays() {
        cargo_bin_cmd!("layerkeep")
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("layerkeep"));
    }

    #[test]
    fn info_shows_worker() {
        let dir = TempDir::new().unwrap();
        layerkeep(&dir)
            .arg("info")
            .assert()
            .success()
            .stdout(predicate::str::contains("oci-native"))
            .stdout(predicate::str::contains("io.layerkeep.worker.snapshotter"));
    }

    #[test]
    fn du_json_on_empty_store() {
        let dir = TempDir::new().unwrap();
        layerkeep(&dir)
            .args(["du", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"blobs\": 0"));
    }

    #[test]
    fn gc_on_empty_store() {
        let dir = TempDir::new().unwrap();
        layerkeep(&dir)
            .arg("gc")
            .assert()
            .success()
            .stdout(predicate::str::contains("Nothing to collect"));
    }

    #[test]
    fn lease_list_empty() {
        let dir = TempDir::new().unwrap();
        layerkeep(&dir)
            .args(["lease", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No leases found"));
    }

    #[test]
    fn lease_release_missing() {
        let dir = TempDir::new().unwrap();
        layerkeep(&dir)
            .args(["lease", "release", "nonexistent-lease"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Lease not found"));
    }

    #[test]
    fn unknown_snapshotter_is_reported() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.toml"), "snapshotter = \"zfs\"\n").unwrap();
        layerkeep(&dir)
            .arg("info")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown snapshotter"))
            .stderr(predicate::str::contains("Hint:"));
    }
}
