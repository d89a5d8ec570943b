//! File-mode lifecycle through the public API: shared registries, readers
//! racing reloads, and TOML-driven configuration.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tempfile::TempDir;
use tollgate_core::PolicyConfig;
use tollgate_policy::{ManagerState, PolicyManager, PolicyRegistry};

fn write_policy(dir: &Path, name: &str, version: &str) {
    fs::write(
        dir.join(format!("{name}.yaml")),
        format!(
            "name: {name}\nversion: {version}\nrules:\n  - name: {name}-rule\n    actions:\n      - type: deny\n        reason: blocked\n"
        ),
    )
    .unwrap();
}

#[tokio::test]
async fn shared_registry_sees_every_reload() {
    let dir = TempDir::new().unwrap();
    write_policy(dir.path(), "egress", "1.0.0");

    let registry = Arc::new(PolicyRegistry::new());
    let manager = PolicyManager::builder(PolicyConfig::file(dir.path()))
        .registry(registry.clone())
        .build()
        .unwrap();

    manager.load_policies().await.unwrap();
    let before = registry.snapshot();
    assert_eq!(before.names(), vec!["egress"]);

    write_policy(dir.path(), "ingress", "1.0.0");
    manager.reload_policies().await.unwrap();

    // Old snapshots stay intact for readers that still hold them.
    assert_eq!(before.len(), 1);
    assert_eq!(registry.names(), vec!["egress", "ingress"]);
    assert_ne!(registry.version(), before.version());
    assert_eq!(registry.stats().rules, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_observe_a_partial_set() {
    let dir = TempDir::new().unwrap();
    for name in ["a", "b", "c"] {
        write_policy(dir.path(), name, "1.0.0");
    }
    let manager = PolicyManager::new(PolicyConfig::file(dir.path())).unwrap();
    manager.load_policies().await.unwrap();
    let registry = manager.registry();

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let registry = registry.clone();
            let done = done.clone();
            tokio::spawn(async move {
                let mut reads = 0u64;
                while !done.load(Ordering::Relaxed) {
                    let snapshot = registry.snapshot();
                    let versions: Vec<String> =
                        snapshot.all().iter().map(|p| p.version.clone()).collect();
                    assert_eq!(versions.len(), 3);
                    assert!(
                        versions.iter().all(|v| v == &versions[0]),
                        "mixed versions in one snapshot: {versions:?}"
                    );
                    reads += 1;
                    tokio::task::yield_now().await;
                }
                reads
            })
        })
        .collect();

    for round in 2..12 {
        let version = format!("{round}.0.0");
        for name in ["a", "b", "c"] {
            write_policy(dir.path(), name, &version);
        }
        manager.reload_policies().await.unwrap();
    }
    done.store(true, Ordering::Relaxed);

    for reader in readers {
        assert!(reader.await.unwrap() > 0);
    }
    assert_eq!(manager.get_policy("a").unwrap().version, "11.0.0");
}

#[tokio::test]
async fn config_from_toml_drives_the_manager() {
    let dir = TempDir::new().unwrap();
    write_policy(dir.path(), "egress", "not-semver");
    let toml = format!(
        "file_path = {:?}\n\n[validation]\nenabled = false\n",
        dir.path().display().to_string()
    );
    let config = PolicyConfig::from_toml(&toml).unwrap();

    let manager = PolicyManager::new(config).unwrap();
    manager.load_policies().await.unwrap();
    assert_eq!(manager.state(), ManagerState::Loaded);

    let health = manager.health();
    assert_eq!(health.policies, 1);
    assert!(health.last_error.is_none());
    let json = serde_json::to_value(&health).unwrap();
    assert_eq!(json["state"], "loaded");

    manager.close().await.unwrap();
    assert_eq!(manager.health().state, ManagerState::Closed);
}
