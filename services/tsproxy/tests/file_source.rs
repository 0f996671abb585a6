mod harness;

use std::path::Path;
use std::time::Duration;

use harness::{free_port, owner, roundtrip, ProxyHandle, TcpEchoBackend};
use tokio::sync::watch;
use tsproxy::{FileSource, SyncReport};

fn proxy_doc(namespace: &str, name: &str, services: &[(&str, u16, u16)]) -> serde_json::Value {
    let services: Vec<serde_json::Value> = services
        .iter()
        .map(|(svc, port, expose)| {
            serde_json::json!({ "name": svc, "port": port, "exposeAs": expose })
        })
        .collect();
    serde_json::json!({ "namespace": namespace, "name": name, "services": services })
}

fn write_state(path: &Path, proxies: Vec<serde_json::Value>) {
    let doc = serde_json::json!({ "proxies": proxies });
    std::fs::write(path, serde_json::to_vec_pretty(&doc).unwrap()).unwrap();
}

#[tokio::test]
async fn file_changes_drive_the_manager() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("proxies.json");
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn();
    let (p1, p2) = (free_port().unwrap(), free_port().unwrap());

    write_state(&path, vec![proxy_doc("ns", "a", &[("backend1", backend.port(), p1)])]);
    let mut source = FileSource::new(&path, Duration::from_secs(1), proxy.manager.clone());

    let report = source.sync_once().await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(roundtrip(p1, b"file").await.unwrap(), b"file");

    // Unchanged file: nothing to do.
    assert_eq!(source.sync_once().await.unwrap(), SyncReport::default());

    write_state(
        &path,
        vec![
            proxy_doc("ns", "a", &[("backend1", backend.port(), p1)]),
            proxy_doc("ns", "b", &[("backend1", backend.port(), p2)]),
        ],
    );
    let report = source.sync_once().await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(proxy.manager.port_owner(p2), Some(owner("ns/b")));

    write_state(&path, vec![proxy_doc("ns", "b", &[("backend1", backend.port(), p2)])]);
    let report = source.sync_once().await.unwrap();
    assert_eq!(report.removed, 1);
    assert!(proxy.manager.port_available(p1));
    assert_eq!(proxy.manager.owners().await, vec![owner("ns/b")]);
}

#[tokio::test]
async fn port_handed_between_owners_in_one_sync() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("proxies.json");
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn();
    let (shared, other) = (free_port().unwrap(), free_port().unwrap());

    // "ns/z" holds the port first; "ns/a" sorts before it and takes it over.
    write_state(&path, vec![proxy_doc("ns", "z", &[("backend1", backend.port(), shared)])]);
    let mut source = FileSource::new(&path, Duration::from_secs(1), proxy.manager.clone());
    source.sync_once().await.unwrap();

    write_state(
        &path,
        vec![
            proxy_doc("ns", "a", &[("backend1", backend.port(), shared)]),
            proxy_doc("ns", "z", &[("backend1", backend.port(), other)]),
        ],
    );
    let report = source.sync_once().await.unwrap();

    assert_eq!(report.applied, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(proxy.manager.port_owner(shared), Some(owner("ns/a")));
    assert_eq!(proxy.manager.port_owner(other), Some(owner("ns/z")));
}

#[tokio::test]
async fn bad_file_keeps_current_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("proxies.json");
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn();
    let port = free_port().unwrap();

    write_state(&path, vec![proxy_doc("ns", "a", &[("backend1", backend.port(), port)])]);
    let mut source = FileSource::new(&path, Duration::from_secs(1), proxy.manager.clone());
    source.sync_once().await.unwrap();

    std::fs::write(&path, b"{ this is not json").unwrap();
    assert!(source.sync_once().await.is_err());
    assert_eq!(proxy.manager.port_owner(port), Some(owner("ns/a")));

    std::fs::remove_file(&path).unwrap();
    assert!(source.sync_once().await.is_err());
    assert!(!proxy.manager.port_available(port));
}

#[tokio::test]
async fn rejected_owner_does_not_block_others() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("proxies.json");
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn();
    let port = free_port().unwrap();

    write_state(
        &path,
        vec![
            proxy_doc("ns", "a", &[("backend1", backend.port(), port)]),
            proxy_doc("ns", "bad", &[("backend1", backend.port(), 0)]),
        ],
    );
    let mut source = FileSource::new(&path, Duration::from_secs(1), proxy.manager.clone());
    let report = source.sync_once().await.unwrap();

    assert_eq!(report.applied, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(proxy.manager.owners().await, vec![owner("ns/a")]);
}

#[tokio::test]
async fn toml_file_and_run_loop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("proxies.toml");
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn();
    let port = free_port().unwrap();

    std::fs::write(
        &path,
        format!(
            r#"
[[proxies]]
namespace = "ns"
name = "a"

[[proxies.services]]
name = "backend1"
port = {}
exposeAs = {}
"#,
            backend.port(),
            port
        ),
    )
    .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let source = FileSource::new(&path, Duration::from_millis(100), proxy.manager.clone());
    let handle = tokio::spawn(source.run(shutdown_rx));

    let manager = proxy.manager.clone();
    let mut bound = false;
    for _ in 0..100 {
        if !manager.port_available(port) {
            bound = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(bound);
    assert_eq!(roundtrip(port, b"toml").await.unwrap(), b"toml");

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
}
