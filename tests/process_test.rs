//! End-to-end tests against a real worklet child process.

use std::time::Duration;

use keet_worklet::host::{self, Supervisor, SupervisorOptions, Worklet, WorkletCommand};
use keet_worklet::{id_encoding, StartupArgs};

fn worklet_command(config_dir: &std::path::Path) -> WorkletCommand {
    WorkletCommand::new(env!("CARGO_BIN_EXE_keet-worklet"))
        .arg("worklet")
        .env("KEET_WORKLET_ENV", "test")
        .env("KEET_WORKLET_CONFIG_DIR", config_dir.display().to_string())
        .env(
            "KEET_WORKLET_LOG_FILE",
            config_dir.join("worklet.log").display().to_string(),
        )
}

#[tokio::test]
async fn test_child_worklet_serves_every_service() {
    let dir = tempfile::tempdir().unwrap();
    let storage = dir.path().join("storage");
    let args = StartupArgs::new(&format!("file://{}", storage.display()), "keet");

    let worklet = Worklet::start(
        &worklet_command(dir.path()),
        &args,
        Some(Duration::from_secs(10)),
    )
    .unwrap();
    assert!(worklet.id().is_some());
    let client = worklet.client();

    let identity = client.identity().await.unwrap();
    let stored = std::fs::read_to_string(storage.join("identity")).unwrap();
    let key = id_encoding::decode(stored.trim()).unwrap();
    assert_eq!(identity, id_encoding::encode(&key).unwrap());

    let mut statuses = client.network_status().unwrap();
    let status = tokio::time::timeout(Duration::from_secs(10), statuses.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(status.online);
    assert_eq!(status.dht_version, keet_worklet::backend::DHT_VERSION);
    statuses.close();

    assert_eq!(client.inspector_key().await.unwrap(), None);
    let key = client.inspector_enable().await.unwrap();
    assert_eq!(client.inspector_enable().await.unwrap(), key);
    client.inspector_disable().await.unwrap();
    assert_eq!(client.inspector_key().await.unwrap(), None);

    worklet.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_child_worklet_exits_when_host_closes() {
    let dir = tempfile::tempdir().unwrap();
    let args = StartupArgs::new(&dir.path().join("storage").display().to_string(), "experimental");

    let mut worklet = Worklet::start(&worklet_command(dir.path()), &args, None).unwrap();
    worklet.client().identity().await.unwrap();

    worklet.client().rpc().close();
    let status = tokio::time::timeout(Duration::from_secs(10), worklet.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(status.success(), "worklet exited with {status}");
}

#[tokio::test]
async fn test_supervisor_publishes_serving_worklet() {
    let dir = tempfile::tempdir().unwrap();
    let args = StartupArgs::new(&dir.path().join("storage").display().to_string(), "keet");
    let supervisor = Supervisor::new(worklet_command(dir.path()), args, SupervisorOptions::default());
    let shutdown = supervisor.shutdown_token();
    let run = tokio::spawn(supervisor.run());

    let client = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(client) = host::client() {
                break client;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    // Published only after answering, so the first call goes straight through.
    assert_eq!(client.inspector_key().await.unwrap(), None);
    client.identity().await.unwrap();

    shutdown.cancel();
    let restarts = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(restarts, 0);
    assert!(host::client().is_none());
}
