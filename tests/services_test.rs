//! Integration tests for the worklet services through a connected client.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use keet_worklet::backend::{Backend, Swarm};
use keet_worklet::host::connect_in_process;
use keet_worklet::services::crash::spawn_reported;
use keet_worklet::{id_encoding, Config, RpcError, StartupArgs, WorkletContext};
use tokio::sync::watch;

/// Backend whose readiness is released by the test.
struct GatedBackend {
    swarm: Arc<Swarm>,
    gate: watch::Sender<bool>,
    ready_calls: AtomicUsize,
    experimental: bool,
}

impl GatedBackend {
    fn new(experimental: bool) -> Arc<Self> {
        Arc::new(Self {
            swarm: Arc::new(Swarm::new("127.0.0.1", 49737)),
            gate: watch::Sender::new(false),
            ready_calls: AtomicUsize::new(0),
            experimental,
        })
    }

    fn open(&self, key: [u8; 32]) {
        self.swarm.set_public_key(key);
        self.gate.send_replace(true);
        self.swarm.set_online(true);
    }
}

#[async_trait]
impl Backend for GatedBackend {
    fn is_opened(&self) -> bool {
        *self.gate.borrow()
    }

    async fn ready(&self) -> Result<()> {
        self.ready_calls.fetch_add(1, Ordering::SeqCst);
        self.gate.subscribe().wait_for(|open| *open).await?;
        Ok(())
    }

    fn swarm(&self) -> Arc<Swarm> {
        Arc::clone(&self.swarm)
    }

    fn is_experimental(&self) -> bool {
        self.experimental
    }
}

async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn test_identity_awaits_readiness_then_resolves() {
    let backend = GatedBackend::new(false);
    let ctx = Arc::new(WorkletContext::new(Arc::<GatedBackend>::clone(&backend)));
    let (client, _server) = connect_in_process(&ctx);
    assert!(!backend.is_experimental());

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.identity().await }
    });

    eventually("identity handler to await readiness", || {
        backend.ready_calls.load(Ordering::SeqCst) == 1
    })
    .await;
    assert!(!pending.is_finished());

    let key = [7u8; 32];
    backend.open(key);

    let identity = within(pending).await.unwrap().unwrap();
    assert_eq!(identity, id_encoding::encode(&key).unwrap());

    // Once opened, later calls skip the barrier.
    within(client.identity()).await.unwrap();
    assert_eq!(backend.ready_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_readiness_timeout_is_relayed() {
    let backend = GatedBackend::new(false);
    let ctx = Arc::new(
        WorkletContext::new(backend).with_readiness_timeout(Duration::from_millis(30)),
    );
    let (client, _server) = connect_in_process(&ctx);

    match within(client.identity()).await {
        Err(RpcError::RemoteHandler(remote)) => {
            assert!(remote.message.contains("Backend not ready"), "{}", remote.message);
        }
        other => panic!("Expected relayed readiness timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_network_status_pushes_snapshots_on_each_event() {
    let backend = GatedBackend::new(false);
    backend.open([1; 32]);
    let ctx = Arc::new(WorkletContext::new(Arc::<GatedBackend>::clone(&backend)));
    let (client, _server) = connect_in_process(&ctx);

    let mut statuses = client.network_status().unwrap();
    let first = within(statuses.recv()).await.unwrap().unwrap();
    assert_eq!((first.host.as_str(), first.port), ("127.0.0.1", 49737));
    assert!(first.online);
    assert_eq!(first.peer_count, 0);
    assert_eq!(first.dht_version, keet_worklet::backend::DHT_VERSION);

    backend.swarm.set_connections(4);
    assert_eq!(within(statuses.recv()).await.unwrap().unwrap().peer_count, 4);

    backend.swarm.set_address("203.0.113.9", 5000);
    let moved = within(statuses.recv()).await.unwrap().unwrap();
    assert_eq!((moved.host.as_str(), moved.port), ("203.0.113.9", 5000));

    backend.swarm.set_online(false);
    assert!(!within(statuses.recv()).await.unwrap().unwrap().online);
}

#[tokio::test]
async fn test_network_status_listeners_are_symmetric() {
    let backend = GatedBackend::new(false);
    backend.open([1; 32]);
    let ctx = Arc::new(WorkletContext::new(Arc::<GatedBackend>::clone(&backend)));
    let (client, server) = connect_in_process(&ctx);

    assert_eq!(backend.swarm.listener_count(), 0);
    for _ in 0..10 {
        let mut statuses = client.network_status().unwrap();
        within(statuses.recv()).await.unwrap().unwrap();
        assert_eq!(backend.swarm.listener_count(), 3);

        statuses.close();
        eventually("listeners to detach", || backend.swarm.listener_count() == 0).await;
    }

    // Subscribe then immediately close.
    for _ in 0..10 {
        drop(client.network_status().unwrap());
    }
    eventually("served streams to drain", || server.served_streams() == 0).await;
    assert_eq!(backend.swarm.listener_count(), 0);
}

#[tokio::test]
async fn test_network_status_cancelled_during_readiness_attaches_nothing() {
    let backend = GatedBackend::new(false);
    let ctx = Arc::new(WorkletContext::new(Arc::<GatedBackend>::clone(&backend)));
    let (client, server) = connect_in_process(&ctx);

    let statuses = client.network_status().unwrap();
    eventually("handler to await readiness", || {
        backend.ready_calls.load(Ordering::SeqCst) == 1
    })
    .await;

    drop(statuses);
    eventually("served stream to close", || server.served_streams() == 0).await;

    backend.open([2; 32]);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(backend.swarm.listener_count(), 0);
    assert_eq!(backend.swarm.update.emit(&()), 0);
}

#[tokio::test]
async fn test_transport_loss_detaches_stream_listeners() {
    let backend = GatedBackend::new(false);
    backend.open([3; 32]);
    let ctx = Arc::new(WorkletContext::new(Arc::<GatedBackend>::clone(&backend)));
    let (client, server) = connect_in_process(&ctx);

    let mut statuses = client.network_status().unwrap();
    let mut crashes = client.crash_reports().unwrap();
    within(statuses.recv()).await.unwrap().unwrap();
    eventually("crash relay to attach", || ctx.process_events().listener_count() == 2).await;

    client.rpc().close();
    eventually("server to notice", || server.is_closed()).await;
    eventually("listeners to detach", || {
        backend.swarm.listener_count() == 0 && ctx.process_events().listener_count() == 0
    })
    .await;

    assert_eq!(within(crashes.recv()).await.unwrap().unwrap_err(), RpcError::TransportClosed);
}

#[tokio::test]
async fn test_inspector_enable_is_idempotent_over_rpc() {
    let backend = GatedBackend::new(false);
    let ctx = Arc::new(WorkletContext::new(backend));
    let (client, _server) = connect_in_process(&ctx);

    assert_eq!(within(client.inspector_key()).await.unwrap(), None);

    let first = within(client.inspector_enable()).await.unwrap();
    let second = within(client.inspector_enable()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(ctx.inspector().sessions_started(), 1);
    assert_eq!(within(client.inspector_key()).await.unwrap(), Some(first.clone()));

    within(client.inspector_disable()).await.unwrap();
    within(client.inspector_disable()).await.unwrap();
    assert_eq!(within(client.inspector_key()).await.unwrap(), None);

    let third = within(client.inspector_enable()).await.unwrap();
    assert_ne!(third, first);
    assert_eq!(ctx.inspector().sessions_started(), 2);
}

#[tokio::test]
async fn test_crash_relay_forwards_failures_and_detaches() {
    let backend = GatedBackend::new(false);
    let ctx = Arc::new(WorkletContext::new(backend));
    let (client, _server) = connect_in_process(&ctx);
    let events = Arc::clone(ctx.process_events());

    let mut crashes = client.crash_reports().unwrap();
    eventually("crash relay to attach", || events.listener_count() == 2).await;

    spawn_reported(Arc::clone(&events), "replication", async {
        Err::<(), _>(anyhow::anyhow!("core closed").context("replicating room"))
    });

    let report = within(crashes.recv()).await.unwrap().unwrap();
    assert_eq!(report.message, "task replication");
    assert!(report.stack.contains("core closed"), "{}", report.stack);

    crashes.close();
    eventually("crash relay to detach", || events.listener_count() == 0).await;
}

#[tokio::test]
async fn test_startup_args_reach_backend() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("file://{}", dir.path().join("storage").display());
    let args = StartupArgs::new(&url, "experimental");
    assert_eq!(args.storage_path, dir.path().join("storage"));

    let config = Config::default();
    let ctx = keet_worklet::worklet::build_context(
        &args,
        &config,
        Arc::new(keet_worklet::services::crash::ProcessEvents::new()),
    );
    assert!(ctx.backend().is_experimental());

    let (client, _server) = connect_in_process(&ctx);
    let identity = within(client.identity()).await.unwrap();

    let stored = std::fs::read_to_string(dir.path().join("storage/identity")).unwrap();
    let key = id_encoding::decode(&stored).unwrap();
    assert_eq!(identity, id_encoding::encode(&key).unwrap());
}
