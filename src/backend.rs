//! Backend service handle owned by the worklet.
//!
//! The real peer-to-peer backend is an external collaborator; the worklet
//! talks to it only through the [`Backend`] trait. [`LocalBackend`] is the
//! built-in implementation: it owns the storage directory, the persisted
//! identity key, and a [`Swarm`] whose state changes raise update events.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use data_encoding::HEXLOWER;
use tokio::sync::OnceCell;

use crate::events::Emitter;
use crate::rpc::lock;

/// DHT protocol version reported in network status snapshots.
pub const DHT_VERSION: &str = "6.20.5";

/// File under the storage directory holding the hex-encoded public key.
pub const IDENTITY_FILE: &str = "identity";

/// Domain backend as seen by the worklet services.
#[async_trait]
pub trait Backend: Send + Sync {
    /// True once [`Backend::ready`] has completed. Cheap, synchronous.
    fn is_opened(&self) -> bool;

    /// One-time readiness barrier. Later calls return immediately.
    async fn ready(&self) -> Result<()>;

    /// Network handle.
    fn swarm(&self) -> Arc<Swarm>;

    /// Whether the backend was started in experimental mode.
    fn is_experimental(&self) -> bool;
}

/// Backend readiness did not complete within the configured bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessTimeout {
    /// How long the caller waited.
    pub waited: Duration,
}

impl fmt::Display for ReadinessTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Backend not ready after {:?}", self.waited)
    }
}

impl std::error::Error for ReadinessTimeout {}

/// Point-in-time view of the swarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmSnapshot {
    /// Announced host.
    pub host: String,
    /// Announced port.
    pub port: u16,
    /// Whether the swarm considers itself online.
    pub online: bool,
    /// Number of open peer connections.
    pub peer_count: usize,
}

#[derive(Debug, Default)]
struct SwarmState {
    host: String,
    port: u16,
    online: bool,
    connections: usize,
    public_key: Option<[u8; 32]>,
}

/// DHT node attached to the swarm.
#[derive(Debug)]
pub struct Dht {
    version: String,
    /// Raised when NAT classification or the public address changes.
    pub nat_update: Emitter<()>,
}

impl Dht {
    /// DHT protocol version.
    pub fn version(&self) -> &str {
        &self.version
    }
}

/// Network handle of the backend.
///
/// Mutated only inside the worklet. Each setter raises the matching event
/// after the state change is visible to [`Swarm::snapshot`].
#[derive(Debug)]
pub struct Swarm {
    state: Mutex<SwarmState>,
    /// Raised when the connection set changes.
    pub update: Emitter<()>,
    /// Raised when the online state changes.
    pub network_update: Emitter<()>,
    /// DHT node.
    pub dht: Dht,
}

impl Swarm {
    /// Offline swarm announcing `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            state: Mutex::new(SwarmState {
                host: host.into(),
                port,
                ..SwarmState::default()
            }),
            update: Emitter::new("update"),
            network_update: Emitter::new("network-update"),
            dht: Dht {
                version: DHT_VERSION.to_string(),
                nat_update: Emitter::new("nat-update"),
            },
        }
    }

    /// Current state.
    pub fn snapshot(&self) -> SwarmSnapshot {
        let state = lock(&self.state);
        SwarmSnapshot {
            host: state.host.clone(),
            port: state.port,
            online: state.online,
            peer_count: state.connections,
        }
    }

    /// Public key, once the backend has loaded its identity.
    pub fn public_key(&self) -> Option<[u8; 32]> {
        lock(&self.state).public_key
    }

    /// Set the public key.
    pub fn set_public_key(&self, key: [u8; 32]) {
        lock(&self.state).public_key = Some(key);
    }

    /// Change the online state and raise `network-update`.
    pub fn set_online(&self, online: bool) {
        lock(&self.state).online = online;
        self.network_update.emit(&());
    }

    /// Change the announced address and raise the DHT `nat-update`.
    pub fn set_address(&self, host: impl Into<String>, port: u16) {
        {
            let mut state = lock(&self.state);
            state.host = host.into();
            state.port = port;
        }
        self.dht.nat_update.emit(&());
    }

    /// Change the connection count and raise `update`.
    pub fn set_connections(&self, connections: usize) {
        lock(&self.state).connections = connections;
        self.update.emit(&());
    }

    /// Total listeners across all swarm and DHT events.
    pub fn listener_count(&self) -> usize {
        self.update.listener_count()
            + self.network_update.listener_count()
            + self.dht.nat_update.listener_count()
    }
}

/// Options for [`LocalBackend`].
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Experimental feature set.
    pub experimental: bool,
    /// Running on a mobile host.
    pub mobile: bool,
    /// Address announced by the swarm.
    pub swarm_host: String,
    /// Port announced by the swarm.
    pub swarm_port: u16,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            experimental: false,
            mobile: true,
            swarm_host: "0.0.0.0".to_string(),
            swarm_port: 0,
        }
    }
}

/// Built-in backend rooted at a storage directory.
#[derive(Debug)]
pub struct LocalBackend {
    storage: PathBuf,
    options: BackendOptions,
    swarm: Arc<Swarm>,
    opened: AtomicBool,
    ready: OnceCell<()>,
}

impl LocalBackend {
    /// Construct without touching the filesystem. Call [`Backend::ready`]
    /// to open.
    pub fn new(storage: impl Into<PathBuf>, options: BackendOptions) -> Self {
        let swarm = Arc::new(Swarm::new(options.swarm_host.clone(), options.swarm_port));
        Self {
            storage: storage.into(),
            options,
            swarm,
            opened: AtomicBool::new(false),
            ready: OnceCell::new(),
        }
    }

    async fn open(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.storage)
            .await
            .with_context(|| format!("Failed to create storage dir {}", self.storage.display()))?;

        let key = load_or_create_identity(&self.storage.join(IDENTITY_FILE)).await?;
        self.swarm.set_public_key(key);
        self.opened.store(true, Ordering::Release);
        self.swarm.set_online(true);

        log::info!(
            "[Backend] Opened {} (experimental: {}, mobile: {})",
            self.storage.display(),
            self.options.experimental,
            self.options.mobile
        );
        Ok(())
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn is_opened(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    async fn ready(&self) -> Result<()> {
        self.ready.get_or_try_init(|| self.open()).await?;
        Ok(())
    }

    fn swarm(&self) -> Arc<Swarm> {
        Arc::clone(&self.swarm)
    }

    fn is_experimental(&self) -> bool {
        self.options.experimental
    }
}

/// Load the 32-byte public key at `path`, creating it on first run.
async fn load_or_create_identity(path: &Path) -> Result<[u8; 32]> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let bytes = HEXLOWER
                .decode(contents.trim().as_bytes())
                .with_context(|| format!("Identity file {} is not hex", path.display()))?;
            let Ok(key) = <[u8; 32]>::try_from(bytes.as_slice()) else {
                bail!("Identity file {} holds {} bytes, expected 32", path.display(), bytes.len());
            };
            Ok(key)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let key: [u8; 32] = rand::random();
            tokio::fs::write(path, HEXLOWER.encode(&key))
                .await
                .with_context(|| format!("Failed to write identity {}", path.display()))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
            }

            log::info!("[Backend] Created new identity at {}", path.display());
            Ok(key)
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read identity {}", path.display())),
    }
}
