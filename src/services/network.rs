//! Network status stream.
//!
//! ```text
//! Unsubscribed ──subscribe──► AwaitingReady ──ready, still live──► Active
//!                                   │                                 │
//!                         cancelled while waiting               stream close
//!                                   ▼                                 ▼
//!                                Closed ◄───────── detach all three listeners
//! ```
//!
//! In `Active` the stream holds one listener on each of swarm `update`,
//! swarm `network-update` and DHT `nat-update`. Each event pushes a fresh
//! snapshot, and one snapshot is pushed on entry.

use std::sync::{Arc, Weak};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::backend::Swarm;
use crate::context::WorkletContext;
use crate::rpc::StreamSink;

/// Snapshot pushed on the network status stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    /// Announced host.
    pub host: String,
    /// Announced port.
    pub port: u16,
    /// Whether the swarm is online.
    pub online: bool,
    /// Open peer connections.
    pub peer_count: usize,
    /// DHT protocol version.
    pub dht_version: String,
}

impl NetworkStatus {
    /// Capture the current state of `swarm`.
    pub fn capture(swarm: &Swarm) -> Self {
        let snapshot = swarm.snapshot();
        Self {
            host: snapshot.host,
            port: snapshot.port,
            online: snapshot.online,
            peer_count: snapshot.peer_count,
            dht_version: swarm.dht.version().to_string(),
        }
    }
}

/// Serve one network status subscription.
pub(crate) async fn stream_status(ctx: Arc<WorkletContext>, sink: StreamSink<NetworkStatus>) -> Result<()> {
    ctx.ensure_ready().await?;

    // The subscriber may have gone away during the readiness await.
    if sink.is_destroying() {
        log::debug!("[Network] Stream {} closed before backend was ready", sink.id());
        return Ok(());
    }

    let swarm = ctx.backend().swarm();
    let push: Arc<dyn Fn() + Send + Sync> = {
        // Weak: the swarm owns these listeners.
        let swarm: Weak<Swarm> = Arc::downgrade(&swarm);
        let sink = sink.clone();
        Arc::new(move || {
            if let Some(swarm) = swarm.upgrade() {
                sink.write(&NetworkStatus::capture(&swarm));
            }
        })
    };
    let listener = |push: &Arc<dyn Fn() + Send + Sync>| {
        let push = Arc::clone(push);
        move |_: &()| push()
    };

    let update = swarm.update.on(listener(&push));
    let nat_update = swarm.dht.nat_update.on(listener(&push));
    let network_update = swarm.network_update.on(listener(&push));
    log::debug!("[Network] Stream {} active", sink.id());

    let detach = Arc::clone(&swarm);
    sink.on_close(move || {
        detach.update.off(update);
        detach.dht.nat_update.off(nat_update);
        detach.network_update.off(network_update);
        log::debug!("[Network] Listeners detached");
    });

    push();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_shape() {
        let swarm = Swarm::new("192.168.1.4", 49737);
        swarm.set_connections(3);
        swarm.set_online(true);

        let json = serde_json::to_value(NetworkStatus::capture(&swarm)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "host": "192.168.1.4",
                "port": 49737,
                "online": true,
                "peerCount": 3,
                "dhtVersion": crate::backend::DHT_VERSION,
            })
        );
    }
}
