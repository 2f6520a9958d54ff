use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, info};
use uuid::Uuid;

use spyglass_protocol::{VideoCodec, WebRtcConfig};

use crate::error::Error;
use crate::peer::WebRTCPeer;

/// Owner-supplied hook, invoked exactly once per closed peer, from a
/// spawned task so no registry or stream lock is held at call time.
pub type OnPeerClosed = Arc<dyn Fn(String) + Send + Sync>;

/// Process-wide map of peer identifier to viewer peer, enforcing the
/// peer cap.
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, Arc<WebRTCPeer>>>,
    /// Reserved slots, bumped before the (slow) peer construction so
    /// concurrent offers can never overshoot the cap.
    active: AtomicUsize,
    max_peers: usize,
    ice_servers: Vec<String>,
    ice_gather_timeout: Duration,
    on_peer_closed: OnPeerClosed,
}

impl PeerRegistry {
    pub fn new(config: &WebRtcConfig, on_peer_closed: OnPeerClosed) -> Arc<Self> {
        Arc::new(Self {
            peers: RwLock::new(HashMap::new()),
            active: AtomicUsize::new(0),
            max_peers: config.max_peers,
            ice_servers: config.ice_servers.clone(),
            ice_gather_timeout: Duration::from_secs(config.ice_gather_timeout_secs),
            on_peer_closed,
        })
    }

    /// Mint an identifier, build a peer for `stream_id` and wire its close
    /// chain. Fails with `PeerLimitExceeded` when the cap is reached.
    pub async fn create(
        self: &Arc<Self>,
        stream_id: &str,
        codec: VideoCodec,
    ) -> Result<Arc<WebRTCPeer>, Error> {
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_peers).then_some(n + 1)
            })
            .map_err(|_| Error::PeerLimitExceeded(self.max_peers))?;

        let id = Uuid::new_v4().to_string();
        let peer = match WebRTCPeer::new(
            &id,
            stream_id,
            codec,
            &self.ice_servers,
            self.ice_gather_timeout,
        )
        .await
        {
            Ok(peer) => peer,
            Err(e) => {
                self.active.fetch_sub(1, Ordering::SeqCst);
                return Err(e);
            }
        };

        let registry = Arc::downgrade(self);
        peer.set_close_hook(Box::new(move |peer_id| {
            let peer_id = peer_id.to_string();
            let registry = registry.clone();
            // Asynchronous by contract: the close body may run inside a
            // peer-connection callback or while a session lock is held.
            tokio::spawn(async move {
                if let Some(registry) = registry.upgrade() {
                    registry.finish_close(&peer_id);
                }
            });
        }));

        self.peers
            .write()
            .unwrap()
            .insert(id.clone(), Arc::clone(&peer));
        debug!(peer_id = %id, %stream_id, active = self.count(), "peer registered");
        Ok(peer)
    }

    pub fn get(&self, id: &str) -> Result<Arc<WebRTCPeer>, Error> {
        self.peers
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::PeerNotFound(id.to_string()))
    }

    /// Drop the entry and release its slot without notifying the owner.
    /// Used when negotiation fails before the owner ever saw the peer.
    pub fn remove(&self, id: &str) -> Option<Arc<WebRTCPeer>> {
        let removed = self.peers.write().unwrap().remove(id);
        if removed.is_some() {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn close_all(&self) {
        let peers: Vec<Arc<WebRTCPeer>> =
            { self.peers.read().unwrap().values().cloned().collect() };
        for peer in peers {
            peer.close().await;
        }
    }

    /// Tail of the close chain: runs off the closing call path. The owner
    /// hook fires only if the entry was still present, which makes it
    /// exactly-once across racing triggers.
    fn finish_close(&self, peer_id: &str) {
        if self.remove(peer_id).is_some() {
            info!(%peer_id, active = self.count(), "peer closed");
            (self.on_peer_closed)(peer_id.to_string());
        }
    }
}
