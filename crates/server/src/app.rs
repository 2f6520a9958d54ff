use std::sync::Arc;

use tracing::info;

use spyglass_protocol::{Config, StreamStats};

use crate::controller::OnDemandController;
use crate::error::Error;
use crate::peers::{OnPeerClosed, PeerRegistry};
use crate::registry::StreamRegistry;
use crate::rtsp::SourceStats;
use crate::session::SignalingSession;
use crate::stream::Stream;

/// Process-lifecycle root: owns the registries and the on-demand
/// controller, and exposes the control surface the HTTP/WS layer calls.
///
/// Constructed once at startup with the owner's peer-close hook and
/// passed around as an `Arc`; nothing in the core is a global.
pub struct App {
    config: Config,
    streams: Arc<StreamRegistry>,
    peers: Arc<PeerRegistry>,
    controller: OnDemandController,
}

impl App {
    pub fn new(config: Config, on_peer_closed: OnPeerClosed) -> Arc<Self> {
        let streams = Arc::new(StreamRegistry::new(&config.media));
        let peers = PeerRegistry::new(&config.webrtc, on_peer_closed);
        let controller = OnDemandController::new(Arc::clone(&streams), &config);
        Arc::new(Self {
            config,
            streams,
            peers,
            controller,
        })
    }

    /// Create the stream object for every configured source and start the
    /// ingest clients for the non-lazy ones. On-demand sources get their
    /// stream up front so viewers can attach before the producer exists.
    pub async fn bootstrap(&self) -> Result<(), Error> {
        for (id, source) in &self.config.sources {
            self.streams.create(id, id)?;
            if source.source_on_demand {
                info!(stream_id = %id, "source registered (on demand)");
            } else {
                self.controller.start(id).await?;
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn streams(&self) -> &Arc<StreamRegistry> {
        &self.streams
    }

    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    pub fn create_stream(&self, id: &str, name: &str) -> Result<Arc<Stream>, Error> {
        self.streams.create(id, name)
    }

    /// Remove a stream and release its producer, unwinding all dependent
    /// state.
    pub async fn remove_stream(&self, id: &str) -> Result<(), Error> {
        let _ = self.controller.stop(id).await;
        self.streams.remove(id)
    }

    /// On-demand activation: bring up the ingest client for `id`.
    pub async fn start_stream(&self, id: &str) -> Result<(), Error> {
        self.controller.start(id).await
    }

    pub async fn stop_stream(&self, id: &str) -> Result<(), Error> {
        self.controller.stop(id).await
    }

    pub fn stream_stats(&self, id: &str) -> Result<StreamStats, Error> {
        Ok(self.streams.get(id)?.stats())
    }

    /// Ingest-side counters, present while the source client is running.
    pub async fn source_stats(&self, id: &str) -> Option<SourceStats> {
        self.controller.source_stats(id).await
    }

    /// Open a signaling session for one viewer control connection.
    pub fn open_session(&self) -> SignalingSession {
        SignalingSession::new(Arc::clone(&self.streams), Arc::clone(&self.peers))
    }

    /// Ordered teardown: producers first, then viewers, then the buses.
    pub async fn shutdown(&self) {
        self.controller.stop_all().await;
        self.peers.close_all().await;
        self.streams.close_all();
        info!("core shut down");
    }
}
