use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use spyglass_protocol::{Config, RtspConfig, SourceConfig};

use crate::error::Error;
use crate::registry::StreamRegistry;
use crate::rtsp::{ClientConfig, RtspClient, SourceHooks, SourceStats, masked_url};

/// Binds stream start/stop requests to ingest-client lifecycle.
///
/// Streams are long-lived fan-out buses created when a source is defined;
/// clients are replaceable producers. Starting an already-running stream
/// is a no-op, and stopping one leaves the stream (and its subscribers)
/// in place.
pub struct OnDemandController {
    streams: Arc<StreamRegistry>,
    defaults: RtspConfig,
    sources: BTreeMap<String, SourceConfig>,
    clients: Mutex<HashMap<String, Arc<RtspClient>>>,
}

impl OnDemandController {
    pub fn new(streams: Arc<StreamRegistry>, config: &Config) -> Self {
        Self {
            streams,
            defaults: config.rtsp.clone(),
            sources: config.sources.clone(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Start the ingest client for `stream_id` if it is not already
    /// running.
    pub async fn start(&self, stream_id: &str) -> Result<(), Error> {
        let stream = self.streams.get(stream_id)?;
        let source = self
            .sources
            .get(stream_id)
            .ok_or_else(|| Error::SourceNotConfigured(stream_id.to_string()))?;

        let mut clients = self.clients.lock().await;
        if clients.contains_key(stream_id) {
            debug!(%stream_id, "source already running");
            return Ok(());
        }

        let config = ClientConfig {
            url: source.url.clone(),
            transport: source.rtsp_transport.unwrap_or(self.defaults.transport),
            timeout: Duration::from_secs(self.defaults.timeout_secs),
            retry_count: self.defaults.retry_count,
            retry_delay: Duration::from_secs(self.defaults.retry_delay_secs),
        };

        let hooks = {
            let ingest = Arc::clone(&stream);
            let codec_sink = Arc::clone(&stream);
            let id = stream_id.to_string();
            SourceHooks {
                // Runs on the client's read task; the stream's ingress is
                // non-blocking so this never stalls the RTSP session.
                on_packet: Arc::new(move |pkt| {
                    if let Err(e) = ingest.write_packet(pkt) {
                        trace!("packet discarded: {e}");
                    }
                }),
                on_codec: Arc::new(move |codec| {
                    codec_sink.set_video_codec(codec);
                }),
                on_disconnect: Arc::new(move |err| {
                    debug!(stream_id = %id, "source disconnected: {err}");
                }),
            }
        };

        let client = Arc::new(RtspClient::new(config, hooks));
        client.start();
        info!(%stream_id, url = %masked_url(&source.url), "source started");
        clients.insert(stream_id.to_string(), client);
        Ok(())
    }

    /// Stop and release the ingest client, keeping the stream alive.
    pub async fn stop(&self, stream_id: &str) -> Result<(), Error> {
        self.streams.get(stream_id)?;
        let client = { self.clients.lock().await.remove(stream_id) };
        if let Some(client) = client {
            client.stop().await;
            info!(%stream_id, "source stopped");
        } else {
            debug!(%stream_id, "no running source to stop");
        }
        Ok(())
    }

    pub async fn is_running(&self, stream_id: &str) -> bool {
        self.clients.lock().await.contains_key(stream_id)
    }

    /// Ingest-side counters for a running client, if any.
    pub async fn source_stats(&self, stream_id: &str) -> Option<SourceStats> {
        let clients = self.clients.lock().await;
        clients.get(stream_id).map(|c| c.stats())
    }

    pub async fn stop_all(&self) {
        let clients: Vec<(String, Arc<RtspClient>)> =
            { self.clients.lock().await.drain().collect() };
        for (stream_id, client) in clients {
            client.stop().await;
            info!(%stream_id, "source stopped on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spyglass_protocol::MediaConfig;

    fn test_config() -> Config {
        let toml = r#"
            [rtsp]
            timeout_secs = 1
            retry_delay_secs = 1

            [sources.cam1]
            url = "rtsp://127.0.0.1:1/stream"

            [sources.cam2]
            url = "rtsp://127.0.0.1:1/other"
            sourceOnDemand = true
        "#;
        toml::from_str(toml).unwrap()
    }

    fn controller() -> (Arc<StreamRegistry>, OnDemandController) {
        let streams = Arc::new(StreamRegistry::new(&MediaConfig::default()));
        let controller = OnDemandController::new(Arc::clone(&streams), &test_config());
        (streams, controller)
    }

    #[tokio::test]
    async fn start_requires_known_stream() {
        let (_streams, controller) = controller();
        assert!(matches!(
            controller.start("cam1").await,
            Err(Error::StreamNotFound(_))
        ));
    }

    #[tokio::test]
    async fn start_requires_configured_source() {
        let (streams, controller) = controller();
        streams.create("adhoc", "adhoc").unwrap();
        assert!(matches!(
            controller.start("adhoc").await,
            Err(Error::SourceNotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_releases() {
        let (streams, controller) = controller();
        let stream = streams.create("cam1", "cam1").unwrap();

        controller.start("cam1").await.unwrap();
        assert!(controller.is_running("cam1").await);
        // Second start is a no-op.
        controller.start("cam1").await.unwrap();
        assert!(controller.source_stats("cam1").await.is_some());

        controller.stop("cam1").await.unwrap();
        assert!(!controller.is_running("cam1").await);
        assert!(controller.source_stats("cam1").await.is_none());
        // The stream object outlives its producer.
        assert!(!stream.is_closed());
        assert!(streams.get("cam1").is_ok());

        // Stopping again is harmless.
        controller.stop("cam1").await.unwrap();
    }

    #[tokio::test]
    async fn start_stop_start_ends_running() {
        let (streams, controller) = controller();
        streams.create("cam2", "cam2").unwrap();

        controller.start("cam2").await.unwrap();
        controller.stop("cam2").await.unwrap();
        controller.start("cam2").await.unwrap();
        assert!(controller.is_running("cam2").await);
        controller.stop_all().await;
        assert!(!controller.is_running("cam2").await);
    }
}
