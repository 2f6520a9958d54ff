use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use spyglass_protocol::{IceCandidate, SignalingMessage};

use crate::error::Error;
use crate::peer::detect_codec;
use crate::peers::PeerRegistry;
use crate::registry::StreamRegistry;
use crate::stream::PacketSink;

/// One viewer control connection.
///
/// Tracks which peer serves which stream on this connection and routes
/// offers, trickled candidates and teardown to it. When the transport
/// drops, `close` unwinds every peer the session created.
pub struct SignalingSession {
    id: Uuid,
    streams: Arc<StreamRegistry>,
    peers: Arc<PeerRegistry>,
    /// stream id → peer id currently serving it on this connection
    bindings: Mutex<HashMap<String, String>>,
}

impl SignalingSession {
    pub(crate) fn new(streams: Arc<StreamRegistry>, peers: Arc<PeerRegistry>) -> Self {
        let id = Uuid::new_v4();
        debug!(session_id = %id, "signaling session opened");
        Self {
            id,
            streams,
            peers,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Dispatch one parsed signaling message; returns the reply to send,
    /// if any.
    pub async fn handle_message(&self, msg: SignalingMessage) -> Option<SignalingMessage> {
        match msg {
            SignalingMessage::Offer { stream_id, sdp } => {
                Some(match self.handle_offer(&stream_id, &sdp).await {
                    Ok(sdp) => SignalingMessage::Answer { sdp },
                    Err(e) => {
                        warn!(session_id = %self.id, %stream_id, "offer failed: {e}");
                        SignalingMessage::Error {
                            message: error_code(&e),
                        }
                    }
                })
            }
            SignalingMessage::Ice {
                stream_id,
                candidate,
            } => match self.handle_ice(&stream_id, candidate).await {
                Ok(()) => None,
                Err(e) => {
                    debug!(session_id = %self.id, %stream_id, "ice candidate rejected: {e}");
                    Some(SignalingMessage::Error {
                        message: error_code(&e),
                    })
                }
            },
            SignalingMessage::Close { stream_id } => {
                match self.handle_close(&stream_id).await {
                    Ok(()) => None,
                    Err(e) => Some(SignalingMessage::Error {
                        message: error_code(&e),
                    }),
                }
            }
            other => {
                warn!(session_id = %self.id, ?other, "unexpected signaling message");
                None
            }
        }
    }

    /// Negotiate a viewer peer for `stream_id` and return the answer SDP.
    pub async fn handle_offer(&self, stream_id: &str, offer_sdp: &str) -> Result<String, Error> {
        let stream = self.streams.get(stream_id)?;
        let codec = detect_codec(offer_sdp);
        debug!(session_id = %self.id, %stream_id, %codec, "viewer offer");

        // A re-offer for a stream this session already views replaces the
        // previous peer (browser reconnect).
        let previous = { self.bindings.lock().await.remove(stream_id) };
        if let Some(old_id) = previous
            && let Ok(old) = self.peers.get(&old_id)
        {
            info!(session_id = %self.id, %stream_id, peer_id = %old_id, "replacing previous peer");
            old.close().await;
        }

        let peer = self.peers.create(stream_id, codec).await?;
        let answer = match peer.process_offer(offer_sdp).await {
            Ok(answer) => answer,
            Err(e) => {
                // The owner never saw this peer; discard it quietly.
                self.peers.remove(peer.id());
                peer.close().await;
                return Err(e);
            }
        };

        if let Err(e) = stream.subscribe(peer.id(), Arc::clone(&peer) as Arc<dyn PacketSink>) {
            self.peers.remove(peer.id());
            peer.close().await;
            return Err(e);
        }
        peer.bind_stream(Arc::clone(&stream));

        self.bindings
            .lock()
            .await
            .insert(stream_id.to_string(), peer.id().to_string());
        info!(
            session_id = %self.id,
            %stream_id,
            peer_id = %peer.id(),
            %codec,
            "viewer negotiated"
        );
        Ok(answer)
    }

    /// Forward a trickled candidate to the peer serving `stream_id`.
    pub async fn handle_ice(&self, stream_id: &str, candidate: IceCandidate) -> Result<(), Error> {
        let peer_id = {
            self.bindings
                .lock()
                .await
                .get(stream_id)
                .cloned()
                .ok_or_else(|| Error::StreamNotFound(stream_id.to_string()))?
        };
        let peer = self.peers.get(&peer_id)?;
        peer.add_ice_candidate(candidate).await
    }

    /// Explicit teardown of this session's peer for one stream.
    pub async fn handle_close(&self, stream_id: &str) -> Result<(), Error> {
        let peer_id = {
            self.bindings
                .lock()
                .await
                .remove(stream_id)
                .ok_or_else(|| Error::StreamNotFound(stream_id.to_string()))?
        };
        if let Ok(peer) = self.peers.get(&peer_id) {
            peer.close().await;
        }
        Ok(())
    }

    /// The transport dropped: close every peer negotiated through this
    /// session. Each close chain unsubscribes from the stream and reaches
    /// the owner's hook through the peer registry.
    pub async fn close(&self) {
        let bindings: Vec<(String, String)> =
            { self.bindings.lock().await.drain().collect() };
        for (stream_id, peer_id) in bindings {
            debug!(session_id = %self.id, %stream_id, %peer_id, "closing peer on session drop");
            if let Ok(peer) = self.peers.get(&peer_id) {
                peer.close().await;
            }
        }
        debug!(session_id = %self.id, "signaling session closed");
    }
}

/// Map control-path failures onto the wire error vocabulary.
fn error_code(err: &Error) -> String {
    match err {
        Error::StreamNotFound(_) | Error::InvalidStreamId => "streamNotFound".to_string(),
        Error::PeerLimitExceeded(_) => "peerLimitExceeded".to_string(),
        Error::PeerNotFound(_) => "peerNotFound".to_string(),
        _ => "negotiationFailed".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use webrtc::api::APIBuilder;
    use webrtc::api::interceptor_registry::register_default_interceptors;
    use webrtc::api::media_engine::MediaEngine;
    use webrtc::interceptor::registry::Registry;
    use webrtc::peer_connection::RTCPeerConnection;
    use webrtc::peer_connection::configuration::RTCConfiguration;
    use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
    use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
    use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;

    use spyglass_protocol::{MediaConfig, VideoCodec, WebRtcConfig};

    use crate::peer::register_video_codec;
    use crate::peers::OnPeerClosed;

    struct Harness {
        streams: Arc<StreamRegistry>,
        peers: Arc<PeerRegistry>,
        closed_peers: Arc<std::sync::Mutex<Vec<String>>>,
        hook_calls: Arc<AtomicU64>,
    }

    fn harness(max_peers: usize) -> Harness {
        let closed_peers = Arc::new(std::sync::Mutex::new(Vec::new()));
        let hook_calls = Arc::new(AtomicU64::new(0));
        let hook: OnPeerClosed = {
            let closed_peers = Arc::clone(&closed_peers);
            let hook_calls = Arc::clone(&hook_calls);
            Arc::new(move |peer_id| {
                closed_peers.lock().unwrap().push(peer_id);
                hook_calls.fetch_add(1, Ordering::Relaxed);
            })
        };
        let config = WebRtcConfig {
            ice_servers: Vec::new(),
            max_peers,
            ice_gather_timeout_secs: 2,
        };
        Harness {
            streams: Arc::new(StreamRegistry::new(&MediaConfig::default())),
            peers: PeerRegistry::new(&config, hook),
            closed_peers,
            hook_calls,
        }
    }

    fn session(h: &Harness) -> SignalingSession {
        SignalingSession::new(Arc::clone(&h.streams), Arc::clone(&h.peers))
    }

    /// Stand-in for the browser: a receive-only peer connection whose
    /// offer advertises the given codec.
    async fn browser_offer(codec: VideoCodec) -> (Arc<RTCPeerConnection>, String) {
        let mut media_engine = MediaEngine::default();
        register_video_codec(&mut media_engine, codec).unwrap();
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).unwrap();
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        );
        pc.add_transceiver_from_kind(
            RTPCodecType::Video,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await
        .unwrap();
        let offer = pc.create_offer(None).await.unwrap();
        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(offer).await.unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), gather_complete.recv()).await;
        let sdp = pc.local_description().await.unwrap().sdp;
        (pc, sdp)
    }

    async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for: {what}");
    }

    #[tokio::test]
    async fn offer_for_unknown_stream_is_rejected() {
        let h = harness(4);
        let session = session(&h);
        let err = session.handle_offer("ghost", "v=0").await.unwrap_err();
        assert!(matches!(err, Error::StreamNotFound(_)));
        assert_eq!(error_code(&err), "streamNotFound");
        assert_eq!(h.peers.count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn offer_negotiates_answer_and_subscribes() {
        let h = harness(4);
        let stream = h.streams.create("cam1", "cam1").unwrap();
        let session = session(&h);

        let (pc, offer_sdp) = browser_offer(VideoCodec::H264).await;
        let answer = session.handle_offer("cam1", &offer_sdp).await.unwrap();

        assert!(!answer.is_empty());
        assert!(answer.to_ascii_uppercase().contains("H264"));
        assert_eq!(stream.subscriber_count(), 1);
        assert_eq!(h.peers.count(), 1);

        session.close().await;
        wait_until("teardown chain completed", || {
            h.peers.count() == 0 && stream.subscriber_count() == 0
        })
        .await;
        assert_eq!(h.hook_calls.load(Ordering::Relaxed), 1);
        assert_eq!(h.closed_peers.lock().unwrap().len(), 1);
        pc.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn h265_offer_gets_h265_answer() {
        let h = harness(4);
        h.streams.create("cam1", "cam1").unwrap();
        let session = session(&h);

        let (pc, offer_sdp) = browser_offer(VideoCodec::H265).await;
        assert!(offer_sdp.to_ascii_uppercase().contains("H265"));
        let answer = session.handle_offer("cam1", &offer_sdp).await.unwrap();
        assert!(answer.to_ascii_uppercase().contains("H265"));

        session.close().await;
        pc.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn peer_limit_rejects_extra_viewer() {
        let h = harness(1);
        h.streams.create("cam1", "cam1").unwrap();
        let session = session(&h);

        let (pc, offer_sdp) = browser_offer(VideoCodec::H264).await;
        session.handle_offer("cam1", &offer_sdp).await.unwrap();

        // Same connection, different stream: the cap is global.
        h.streams.create("cam2", "cam2").unwrap();
        let (pc2, offer2) = browser_offer(VideoCodec::H264).await;
        let err = session.handle_offer("cam2", &offer2).await.unwrap_err();
        assert!(matches!(err, Error::PeerLimitExceeded(1)));
        assert_eq!(error_code(&err), "peerLimitExceeded");

        session.close().await;
        pc.close().await.unwrap();
        pc2.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reoffer_replaces_previous_peer() {
        let h = harness(4);
        let stream = h.streams.create("cam1", "cam1").unwrap();
        let session = session(&h);

        let (pc1, offer1) = browser_offer(VideoCodec::H264).await;
        session.handle_offer("cam1", &offer1).await.unwrap();
        let first_peer = h.bindings_snapshot(&session).await;

        let (pc2, offer2) = browser_offer(VideoCodec::H264).await;
        session.handle_offer("cam1", &offer2).await.unwrap();

        wait_until("old peer replaced", || h.peers.count() == 1).await;
        assert_eq!(stream.subscriber_count(), 1);
        let second_peer = h.bindings_snapshot(&session).await;
        assert_ne!(first_peer, second_peer);

        session.close().await;
        pc1.close().await.unwrap();
        pc2.close().await.unwrap();
    }

    #[tokio::test]
    async fn ice_before_offer_is_reported() {
        let h = harness(4);
        h.streams.create("cam1", "cam1").unwrap();
        let session = session(&h);
        let reply = session
            .handle_message(SignalingMessage::Ice {
                stream_id: "cam1".to_string(),
                candidate: IceCandidate {
                    candidate: "candidate:1 1 UDP 1 10.0.0.1 5000 typ host".to_string(),
                    sdp_mid: Some("0".to_string()),
                    sdp_mline_index: Some(0),
                },
            })
            .await;
        assert!(matches!(
            reply,
            Some(SignalingMessage::Error { message }) if message == "streamNotFound"
        ));
    }

    #[tokio::test]
    async fn close_without_binding_is_reported() {
        let h = harness(4);
        let session = session(&h);
        let reply = session
            .handle_message(SignalingMessage::Close {
                stream_id: "cam1".to_string(),
            })
            .await;
        assert!(matches!(reply, Some(SignalingMessage::Error { .. })));
    }

    impl Harness {
        async fn bindings_snapshot(&self, session: &SignalingSession) -> Vec<String> {
            session
                .bindings
                .lock()
                .await
                .values()
                .cloned()
                .collect()
        }
    }
}
