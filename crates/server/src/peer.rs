use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MediaEngine};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use spyglass_protocol::{IceCandidate, VideoCodec};

use crate::error::Error;
use crate::stream::{PacketSink, RtpPacket, Stream};

/// MIME type for H265/HEVC video (the media engine ships no constant).
const MIME_TYPE_H265: &str = "video/H265";

/// Invoked after a peer's close body has run; the registry uses it to
/// drop its entry and notify the owner off the closing call path.
pub(crate) type CloseHook = Box<dyn Fn(&str) + Send + Sync>;

/// Pick the video codec for a viewer from its offer SDP.
///
/// Deliberately permissive substring matching: browsers differ in how
/// they spell the rtpmap (H265 vs HEVC, H264 vs AVC). H.265 is preferred
/// when both are present and is the default when neither is.
pub fn detect_codec(offer_sdp: &str) -> VideoCodec {
    let sdp = offer_sdp.to_ascii_uppercase();
    if sdp.contains("H265") || sdp.contains("HEVC") {
        return VideoCodec::H265;
    }
    if sdp.contains("H264") || sdp.contains("AVC") {
        return VideoCodec::H264;
    }
    VideoCodec::H265
}

/// One viewer: a peer connection with a single outbound video track,
/// subscribed to exactly one stream.
pub struct WebRTCPeer {
    id: String,
    stream_id: String,
    codec: VideoCodec,
    pc: Arc<RTCPeerConnection>,
    track: Arc<TrackLocalStaticRTP>,
    /// Set when the session subscribes this peer to its stream.
    stream: Mutex<Option<Arc<Stream>>>,
    /// Close-once latch: the close body runs exactly once no matter how
    /// many trigger paths fire (explicit close, ICE failure, state change).
    closed: AtomicBool,
    close_hook: OnceLock<CloseHook>,
    ice_gather_timeout: Duration,
}

impl std::fmt::Debug for WebRTCPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRTCPeer")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("codec", &self.codec)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl WebRTCPeer {
    pub(crate) async fn new(
        id: &str,
        stream_id: &str,
        codec: VideoCodec,
        ice_servers: &[String],
        ice_gather_timeout: Duration,
    ) -> Result<Arc<Self>, Error> {
        // Register ONLY the selected codec. Offering the full default set
        // lets browsers negotiate a codec the camera never produces.
        let mut media_engine = MediaEngine::default();
        register_video_codec(&mut media_engine, codec)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_ice_servers = if ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);

        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: codec.mime_type().to_string(),
                clock_rate: 90000,
                sdp_fmtp_line: codec_fmtp(codec).to_string(),
                ..Default::default()
            },
            "video".to_string(),
            format!("spyglass-{stream_id}"),
        ));
        pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let peer = Arc::new(Self {
            id: id.to_string(),
            stream_id: stream_id.to_string(),
            codec,
            pc,
            track,
            stream: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_hook: OnceLock::new(),
            ice_gather_timeout,
        });
        peer.install_state_hooks();
        info!(peer_id = %peer.id, stream_id = %peer.stream_id, codec = %codec, "peer created");
        Ok(peer)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    pub(crate) fn set_close_hook(&self, hook: CloseHook) {
        let _ = self.close_hook.set(hook);
    }

    /// Remember the stream this peer is subscribed to so teardown can
    /// unwind the subscription.
    pub(crate) fn bind_stream(&self, stream: Arc<Stream>) {
        *self.stream.lock().unwrap() = Some(stream);
    }

    /// ICE failure and transport-level close both end the peer. The
    /// callbacks hold a weak reference: the peer connection must not keep
    /// its owner alive, and close() may already be running.
    fn install_state_hooks(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.pc
            .on_ice_connection_state_change(Box::new(move |state| {
                let weak = weak.clone();
                Box::pin(async move {
                    if matches!(
                        state,
                        RTCIceConnectionState::Failed | RTCIceConnectionState::Closed
                    ) && let Some(peer) = weak.upgrade()
                    {
                        warn!(peer_id = %peer.id, ?state, "ICE terminal state, closing peer");
                        tokio::spawn(async move { peer.close().await });
                    }
                })
            }));

        let weak = Arc::downgrade(self);
        self.pc
            .on_peer_connection_state_change(Box::new(move |state| {
                let weak = weak.clone();
                Box::pin(async move {
                    match state {
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                            if let Some(peer) = weak.upgrade() {
                                debug!(peer_id = %peer.id, ?state, "peer connection ended");
                                tokio::spawn(async move { peer.close().await });
                            }
                        }
                        _ => debug!(?state, "peer connection state changed"),
                    }
                })
            }));
    }

    /// Run the offer/answer exchange and return the answer SDP with all
    /// gathered ICE candidates embedded (non-trickle).
    pub async fn process_offer(&self, offer_sdp: &str) -> Result<String, Error> {
        let offer = RTCSessionDescription::offer(offer_sdp.to_string())?;
        self.pc.set_remote_description(offer).await?;

        let answer = self.pc.create_answer(None).await?;
        let mut gather_complete = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(answer).await?;

        if tokio::time::timeout(self.ice_gather_timeout, gather_complete.recv())
            .await
            .is_err()
        {
            debug!(
                peer_id = %self.id,
                "ICE gathering incomplete after timeout, answering with partial candidates"
            );
        }

        let local = self
            .pc
            .local_description()
            .await
            .ok_or(Error::NoLocalDescription)?;
        Ok(local.sdp)
    }

    /// Apply a trickled remote candidate (optional in non-trickle mode).
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), Error> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.pc.connection_state() == RTCPeerConnectionState::Connected
    }

    /// Tear the peer down. Safe to call from any number of paths; the
    /// body executes once: unsubscribe from the stream, close the peer
    /// connection, then let the registry finish up asynchronously.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(peer_id = %self.id, stream_id = %self.stream_id, "closing peer");

        let stream = self.stream.lock().unwrap().take();
        if let Some(stream) = stream
            && let Err(e) = stream.unsubscribe(&self.id).await
        {
            debug!(peer_id = %self.id, "unsubscribe during close: {e}");
        }

        if let Err(e) = self.pc.close().await {
            debug!(peer_id = %self.id, "peer connection close failed: {e}");
        }

        if let Some(hook) = self.close_hook.get() {
            hook(&self.id);
        }
    }
}

#[async_trait]
impl PacketSink for WebRTCPeer {
    async fn on_packet(&self, pkt: &Arc<RtpPacket>) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PeerNotReady);
        }
        if self.pc.connection_state() != RTCPeerConnectionState::Connected {
            return Err(Error::PeerNotReady);
        }
        // write_rtp rebinds SSRC and payload type to the negotiated track,
        // leaving the shared packet untouched.
        self.track
            .write_rtp(pkt.as_ref())
            .await
            .map_err(Error::TrackWrite)?;
        Ok(())
    }
}

fn codec_fmtp(codec: VideoCodec) -> &'static str {
    match codec {
        VideoCodec::H264 => "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
        VideoCodec::H265 => "",
    }
}

pub(crate) fn register_video_codec(
    media_engine: &mut MediaEngine,
    codec: VideoCodec,
) -> Result<(), webrtc::Error> {
    let feedback = vec![
        RTCPFeedback {
            typ: "goog-remb".to_owned(),
            parameter: "".to_owned(),
        },
        RTCPFeedback {
            typ: "ccm".to_owned(),
            parameter: "fir".to_owned(),
        },
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: "".to_owned(),
        },
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: "pli".to_owned(),
        },
    ];
    let (mime_type, payload_type) = match codec {
        VideoCodec::H264 => (MIME_TYPE_H264.to_string(), 102),
        VideoCodec::H265 => (MIME_TYPE_H265.to_string(), 96),
    };
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type,
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: codec_fmtp(codec).to_string(),
                rtcp_feedback: feedback,
            },
            payload_type,
            ..Default::default()
        },
        RTPCodecType::Video,
    )
}
