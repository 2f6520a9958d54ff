use std::fmt;

use serde::{Deserialize, Serialize};

/// Signaling messages exchanged between a viewer and the server.
///
/// The transport (WebSocket, HTTP POST, ...) is owned by the control
/// plane; these are the application-level shapes only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    /// WebRTC SDP offer from a viewer for one stream
    #[serde(rename_all = "camelCase")]
    Offer { stream_id: String, sdp: String },
    /// WebRTC SDP answer back to the viewer
    Answer { sdp: String },
    /// Trickle ICE candidate (optional; answers embed all candidates)
    #[serde(rename_all = "camelCase")]
    Ice {
        stream_id: String,
        candidate: IceCandidate,
    },
    /// Explicit viewer-initiated teardown for one stream
    #[serde(rename_all = "camelCase")]
    Close { stream_id: String },
    /// Error
    Error { message: String },
}

/// ICE candidate payload as browsers produce it from
/// `RTCPeerConnection.onicecandidate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none", default)]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub sdp_mline_index: Option<u16>,
}

/// Video codec carried by a stream and negotiated with viewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoCodec {
    H264,
    H265,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "H264",
            VideoCodec::H265 => "H265",
        }
    }

    /// MIME tag used for WebRTC codec registration and track capabilities.
    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "video/H264",
            VideoCodec::H265 => "video/H265",
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counter snapshot for one stream, as reported by the stats surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    pub ingress_packets: u64,
    pub ingress_bytes: u64,
    pub delivered_packets: u64,
    pub delivered_bytes: u64,
    pub subscribers: usize,
    pub codec: Option<VideoCodec>,
}
