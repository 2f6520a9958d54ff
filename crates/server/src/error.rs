use thiserror::Error;

/// Failure vocabulary of the streaming core.
///
/// Control-path callers (offer handling, stream lifecycle) receive these
/// intact; data-path call sites (packet writes, deliveries) downgrade them
/// to counters and log lines and never propagate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("stream already exists: {0}")]
    DuplicateStream(String),

    #[error("stream identifier must be a non-empty string")]
    InvalidStreamId,

    #[error("stream is closed")]
    StreamClosed,

    #[error("subscriber already attached: {0}")]
    DuplicateSubscriber(String),

    #[error("unknown subscriber: {0}")]
    UnknownSubscriber(String),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("peer limit reached ({0})")]
    PeerLimitExceeded(usize),

    /// Benign sentinel: the peer cannot accept media yet (ICE still
    /// connecting) or not anymore (closed). Never fatal at packet level.
    #[error("peer is not ready for media")]
    PeerNotReady,

    #[error("negotiation failed: {0}")]
    Negotiation(#[from] webrtc::Error),

    #[error("negotiation incomplete: local description missing")]
    NoLocalDescription,

    #[error("track write failed: {0}")]
    TrackWrite(webrtc::Error),

    #[error("no source configured for stream: {0}")]
    SourceNotConfigured(String),
}

pub type Result<T> = std::result::Result<T, Error>;
