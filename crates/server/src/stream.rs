use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use webrtc::util::MarshalSize;

use spyglass_protocol::{StreamStats, VideoCodec};

use crate::error::Error;

/// RTP packet as it flows through the fan-out bus. Shared by reference
/// across subscribers; never mutated after ingress.
pub type RtpPacket = webrtc::rtp::packet::Packet;

/// Minimum spacing between ingress-overflow warnings per stream.
const DROP_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Sink side of a stream subscription, implemented by egress peers.
#[async_trait]
pub trait PacketSink: Send + Sync {
    /// Deliver one packet. Returning `Error::PeerNotReady` signals the
    /// benign window where the sink cannot accept media; any other error
    /// is logged and the packet is skipped.
    async fn on_packet(&self, pkt: &Arc<RtpPacket>) -> Result<(), Error>;
}

#[derive(Default)]
struct Counters {
    ingress_packets: AtomicU64,
    ingress_bytes: AtomicU64,
    delivered_packets: AtomicU64,
    delivered_bytes: AtomicU64,
    ingress_dropped: AtomicU64,
}

struct Subscriber {
    tx: mpsc::Sender<Arc<RtpPacket>>,
    token: CancellationToken,
    worker: JoinHandle<()>,
    /// Packets dropped because this subscriber's queue was full.
    dropped: Arc<AtomicU64>,
}

/// Emit at most one log line per interval.
struct LogThrottle {
    last: Mutex<Option<Instant>>,
    interval: Duration,
}

impl LogThrottle {
    fn new(interval: Duration) -> Self {
        Self {
            last: Mutex::new(None),
            interval,
        }
    }

    fn allow(&self) -> bool {
        let mut last = self.last.lock().unwrap();
        match *last {
            Some(at) if at.elapsed() < self.interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

/// Per-source fan-out bus.
///
/// One publisher writes packets in; a single distributor task replicates
/// each packet reference onto every subscriber's bounded queue; one worker
/// per subscriber drains that queue into the sink. A slow subscriber only
/// ever loses its own packets.
pub struct Stream {
    id: String,
    name: String,
    codec: RwLock<Option<VideoCodec>>,
    closed: RwLock<bool>,
    ingress: Mutex<VecDeque<Arc<RtpPacket>>>,
    ingress_capacity: usize,
    subscriber_capacity: usize,
    ingress_ready: Notify,
    subscribers: RwLock<HashMap<String, Subscriber>>,
    counters: Arc<Counters>,
    token: CancellationToken,
    drop_throttle: LogThrottle,
}

impl Stream {
    pub(crate) fn new(
        id: &str,
        name: &str,
        ingress_capacity: usize,
        subscriber_capacity: usize,
        token: CancellationToken,
    ) -> Arc<Self> {
        let stream = Arc::new(Self {
            id: id.to_string(),
            name: name.to_string(),
            codec: RwLock::new(None),
            closed: RwLock::new(false),
            ingress: Mutex::new(VecDeque::with_capacity(ingress_capacity)),
            ingress_capacity,
            subscriber_capacity,
            ingress_ready: Notify::new(),
            subscribers: RwLock::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
            token,
            drop_throttle: LogThrottle::new(DROP_LOG_INTERVAL),
        });
        tokio::spawn(Arc::clone(&stream).distribute());
        stream
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Accept one packet from the publisher. Non-blocking: a full ingress
    /// queue drops its oldest entry to make room (head-drop).
    pub fn write_packet(&self, pkt: Arc<RtpPacket>) -> Result<(), Error> {
        if *self.closed.read().unwrap() {
            return Err(Error::StreamClosed);
        }
        let size = pkt.marshal_size() as u64;
        let mut head_dropped = false;
        {
            let mut queue = self.ingress.lock().unwrap();
            if queue.len() >= self.ingress_capacity {
                queue.pop_front();
                head_dropped = true;
                // closed may have flipped while the queue was backed up
                if *self.closed.read().unwrap() {
                    return Err(Error::StreamClosed);
                }
            }
            queue.push_back(pkt);
        }
        if head_dropped {
            let dropped = self.counters.ingress_dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if self.drop_throttle.allow() {
                warn!(
                    stream_id = %self.id,
                    dropped,
                    capacity = self.ingress_capacity,
                    "ingress queue full, dropping oldest packet"
                );
            }
        }
        self.ingress_ready.notify_one();
        self.counters.ingress_packets.fetch_add(1, Ordering::Relaxed);
        self.counters.ingress_bytes.fetch_add(size, Ordering::Relaxed);
        Ok(())
    }

    /// Attach a subscriber and start its delivery worker.
    pub fn subscribe(&self, id: &str, sink: Arc<dyn PacketSink>) -> Result<(), Error> {
        if *self.closed.read().unwrap() {
            return Err(Error::StreamClosed);
        }
        let mut subs = self.subscribers.write().unwrap();
        if subs.contains_key(id) {
            return Err(Error::DuplicateSubscriber(id.to_string()));
        }
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        let token = self.token.child_token();
        let worker = tokio::spawn(deliver(
            self.id.clone(),
            id.to_string(),
            rx,
            sink,
            Arc::clone(&self.counters),
            token.clone(),
        ));
        subs.insert(
            id.to_string(),
            Subscriber {
                tx,
                token,
                worker,
                dropped: Arc::new(AtomicU64::new(0)),
            },
        );
        debug!(stream_id = %self.id, subscriber = %id, total = subs.len(), "subscriber attached");
        Ok(())
    }

    /// Detach a subscriber. After this returns its sink sees no further
    /// deliveries.
    pub async fn unsubscribe(&self, id: &str) -> Result<(), Error> {
        let sub = {
            self.subscribers
                .write()
                .unwrap()
                .remove(id)
                .ok_or_else(|| Error::UnknownSubscriber(id.to_string()))?
        };
        sub.token.cancel();
        drop(sub.tx);
        if sub.worker.await.is_err() {
            debug!(stream_id = %self.id, subscriber = %id, "delivery worker ended abnormally");
        }
        let dropped = sub.dropped.load(Ordering::Relaxed);
        debug!(stream_id = %self.id, subscriber = %id, dropped, "subscriber detached");
        Ok(())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap().len()
    }

    /// Lock-free counter snapshot; safe against concurrent ingress.
    pub fn stats(&self) -> StreamStats {
        StreamStats {
            ingress_packets: self.counters.ingress_packets.load(Ordering::Relaxed),
            ingress_bytes: self.counters.ingress_bytes.load(Ordering::Relaxed),
            delivered_packets: self.counters.delivered_packets.load(Ordering::Relaxed),
            delivered_bytes: self.counters.delivered_bytes.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
            codec: self.video_codec(),
        }
    }

    /// Packets discarded at ingress because the queue was full.
    pub fn ingress_dropped(&self) -> u64 {
        self.counters.ingress_dropped.load(Ordering::Relaxed)
    }

    /// Last writer wins; set when the codec is learned from the session
    /// description or the first packet.
    pub fn set_video_codec(&self, codec: VideoCodec) {
        *self.codec.write().unwrap() = Some(codec);
    }

    pub fn video_codec(&self) -> Option<VideoCodec> {
        *self.codec.read().unwrap()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.read().unwrap()
    }

    /// Tear the stream down: refuse further ingress, stop the distributor
    /// and every delivery worker, drop queued packets.
    pub(crate) fn close(&self) {
        {
            let mut closed = self.closed.write().unwrap();
            if *closed {
                return;
            }
            *closed = true;
        }
        self.token.cancel();
        let subs: Vec<(String, Subscriber)> =
            { self.subscribers.write().unwrap().drain().collect() };
        for (id, sub) in &subs {
            sub.token.cancel();
            trace!(stream_id = %self.id, subscriber = %id, "subscriber cancelled on close");
        }
        self.ingress.lock().unwrap().clear();
        debug!(
            stream_id = %self.id,
            subscribers = subs.len(),
            ingress_dropped = self.ingress_dropped(),
            "stream closed"
        );
    }

    /// Single consumer of the ingress queue. Snapshots the subscriber set
    /// under a read lock into a reused buffer, releases the lock, then
    /// pushes the packet reference to each subscriber without blocking.
    async fn distribute(self: Arc<Self>) {
        let mut fanout: Vec<(mpsc::Sender<Arc<RtpPacket>>, Arc<AtomicU64>)> = Vec::new();
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = self.ingress_ready.notified() => {}
            }
            loop {
                let Some(pkt) = self.ingress.lock().unwrap().pop_front() else {
                    break;
                };
                fanout.clear();
                {
                    let subs = self.subscribers.read().unwrap();
                    fanout.extend(
                        subs.values()
                            .map(|s| (s.tx.clone(), Arc::clone(&s.dropped))),
                    );
                }
                for (tx, dropped) in &fanout {
                    if tx.try_send(Arc::clone(&pkt)).is_err() {
                        // Slow or vanished subscriber; its loss only.
                        dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        trace!(stream_id = %self.id, "distributor stopped");
    }
}

/// Per-subscriber delivery loop: sole consumer of its queue.
async fn deliver(
    stream_id: String,
    subscriber_id: String,
    mut rx: mpsc::Receiver<Arc<RtpPacket>>,
    sink: Arc<dyn PacketSink>,
    counters: Arc<Counters>,
    token: CancellationToken,
) {
    loop {
        let pkt = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            pkt = rx.recv() => match pkt {
                Some(pkt) => pkt,
                None => break,
            },
        };
        match sink.on_packet(&pkt).await {
            Ok(()) => {
                counters.delivered_packets.fetch_add(1, Ordering::Relaxed);
                counters
                    .delivered_bytes
                    .fetch_add(pkt.marshal_size() as u64, Ordering::Relaxed);
            }
            Err(Error::PeerNotReady) => {
                debug!(%stream_id, subscriber = %subscriber_id, "subscriber not ready, packet skipped");
            }
            Err(e) => {
                warn!(%stream_id, subscriber = %subscriber_id, "packet delivery failed: {e}");
            }
        }
    }
    trace!(%stream_id, subscriber = %subscriber_id, "delivery worker stopped");
}
