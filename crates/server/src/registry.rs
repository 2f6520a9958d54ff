use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::info;

use spyglass_protocol::MediaConfig;

use crate::error::Error;
use crate::stream::Stream;

/// Process-wide map of stream identifier to fan-out bus.
///
/// The registry lock guards only the map itself; stream-internal work
/// (close, subscribe) always happens after the lock is released.
pub struct StreamRegistry {
    streams: RwLock<HashMap<String, Arc<Stream>>>,
    ingress_queue: usize,
    subscriber_queue: usize,
    /// Root of every stream's cancellation context.
    root: CancellationToken,
}

impl StreamRegistry {
    pub fn new(media: &MediaConfig) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            ingress_queue: media.ingress_queue,
            subscriber_queue: media.subscriber_queue,
            root: CancellationToken::new(),
        }
    }

    pub fn create(&self, id: &str, name: &str) -> Result<Arc<Stream>, Error> {
        if id.trim().is_empty() {
            return Err(Error::InvalidStreamId);
        }
        let stream = {
            let mut streams = self.streams.write().unwrap();
            if streams.contains_key(id) {
                return Err(Error::DuplicateStream(id.to_string()));
            }
            let stream = Stream::new(
                id,
                name,
                self.ingress_queue,
                self.subscriber_queue,
                self.root.child_token(),
            );
            streams.insert(id.to_string(), Arc::clone(&stream));
            stream
        };
        info!(stream_id = %id, %name, "stream created");
        Ok(stream)
    }

    pub fn get(&self, id: &str) -> Result<Arc<Stream>, Error> {
        self.streams
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::StreamNotFound(id.to_string()))
    }

    /// Drop the entry and tear the stream down. The identifier becomes
    /// available for re-use immediately.
    pub fn remove(&self, id: &str) -> Result<(), Error> {
        let stream = {
            self.streams
                .write()
                .unwrap()
                .remove(id)
                .ok_or_else(|| Error::StreamNotFound(id.to_string()))?
        };
        stream.close();
        info!(stream_id = %id, "stream removed");
        Ok(())
    }

    /// Snapshot copy of all current streams.
    pub fn list(&self) -> Vec<Arc<Stream>> {
        self.streams.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.streams.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.read().unwrap().is_empty()
    }

    pub fn close_all(&self) {
        let streams: Vec<(String, Arc<Stream>)> =
            { self.streams.write().unwrap().drain().collect() };
        self.root.cancel();
        for (id, stream) in streams {
            stream.close();
            info!(stream_id = %id, "stream closed on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> StreamRegistry {
        StreamRegistry::new(&MediaConfig::default())
    }

    #[tokio::test]
    async fn create_get_remove() {
        let registry = registry();
        let stream = registry.create("cam1", "Front door").unwrap();
        assert_eq!(stream.id(), "cam1");
        assert_eq!(stream.name(), "Front door");
        assert_eq!(registry.get("cam1").unwrap().id(), "cam1");
        registry.remove("cam1").unwrap();
        assert!(matches!(
            registry.get("cam1"),
            Err(Error::StreamNotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_create_rejected() {
        let registry = registry();
        registry.create("cam1", "a").unwrap();
        assert!(matches!(
            registry.create("cam1", "b"),
            Err(Error::DuplicateStream(_))
        ));
    }

    #[tokio::test]
    async fn empty_id_rejected() {
        let registry = registry();
        assert!(matches!(registry.create("", "x"), Err(Error::InvalidStreamId)));
        assert!(matches!(
            registry.create("   ", "x"),
            Err(Error::InvalidStreamId)
        ));
    }

    #[tokio::test]
    async fn id_reusable_after_remove() {
        let registry = registry();
        registry.create("cam1", "a").unwrap();
        registry.remove("cam1").unwrap();
        registry.create("cam1", "b").unwrap();
        assert_eq!(registry.get("cam1").unwrap().name(), "b");
    }

    #[tokio::test]
    async fn removed_stream_is_closed() {
        let registry = registry();
        let stream = registry.create("cam1", "a").unwrap();
        registry.remove("cam1").unwrap();
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn remove_unknown_rejected() {
        let registry = registry();
        assert!(matches!(
            registry.remove("ghost"),
            Err(Error::StreamNotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_and_close_all() {
        let registry = registry();
        registry.create("cam1", "a").unwrap();
        registry.create("cam2", "b").unwrap();
        assert_eq!(registry.list().len(), 2);
        assert_eq!(registry.len(), 2);
        let streams = registry.list();
        registry.close_all();
        assert!(registry.is_empty());
        assert!(streams.iter().all(|s| s.is_closed()));
    }
}
