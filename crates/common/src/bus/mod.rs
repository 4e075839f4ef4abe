//! Invalidation bus
//!
//! Mounts sharing one backend tell each other when an inode changed. The bus
//! owns only the event contract and the local admission rules; delivery is
//! delegated to an [`InvalidationTransport`] (a message system, or the
//! in-process [`LocalHub`]).
//!
//! # Admission
//!
//! The transport only promises at-least-once delivery, so [`InvalidationBus`]
//! filters what it hands to the mount:
//!
//! - events published by this mount are dropped
//! - events older than the configured TTL are dropped
//! - an `(inode, kind, version)` already admitted within the TTL is dropped
//!
//! Whether an admitted event is newer than local state is decided by the
//! receiving mount by comparing version tokens.

mod event;
mod hub;
mod outbox;

pub use event::{EventKind, InvalidationEvent};
pub use hub::LocalHub;
pub use outbox::Outbox;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use moka::sync::Cache;
use tracing::debug;

use crate::error::Result;
use crate::types::{InodeId, MountId, Version};

/// Pub/sub channel carrying invalidation events between mounts.
#[async_trait]
pub trait InvalidationTransport: std::fmt::Debug + Send + Sync {
    async fn publish(&self, event: InvalidationEvent) -> Result<()>;

    /// Infinite stream of every event published after this call.
    fn subscribe(&self) -> BoxStream<'static, InvalidationEvent>;
}

const SEEN_CAPACITY: u64 = 100_000;

/// One mount's view of the invalidation channel.
#[derive(Debug, Clone)]
pub struct InvalidationBus {
    mount: MountId,
    transport: Arc<dyn InvalidationTransport>,
    ttl: Duration,
    seen: Cache<(InodeId, EventKind, Version), ()>,
}

impl InvalidationBus {
    pub fn new(mount: MountId, transport: Arc<dyn InvalidationTransport>, ttl: Duration) -> Self {
        Self {
            mount,
            transport,
            ttl,
            seen: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(SEEN_CAPACITY)
                .build(),
        }
    }

    pub async fn publish(&self, event: InvalidationEvent) -> Result<()> {
        debug!(
            inode = %event.inode,
            kind = ?event.kind,
            version = event.version,
            "publishing invalidation"
        );
        self.transport.publish(event).await
    }

    /// Admitted events from other mounts.
    pub fn subscribe(&self) -> BoxStream<'static, InvalidationEvent> {
        let bus = self.clone();
        self.transport
            .subscribe()
            .filter(move |event| futures::future::ready(bus.admit(event)))
            .boxed()
    }

    /// Whether `event` should reach the local mount.
    pub fn admit(&self, event: &InvalidationEvent) -> bool {
        if event.origin == self.mount {
            return false;
        }
        let age = Utc::now().signed_duration_since(event.emitted_at);
        if age.to_std().map(|age| age > self.ttl).unwrap_or(false) {
            debug!(inode = %event.inode, version = event.version, "dropping expired invalidation");
            return false;
        }
        let key = (event.inode, event.kind, event.version);
        if self.seen.contains_key(&key) {
            debug!(inode = %event.inode, version = event.version, "dropping duplicate invalidation");
            return false;
        }
        self.seen.insert(key, ());
        true
    }

    pub fn mount(&self) -> MountId {
        self.mount
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;

    fn bus() -> (InvalidationBus, LocalHub) {
        let hub = LocalHub::new();
        let bus = InvalidationBus::new(
            MountId::new(),
            Arc::new(hub.clone()),
            Duration::from_secs(60),
        );
        (bus, hub)
    }

    #[test]
    fn test_admit_drops_own_duplicate_and_expired() {
        let (bus, _hub) = bus();
        let peer = MountId::new();

        let own = InvalidationEvent::new(InodeId(5), EventKind::DataChanged, 2, bus.mount());
        assert!(!bus.admit(&own));

        let event = InvalidationEvent::new(InodeId(5), EventKind::DataChanged, 2, peer);
        assert!(bus.admit(&event));
        assert!(!bus.admit(&event.clone()));

        let newer = InvalidationEvent::new(InodeId(5), EventKind::DataChanged, 3, peer);
        assert!(bus.admit(&newer));

        let mut stale = InvalidationEvent::new(InodeId(6), EventKind::Deleted, 1, peer);
        stale.emitted_at = Utc::now() - ChronoDuration::seconds(120);
        assert!(!bus.admit(&stale));
    }

    #[tokio::test]
    async fn test_subscribers_receive_peer_events_once() {
        let hub = LocalHub::new();
        let a = InvalidationBus::new(MountId::new(), Arc::new(hub.clone()), Duration::from_secs(60));
        let b = InvalidationBus::new(MountId::new(), Arc::new(hub.clone()), Duration::from_secs(60));
        let mut a_events = a.subscribe();
        let mut b_events = b.subscribe();

        let event = InvalidationEvent::new(InodeId(9), EventKind::MetadataChanged, 4, a.mount());
        a.publish(event.clone()).await.unwrap();
        a.publish(event.clone()).await.unwrap();
        let marker = InvalidationEvent::new(InodeId(9), EventKind::MetadataChanged, 5, a.mount());
        a.publish(marker.clone()).await.unwrap();

        assert_eq!(b_events.next().await.unwrap(), event);
        assert_eq!(b_events.next().await.unwrap(), marker);

        // a never sees its own events
        let peer = InvalidationEvent::new(InodeId(1), EventKind::DataChanged, 1, b.mount());
        b.publish(peer.clone()).await.unwrap();
        assert_eq!(a_events.next().await.unwrap(), peer);
        assert_eq!(hub.subscriber_count(), 2);
    }
}
