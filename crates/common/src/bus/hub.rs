//! In-process transport.
//!
//! [`LocalHub`] fans every published event out to all live subscribers over
//! unbounded flume channels. Mounts in one process (and tests) share a hub
//! by cloning it.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;

use super::{InvalidationEvent, InvalidationTransport};
use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct LocalHub {
    subscribers: Arc<Mutex<Vec<flume::Sender<InvalidationEvent>>>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_disconnected());
        subscribers.len()
    }
}

#[async_trait]
impl InvalidationTransport for LocalHub {
    async fn publish(&self, event: InvalidationEvent) -> Result<()> {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        Ok(())
    }

    fn subscribe(&self) -> BoxStream<'static, InvalidationEvent> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.lock().push(tx);
        rx.into_stream().boxed()
    }
}
