//! Applies invalidation events published by other mounts.

use std::sync::atomic::Ordering;
use std::sync::Weak;

use futures::stream::{BoxStream, StreamExt};
use tokio::sync::watch;
use tracing::{debug, trace};

use super::Inner;
use crate::bus::{EventKind, InvalidationEvent};

pub(super) async fn listen(
    inner: Weak<Inner>,
    mut events: BoxStream<'static, InvalidationEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = events.next() => match event {
                Some(event) => event,
                None => {
                    debug!("invalidation stream closed");
                    return;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.apply_event(&event);
    }
}

impl Inner {
    /// Drop whatever a peer's event makes stale. Dirty local state is never
    /// discarded; it wins or merges at its own flush.
    pub(super) fn apply_event(&self, event: &InvalidationEvent) {
        let id = event.inode;
        trace!(inode = %id, kind = ?event.kind, version = event.version, origin = %event.origin, "invalidation received");
        let changed = match event.kind {
            EventKind::MetadataChanged => self.index.mark_stale(id, event.version),
            EventKind::DataChanged => {
                let stale = self.index.mark_stale(id, event.version);
                if stale {
                    self.cache.invalidate_clean(id);
                }
                stale
            }
            EventKind::Deleted => match self.index.remove_deleted(id, event.version) {
                Some(_) => {
                    if !self.handles.is_open(id) {
                        self.cache.drop_inode(id);
                        self.index.purge(id);
                    }
                    true
                }
                None => false,
            },
        };
        if changed {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
            debug!(inode = %id, kind = ?event.kind, version = event.version, "applied invalidation");
        }
    }
}
