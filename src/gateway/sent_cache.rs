use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use tracing::{trace, warn};

use crate::protocol::notification::Notification;

/// Insertion-ordered store of notifications that were written to the
/// transport but may still be rejected. The gateway acknowledges nothing:
/// an entry leaves the cache only through rejection reconciliation
/// ([`discard_up_to`](SentNotificationCache::discard_up_to)), and the cache
/// grows (never drops an entry) when a burst outruns its capacity.
///
/// The cache itself is not synchronized - the owning connection guards it
/// with a lock so that sends and rejection handling never interleave.
pub struct SentNotificationCache {
    entries: VecDeque<Notification>,
    by_id: FxHashMap<u32, Notification>,
    capacity: usize,
}

impl SentNotificationCache {
    pub fn new(initial_capacity: usize) -> SentNotificationCache {
        SentNotificationCache {
            entries: VecDeque::new(),
            by_id: FxHashMap::default(),
            capacity: initial_capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, identifier: u32) -> Option<&Notification> {
        self.by_id.get(&identifier)
    }

    /// Appends a transmitted notification. Returns the new capacity if
    /// recording it forced the cache to grow.
    pub fn record(&mut self, notification: Notification) -> Option<usize> {
        trace!("caching sent notification {:?}", notification);
        self.by_id
            .insert(notification.identifier, notification.clone());
        self.entries.push_back(notification);

        if self.entries.len() > self.capacity {
            // every cached entry is still unconfirmed, so the only safe
            // response to overflow is growing
            self.capacity *= 2;
            warn!(
                "sent cache exceeded its capacity, growing to {}",
                self.capacity
            );
            Some(self.capacity)
        } else {
            None
        }
    }

    /// Every cached notification transmitted strictly after the one with
    /// the given identifier, in transmission order. If the identifier is
    /// not cached (already discarded, or never assigned), the resend set is
    /// the entire cache: nothing proves the gateway processed anything sent
    /// after the unknown rejection point.
    pub fn resend_set_after(&self, identifier: u32) -> Vec<Notification> {
        if !self.by_id.contains_key(&identifier) {
            warn!(
                identifier,
                "rejected notification is not cached - conservatively resending all {} cached notifications",
                self.entries.len()
            );
            return self.entries.iter().cloned().collect();
        }

        self.entries
            .iter()
            .skip_while(|n| n.identifier != identifier)
            .skip(1)
            .cloned()
            .collect()
    }

    /// Drops the matched entry and everything transmitted before it: the
    /// gateway processed all of them (the match was rejected, the earlier
    /// ones were accepted). Entries after the match stay cached. A no-op
    /// for an identifier that is not cached.
    pub fn discard_up_to(&mut self, identifier: u32) {
        if !self.by_id.contains_key(&identifier) {
            return;
        }

        while let Some(n) = self.entries.pop_front() {
            self.by_id.remove(&n.identifier);
            trace!("discarding notification {:?}", n);
            if n.identifier == identifier {
                break;
            }
        }
    }
}
