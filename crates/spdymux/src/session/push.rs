use std::{collections::VecDeque, time::Duration};

use tokio::{sync::mpsc, time::Instant};

use crate::stream::{StreamEvent, StreamKey};

/// A pushed stream nobody asked for yet. Its events pile up in the channel
/// until a request for the same url claims it.
pub(crate) struct UnclaimedPush {
    pub(crate) url: String,
    pub(crate) key: StreamKey,
    pub(crate) events: mpsc::UnboundedReceiver<StreamEvent>,
    pub(crate) created_at: Instant,
    /// Set once the peer has finished the stream: body bytes sitting in
    /// `events` that still hold session window.
    pub(crate) finished_unread: Option<usize>,
}

/// Unclaimed pushed streams, oldest first
#[derive(Default)]
pub(crate) struct UnclaimedPushTable {
    entries: VecDeque<UnclaimedPush>,
}

impl UnclaimedPushTable {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn contains_url(&self, url: &str) -> bool {
        self.entries.iter().any(|e| e.url == url)
    }

    pub(crate) fn insert(&mut self, push: UnclaimedPush) {
        self.entries.push_back(push);
    }

    pub(crate) fn claim(&mut self, url: &str) -> Option<UnclaimedPush> {
        let idx = self.entries.iter().position(|e| e.url == url)?;
        self.entries.remove(idx)
    }

    /// Keeps a push around after its stream closed cleanly. Returns false
    /// if it was never in the table.
    pub(crate) fn finish(&mut self, key: StreamKey, unread: usize) -> bool {
        match self.entries.iter_mut().find(|e| e.key == key) {
            Some(entry) => {
                entry.finished_unread = Some(unread);
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn remove(&mut self, key: StreamKey) -> Option<UnclaimedPush> {
        let idx = self.entries.iter().position(|e| e.key == key)?;
        self.entries.remove(idx)
    }

    pub(crate) fn oldest(&self) -> Option<StreamKey> {
        self.entries.front().map(|e| e.key)
    }

    /// Streams whose lifetime ran out at `now`
    pub(crate) fn expired(&self, now: Instant, lifetime: Duration) -> Vec<StreamKey> {
        self.entries
            .iter()
            .take_while(|e| e.created_at + lifetime <= now)
            .map(|e| e.key)
            .collect()
    }

    pub(crate) fn next_expiry(&self, lifetime: Duration) -> Option<Instant> {
        self.entries.front().map(|e| e.created_at + lifetime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn push(table: &mut UnclaimedPushTable, url: &str, key: u64, created_at: Instant) {
        let (_tx, events) = mpsc::unbounded_channel();
        table.insert(UnclaimedPush {
            url: url.into(),
            key: StreamKey(key),
            events,
            created_at,
            finished_unread: None,
        });
    }

    #[test]
    fn claims_by_url_and_expires_oldest_first() {
        let t0 = Instant::now();
        let lifetime = Duration::from_secs(300);
        let mut table = UnclaimedPushTable::default();
        push(&mut table, "https://example.org/a.dat", 1, t0);
        push(&mut table, "https://example.org/b.dat", 2, t0 + Duration::from_secs(10));
        push(&mut table, "https://example.org/c.dat", 3, t0 + Duration::from_secs(20));

        assert!(table.contains_url("https://example.org/b.dat"));
        assert_eq!(table.next_expiry(lifetime), Some(t0 + lifetime));
        assert_eq!(
            table.expired(t0 + Duration::from_secs(311), lifetime),
            vec![StreamKey(1), StreamKey(2)]
        );

        let claimed = table.claim("https://example.org/b.dat").unwrap();
        assert_eq!(claimed.key, StreamKey(2));
        assert!(table.claim("https://example.org/b.dat").is_none());

        assert_eq!(table.remove(StreamKey(1)).map(|e| e.key), Some(StreamKey(1)));
        assert_eq!(table.oldest(), Some(StreamKey(3)));
        assert_eq!(table.len(), 1);

        assert!(table.finish(StreamKey(3), 12));
        assert!(!table.finish(StreamKey(1), 0));
        assert_eq!(table.claim("https://example.org/c.dat").and_then(|e| e.finished_unread), Some(12));
    }
}
