use std::{cell::RefCell, collections::HashMap};

use crate::key::SessionKey;

/// Per-destination memory of settings the peer sent in earlier sessions.
///
/// Consulted only to pre-seed new sessions; never load-bearing for
/// correctness. Cleared when the network changes.
pub trait SettingsCache {
    fn max_concurrent_streams(&self, key: &SessionKey) -> Option<u32>;

    fn set_max_concurrent_streams(&self, key: &SessionKey, value: u32);

    fn clear(&self);
}

/// A [SettingsCache] that lives as long as the process does
#[derive(Debug, Default)]
pub struct MemorySettingsCache {
    max_concurrent_streams: RefCell<HashMap<SessionKey, u32>>,
}

impl SettingsCache for MemorySettingsCache {
    fn max_concurrent_streams(&self, key: &SessionKey) -> Option<u32> {
        self.max_concurrent_streams.borrow().get(key).copied()
    }

    fn set_max_concurrent_streams(&self, key: &SessionKey, value: u32) {
        self.max_concurrent_streams
            .borrow_mut()
            .insert(key.clone(), value);
    }

    fn clear(&self) {
        self.max_concurrent_streams.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::HostPortPair;
    use pretty_assertions::assert_eq;

    #[test]
    fn remembers_until_cleared() {
        let cache = MemorySettingsCache::default();
        let key = SessionKey::new(HostPortPair::new("example.org", 443));
        assert_eq!(cache.max_concurrent_streams(&key), None);

        cache.set_max_concurrent_streams(&key, 7);
        assert_eq!(cache.max_concurrent_streams(&key), Some(7));

        cache.clear();
        assert_eq!(cache.max_concurrent_streams(&key), None);
    }
}
