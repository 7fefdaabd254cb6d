//! Process-wide per-user counters.
//!
//! Topics adjust the cached unread count as data is published and read
//! receipts arrive; the push receipt builder reads it so notifications can
//! carry a badge number without a store round-trip. The cache is lazy: a
//! user appears the first time a topic touches them and the count is only
//! ever a hint.

use dashmap::DashMap;

use super::types::Uid;

#[derive(Default)]
struct Entry {
    unread: i64,
}

/// Cache of per-user unread counts.
#[derive(Default)]
pub struct UserCache {
    entries: DashMap<Uid, Entry>,
}

impl UserCache {
    pub fn new() -> Self {
        UserCache::default()
    }

    /// Adjust the unread count, clamping at zero.
    pub fn inc_unread(&self, uid: Uid, delta: i64) {
        if uid.is_zero() {
            return;
        }
        let mut entry = self.entries.entry(uid).or_default();
        entry.unread = (entry.unread + delta).max(0);
    }

    /// Replace the unread count with an authoritative value.
    pub fn set_unread(&self, uid: Uid, unread: i64) {
        if uid.is_zero() {
            return;
        }
        self.entries.entry(uid).or_default().unread = unread.max(0);
    }

    pub fn unread(&self, uid: Uid) -> Option<i64> {
        self.entries.get(&uid).map(|e| e.unread)
    }

    pub fn forget(&self, uid: Uid) {
        self.entries.remove(&uid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unread_counting() {
        let cache = UserCache::new();
        let uid = Uid::new(7);
        assert_eq!(cache.unread(uid), None);

        cache.inc_unread(uid, 3);
        assert_eq!(cache.unread(uid), Some(3));

        cache.inc_unread(uid, -1);
        assert_eq!(cache.unread(uid), Some(2));

        // Never goes negative.
        cache.inc_unread(uid, -10);
        assert_eq!(cache.unread(uid), Some(0));
    }

    #[test]
    fn test_set_and_forget() {
        let cache = UserCache::new();
        let uid = Uid::new(7);
        cache.set_unread(uid, 12);
        assert_eq!(cache.unread(uid), Some(12));
        cache.forget(uid);
        assert_eq!(cache.unread(uid), None);
    }

    #[test]
    fn test_zero_uid_ignored() {
        let cache = UserCache::new();
        cache.inc_unread(Uid::ZERO, 5);
        assert_eq!(cache.unread(Uid::ZERO), None);
    }
}
