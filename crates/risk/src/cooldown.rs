use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use common::age;

/// (strategy id, position ticket)
pub type PositionKey = (String, u64);

/// Last accepted modification per position.
///
/// A position inside its window is not modified again. Entries older than
/// the window carry no information and are dropped by `evict`.
#[derive(Debug)]
pub struct CooldownCache {
    window: Duration,
    applied: HashMap<PositionKey, DateTime<Utc>>,
}

impl CooldownCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            applied: HashMap::new(),
        }
    }

    pub fn is_cooling(&self, key: &PositionKey, now: DateTime<Utc>) -> bool {
        self.applied
            .get(key)
            .is_some_and(|at| age(now, *at) < self.window)
    }

    pub fn record(&mut self, key: PositionKey, now: DateTime<Utc>) {
        self.applied.insert(key, now);
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn evict(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.applied.len();
        let window = self.window;
        self.applied.retain(|_, at| age(now, *at) < window);
        before - self.applied.len()
    }

    pub fn len(&self) -> usize {
        self.applied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    #[test]
    fn cooling_until_window_elapses() {
        let mut cache = CooldownCache::new(Duration::from_secs(60));
        let key = ("alpha".to_string(), 7);
        cache.record(key.clone(), t(0));

        assert!(cache.is_cooling(&key, t(0)));
        assert!(cache.is_cooling(&key, t(59)));
        assert!(!cache.is_cooling(&key, t(60)));
        assert!(!cache.is_cooling(&("beta".to_string(), 7), t(1)));
    }

    #[test]
    fn evict_drops_only_expired() {
        let mut cache = CooldownCache::new(Duration::from_secs(60));
        cache.record(("alpha".into(), 1), t(0));
        cache.record(("alpha".into(), 2), t(30));

        assert_eq!(cache.evict(t(70)), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.is_cooling(&("alpha".into(), 2), t(70)));
    }
}
