//! The static ban cache.
//!
//! A ban asserts "this offer was proven insufficient for this task group".
//! Entries expire by age and are evicted under capacity pressure
//! (approximate LRU). Reads take the cache's own lock, never the offer
//! pool mutex.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;

use flotilla_core::{Clock, TaskGroupKey};

type BanKey = (String, TaskGroupKey);

pub struct StaticBanCache {
    /// `None` when banning is disabled (capacity 0).
    entries: Option<Mutex<LruCache<BanKey, u64>>>,
    expire_after: Duration,
    clock: Arc<dyn Clock>,
}

impl StaticBanCache {
    pub fn new(max_size: usize, expire_after: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: NonZeroUsize::new(max_size).map(|cap| Mutex::new(LruCache::new(cap))),
            expire_after,
            clock,
        }
    }

    pub fn ban(&self, offer_id: &str, group: &TaskGroupKey) {
        if let Some(entries) = &self.entries {
            entries
                .lock()
                .put((offer_id.to_string(), group.clone()), self.clock.monotonic_nanos());
        }
    }

    pub fn is_banned(&self, offer_id: &str, group: &TaskGroupKey) -> bool {
        let Some(entries) = &self.entries else {
            return false;
        };
        let key = (offer_id.to_string(), group.clone());
        let mut entries = entries.lock();
        match entries.get(&key) {
            Some(banned_at) => {
                let age_nanos = self.clock.monotonic_nanos().saturating_sub(*banned_at);
                if age_nanos > self.expire_after.as_nanos() as u64 {
                    entries.pop(&key);
                    false
                } else {
                    true
                }
            }
            None => false,
        }
    }

    /// Entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |e| e.lock().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use flotilla_core::{FakeClock, JobKey, ResourceRequest, TaskConfig, TaskGroupKey, Tier};

    fn group(name: &str) -> TaskGroupKey {
        TaskGroupKey::of(&TaskConfig {
            job: JobKey::new("ops", "prod", name),
            tier: Tier::Preferred,
            resources: ResourceRequest {
                cpus: 1.0,
                ram_mb: 128,
                disk_mb: 0,
                requested_ports: BTreeSet::new(),
            },
            constraints: Vec::new(),
            is_service: true,
            max_task_failures: -1,
        })
    }

    #[test]
    fn ban_and_lookup() {
        let clock = Arc::new(FakeClock::new(0));
        let cache = StaticBanCache::new(10, Duration::from_secs(60), clock);

        cache.ban("offer-1", &group("web"));
        assert!(cache.is_banned("offer-1", &group("web")));
        assert!(!cache.is_banned("offer-2", &group("web")));
        assert!(!cache.is_banned("offer-1", &group("api")));
    }

    #[test]
    fn bans_expire_by_age() {
        let clock = Arc::new(FakeClock::new(0));
        let cache = StaticBanCache::new(10, Duration::from_secs(60), Arc::clone(&clock) as _);

        cache.ban("offer-1", &group("web"));
        clock.advance(59_000);
        assert!(cache.is_banned("offer-1", &group("web")));
        clock.advance(2_000);
        assert!(!cache.is_banned("offer-1", &group("web")));
        // The expired entry was dropped.
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let clock = Arc::new(FakeClock::new(0));
        let cache = StaticBanCache::new(2, Duration::from_secs(60), clock);

        cache.ban("offer-1", &group("web"));
        cache.ban("offer-2", &group("web"));
        // Touch offer-1 so offer-2 is the eviction candidate.
        assert!(cache.is_banned("offer-1", &group("web")));
        cache.ban("offer-3", &group("web"));

        assert_eq!(cache.len(), 2);
        assert!(cache.is_banned("offer-1", &group("web")));
        assert!(!cache.is_banned("offer-2", &group("web")));
        assert!(cache.is_banned("offer-3", &group("web")));
    }

    #[test]
    fn zero_capacity_disables_banning() {
        let clock = Arc::new(FakeClock::new(0));
        let cache = StaticBanCache::new(0, Duration::from_secs(60), clock);

        cache.ban("offer-1", &group("web"));
        assert!(!cache.is_banned("offer-1", &group("web")));
        assert_eq!(cache.len(), 0);
    }
}
