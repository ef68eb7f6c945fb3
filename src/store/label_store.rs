//! Two-generation bounded cache from uid to label list.
//!
//! Entries live in `live`; a rotation demotes the whole generation to
//! `stale` and starts an empty one. A stale hit is promoted back, so a
//! reader arriving just after rotation keeps its cached result. Rotation is
//! the only eviction path: an entry survives at most two rotations after its
//! last access. Rotation triggers when the live generation outgrows
//! `max_size` or when `clean_interval` has elapsed.
//!
//! Each entry carries its own async lock, held across the label fetch, so
//! concurrent misses for one uid collapse into a single backend call while
//! different uids proceed independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::label::{Label, LabelFetcher};

/// Warm stores keyed by middleware name; reconfiguration reuses the cache
/// instead of losing it.
static REGISTRY: Lazy<DashMap<String, Arc<LabelStore>>> = Lazy::new(DashMap::new);

#[derive(Default)]
struct CacheSlot {
    /// `None` until the first fetch completes.
    value: Option<Vec<Label>>,
    expire_at: Option<SystemTime>,
}

/// One uid's cache cell. The slot lock serializes refreshes for this uid.
#[derive(Default)]
struct CacheEntry {
    slot: Mutex<CacheSlot>,
}

struct StoreInner {
    live: HashMap<String, Arc<CacheEntry>>,
    stale: HashMap<String, Arc<CacheEntry>>,
    max_size: usize,
    clean_interval: Duration,
    next_round: Instant,
}

impl StoreInner {
    fn needs_rotation(&self) -> bool {
        self.live.len() > self.max_size || self.next_round < Instant::now()
    }

    fn rotate(&mut self) {
        self.stale = std::mem::take(&mut self.live);
        self.next_round = Instant::now() + self.clean_interval;
    }
}

/// Bounded per-uid label cache with singleflight refresh.
pub struct LabelStore {
    expiration: Duration,
    fetcher: RwLock<Arc<dyn LabelFetcher>>,
    inner: RwLock<StoreInner>,
}

impl LabelStore {
    pub fn new(
        fetcher: Arc<dyn LabelFetcher>,
        expiration: Duration,
        max_size: usize,
        clean_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            expiration,
            fetcher: RwLock::new(fetcher),
            inner: RwLock::new(StoreInner {
                live: HashMap::new(),
                stale: HashMap::new(),
                max_size,
                clean_interval,
                next_round: Instant::now() + clean_interval,
            }),
        })
    }

    /// Returns the store registered under `name`, creating it on first use.
    ///
    /// An existing store keeps its cached entries but adopts the latest
    /// fetcher, size bound, and rotation interval.
    pub fn registered(
        name: &str,
        fetcher: Arc<dyn LabelFetcher>,
        expiration: Duration,
        max_size: usize,
        clean_interval: Duration,
    ) -> Arc<Self> {
        if let Some(store) = REGISTRY.get(name) {
            let store = store.clone();
            store.set_fetcher(fetcher);
            {
                let mut inner = store.inner.write();
                inner.max_size = max_size;
                inner.clean_interval = clean_interval;
            }
            return store;
        }
        let store = Self::new(fetcher, expiration, max_size, clean_interval);
        REGISTRY.insert(name.to_string(), store.clone());
        store
    }

    /// Replaces the backend fetch used on cache misses.
    pub fn set_fetcher(&self, fetcher: Arc<dyn LabelFetcher>) {
        *self.fetcher.write() = fetcher;
    }

    /// Loads the labels for `uid`, fetching at most once per TTL window.
    ///
    /// Never fails: backend problems yield an empty list, and that empty
    /// result is cached for the TTL so a degraded label service is not
    /// re-probed on every request.
    pub async fn must_load_labels(
        &self,
        uid: &str,
        request_id: &str,
        traceparent: Option<&str>,
    ) -> Vec<Label> {
        let entry = self.entry_for(uid);
        let now = SystemTime::now();

        let mut slot = entry.slot.lock().await;
        let fresh = slot.value.is_some() && slot.expire_at.is_some_and(|at| at >= now);
        if !fresh {
            let fetcher = self.fetcher.read().clone();
            let (labels, timestamp) = fetcher.must_fetch(uid, request_id, traceparent).await;
            // TTL counts from the server-supplied build instant, not from
            // the store time; the client clamps future timestamps.
            slot.expire_at = Some(
                UNIX_EPOCH + Duration::from_secs(timestamp.max(0) as u64) + self.expiration,
            );
            slot.value = Some(labels);
        }
        slot.value.clone().unwrap_or_default()
    }

    /// Finds or creates the cache entry for `uid` and applies rotation.
    ///
    /// The store lock is never held across a fetch.
    fn entry_for(&self, uid: &str) -> Arc<CacheEntry> {
        {
            let inner = self.inner.read();
            if !inner.needs_rotation() {
                if let Some(entry) = inner.live.get(uid) {
                    return entry.clone();
                }
            }
        }

        let mut inner = self.inner.write();
        let entry = if let Some(entry) = inner.live.get(uid) {
            entry.clone()
        } else if let Some(entry) = inner.stale.remove(uid) {
            // A reader arriving after rotation promotes its entry back.
            inner.live.insert(uid.to_string(), entry.clone());
            entry
        } else {
            let entry = Arc::new(CacheEntry::default());
            inner.live.insert(uid.to_string(), entry.clone());
            entry
        };

        if inner.needs_rotation() {
            inner.rotate();
        }
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::unix_now;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Returns the request id as the fetched label, mirroring how the tests
    /// distinguish which fetch produced a cached value.
    struct EchoFetcher {
        calls: AtomicU64,
        delay: Duration,
        timestamp_offset: i64,
    }

    impl EchoFetcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU64::new(0),
                delay: Duration::ZERO,
                timestamp_offset: 0,
            })
        }

        fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU64::new(0),
                delay,
                timestamp_offset: 0,
            })
        }

        fn backdated(offset: i64) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU64::new(0),
                delay: Duration::ZERO,
                timestamp_offset: offset,
            })
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LabelFetcher for EchoFetcher {
        async fn must_fetch(
            &self,
            _uid: &str,
            request_id: &str,
            _traceparent: Option<&str>,
        ) -> (Vec<Label>, i64) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let label = Label {
                label: request_id.to_string(),
                ..Default::default()
            };
            (vec![label], unix_now() + self.timestamp_offset)
        }
    }

    fn test_store(fetcher: Arc<EchoFetcher>) -> Arc<LabelStore> {
        LabelStore::new(
            fetcher,
            Duration::from_secs(1),
            3,
            Duration::from_secs(2),
        )
    }

    fn live_len(store: &LabelStore) -> usize {
        store.inner.read().live.len()
    }

    fn stale_len(store: &LabelStore) -> usize {
        store.inner.read().stale.len()
    }

    #[tokio::test]
    async fn caches_within_ttl_and_refetches_after() {
        let fetcher = EchoFetcher::new();
        let store = test_store(fetcher.clone());

        let labels = store.must_load_labels("u1", "v1", None).await;
        assert_eq!(labels[0].label, "v1");

        // Cached: the second request id never reaches the fetcher.
        let labels = store.must_load_labels("u1", "v2", None).await;
        assert_eq!(labels[0].label, "v1");
        assert_eq!(fetcher.calls(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let labels = store.must_load_labels("u1", "v2", None).await;
        assert_eq!(labels[0].label, "v2");
        let labels = store.must_load_labels("u1", "v3", None).await;
        assert_eq!(labels[0].label, "v2");
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn size_overflow_rotates_and_stale_hits_promote() {
        let fetcher = EchoFetcher::new();
        let store = test_store(fetcher.clone());

        for uid in ["u1", "u2", "u3"] {
            store.must_load_labels(uid, "v1", None).await;
        }
        assert_eq!(live_len(&store), 3);

        // The fourth distinct uid overflows max_size and rotates.
        store.must_load_labels("u4", "v1", None).await;
        assert_eq!(live_len(&store), 0);
        assert_eq!(stale_len(&store), 4);

        // A stale hit is promoted and keeps its cached value: no refetch.
        let calls_before = fetcher.calls();
        let labels = store.must_load_labels("u1", "v9", None).await;
        assert_eq!(labels[0].label, "v1");
        assert_eq!(fetcher.calls(), calls_before);
        assert_eq!(live_len(&store), 1);
        assert_eq!(stale_len(&store), 3);
    }

    #[tokio::test]
    async fn entry_survives_at_most_two_rotations() {
        let fetcher = EchoFetcher::new();
        let store = test_store(fetcher.clone());

        store.must_load_labels("u1", "v1", None).await;
        for uid in ["u2", "u3", "u4"] {
            store.must_load_labels(uid, "v1", None).await;
        }
        // First rotation: u1 sits in the stale generation.
        assert_eq!(stale_len(&store), 4);

        for uid in ["u5", "u6", "u7", "u8"] {
            store.must_load_labels(uid, "v2", None).await;
        }
        // Second rotation dropped the untouched u1 entry for good.
        let calls_before = fetcher.calls();
        let labels = store.must_load_labels("u1", "v8", None).await;
        assert_eq!(labels[0].label, "v8");
        assert_eq!(fetcher.calls(), calls_before + 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_for_one_uid_fetch_once() {
        let fetcher = EchoFetcher::with_delay(Duration::from_millis(100));
        let store = test_store(fetcher.clone());

        let mut tasks = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.must_load_labels("u1", &format!("v{i}"), None).await
            }));
        }

        let mut seen = Vec::new();
        for task in tasks {
            let labels = task.await.unwrap();
            seen.push(labels[0].label.clone());
        }

        // All waiters observe the result of the single in-flight fetch.
        assert_eq!(fetcher.calls(), 1);
        assert!(seen.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn server_timestamp_drives_expiry() {
        // Labels stamped 10 s in the past with a 1 s TTL are already
        // expired when stored, so every load fetches.
        let fetcher = EchoFetcher::backdated(-10);
        let store = test_store(fetcher.clone());

        store.must_load_labels("u1", "v1", None).await;
        store.must_load_labels("u1", "v2", None).await;
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn registry_reuses_warm_stores() {
        let fetcher = EchoFetcher::new();
        let first = LabelStore::registered(
            "registry-reuse",
            fetcher.clone(),
            Duration::from_secs(60),
            100,
            Duration::from_secs(60),
        );
        first.must_load_labels("u1", "v1", None).await;

        let second = LabelStore::registered(
            "registry-reuse",
            EchoFetcher::new(),
            Duration::from_secs(60),
            7,
            Duration::from_secs(30),
        );
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.inner.read().max_size, 7);
        assert_eq!(second.inner.read().clean_interval, Duration::from_secs(30));

        // The warm entry is still served.
        let labels = second.must_load_labels("u1", "v2", None).await;
        assert_eq!(labels[0].label, "v1");
    }
}
