//! Watch caches: informer-style local views over the object store.
//!
//! A [`Cache`] is a multi-reader snapshot updated by a single dispatcher
//! task. Event handlers run after the snapshot is updated, so a handler
//! that immediately reads back its own key always observes it. Readers must
//! tolerate staleness bounded by the watch lag.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use trellis_api::{ObjectKey, Pod};

use crate::memory::ObjectStore;
use crate::object::{Selector, StoredObject, WatchEvent};

type EventHandler<T> = Box<dyn Fn(&WatchEvent<T>) + Send + Sync>;

/// A local, watch-maintained view of one stored kind.
pub struct Cache<T: StoredObject> {
    objects: DashMap<ObjectKey, T>,
    handlers: RwLock<Vec<EventHandler<T>>>,
    synced: watch::Sender<bool>,
}

impl<T: StoredObject> Default for Cache<T> {
    fn default() -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            objects: DashMap::new(),
            handlers: RwLock::new(Vec::new()),
            synced,
        }
    }
}

impl<T: StoredObject> Cache<T> {
    /// An empty, unsynced cache.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an event handler. Handlers run on the dispatcher task after
    /// the snapshot is updated; register before [`Cache::start`] so the
    /// initial list is delivered as `Added` events.
    pub fn add_event_handler(&self, handler: impl Fn(&WatchEvent<T>) + Send + Sync + 'static) {
        self.handlers
            .write()
            .expect("handler lock poisoned")
            .push(Box::new(handler));
    }

    /// Spawn the dispatcher: subscribe to the store's watch, perform the
    /// initial list, then apply events until cancelled.
    pub fn start(
        self: Arc<Self>,
        store: Arc<dyn ObjectStore<T>>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cache = self;
        tokio::spawn(async move {
            // Subscribe before listing so no committed write can fall
            // between the list and the first received event.
            let mut events = store.watch();
            cache.resync(store.as_ref()).await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => cache.apply(event),
                        Err(RecvError::Lagged(missed)) => {
                            warn!(kind = T::KIND, missed, "watch lagged behind the store, relisting");
                            cache.resync(store.as_ref()).await;
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!(kind = T::KIND, "cache dispatcher stopped");
        })
    }

    /// Whether the initial list completed.
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait until the initial list completes.
    pub async fn wait_synced(&self) {
        let mut synced = self.synced.subscribe();
        while !*synced.borrow_and_update() {
            if synced.changed().await.is_err() {
                return;
            }
        }
    }

    /// Fetch one object from the snapshot.
    pub fn get(&self, key: &ObjectKey) -> Option<T> {
        self.objects.get(key).map(|entry| entry.clone())
    }

    /// Snapshot of every cached object.
    pub fn list(&self) -> Vec<T> {
        self.objects.iter().map(|entry| entry.clone()).collect()
    }

    /// Number of cached objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    async fn resync(&self, store: &dyn ObjectStore<T>) {
        let listed = loop {
            match store.list(&Selector::everything()).await {
                Ok(listed) => break listed,
                Err(err) => {
                    warn!(kind = T::KIND, error = %err, "cache list failed, retrying");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        };

        let live: std::collections::HashSet<ObjectKey> =
            listed.iter().map(|obj| obj.key()).collect();
        let stale: Vec<ObjectKey> = self
            .objects
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| !live.contains(key))
            .collect();
        for key in stale {
            if let Some((_, gone)) = self.objects.remove(&key) {
                self.notify(&WatchEvent::Deleted(gone));
            }
        }

        for obj in listed {
            if let Some(event) = self.upsert(obj) {
                self.notify(&event);
            }
        }

        self.synced.send_replace(true);
    }

    fn apply(&self, event: WatchEvent<T>) {
        match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                if let Some(event) = self.upsert(obj) {
                    self.notify(&event);
                }
            }
            WatchEvent::Deleted(obj) => {
                self.objects.remove(&obj.key());
                self.notify(&WatchEvent::Deleted(obj));
            }
        }
    }

    /// Insert unless the snapshot already holds a same-or-newer version.
    fn upsert(&self, obj: T) -> Option<WatchEvent<T>> {
        match self.objects.entry(obj.key()) {
            Entry::Occupied(mut entry) => {
                if entry.get().metadata().resource_version >= obj.metadata().resource_version {
                    return None;
                }
                entry.insert(obj.clone());
                Some(WatchEvent::Modified(obj))
            }
            Entry::Vacant(entry) => {
                entry.insert(obj.clone());
                Some(WatchEvent::Added(obj))
            }
        }
    }

    fn notify(&self, event: &WatchEvent<T>) {
        for handler in self.handlers.read().expect("handler lock poisoned").iter() {
            handler(event);
        }
    }
}

/// Read-only pod lookup consumed by the admission stages.
pub trait PodLookup: Send + Sync {
    /// The pod with the given key, if it is running.
    fn pod(&self, namespace: &str, name: &str) -> Option<Pod>;
}

/// Node-local pod view backed by a concurrent map.
#[derive(Debug, Default)]
pub struct PodIndex {
    pods: DashMap<(String, String), Pod>,
}

impl PodIndex {
    /// An empty index.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a running pod.
    pub fn insert(&self, pod: Pod) {
        self.pods
            .insert((pod.namespace.clone(), pod.name.clone()), pod);
    }

    /// Forget a pod.
    pub fn remove(&self, namespace: &str, name: &str) {
        self.pods.remove(&(namespace.to_string(), name.to_string()));
    }
}

impl PodLookup for PodIndex {
    fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.pods
            .get(&(namespace.to_string(), name.to_string()))
            .map(|entry| entry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionChain;
    use crate::memory::MemoryStore;
    use crate::principal::Principal;
    use crate::strategy::TrustBundleStrategy;
    use tokio::sync::mpsc;
    use trellis_api::normalize::encode_certificate_block;
    use trellis_api::{TrustBundle, TrustBundleSpec};

    fn bundle(name: &str, der: &[u8]) -> TrustBundle {
        TrustBundle::new(
            name,
            TrustBundleSpec {
                signer_name: String::new(),
                trust_bundle: encode_certificate_block(der),
            },
        )
    }

    #[tokio::test]
    async fn cache_follows_the_store() {
        let store = MemoryStore::new(Box::new(TrustBundleStrategy), AdmissionChain::new());
        let tester = Principal::new("tester");
        store.create(&tester, bundle("pre-existing", &[1])).await.unwrap();

        let cache: Arc<Cache<TrustBundle>> = Cache::new();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        cache.add_event_handler(move |event: &WatchEvent<TrustBundle>| {
            let name = event.object().metadata.name.clone();
            let kind = match event {
                WatchEvent::Added(_) => "added",
                WatchEvent::Modified(_) => "modified",
                WatchEvent::Deleted(_) => "deleted",
            };
            let _ = events_tx.send((kind, name));
        });

        let shutdown = CancellationToken::new();
        let handle = Arc::clone(&cache).start(store.clone(), shutdown.clone());
        cache.wait_synced().await;

        // The initial list is delivered as an Added event.
        assert_eq!(
            events_rx.recv().await.unwrap(),
            ("added", "pre-existing".to_string())
        );
        assert!(cache.get(&ObjectKey::named("pre-existing")).is_some());

        store.create(&tester, bundle("later", &[2])).await.unwrap();
        assert_eq!(events_rx.recv().await.unwrap(), ("added", "later".to_string()));
        assert_eq!(cache.len(), 2);

        store.delete(&ObjectKey::named("later")).await.unwrap();
        assert_eq!(
            events_rx.recv().await.unwrap(),
            ("deleted", "later".to_string())
        );
        assert!(cache.get(&ObjectKey::named("later")).is_none());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn stale_events_do_not_regress_the_snapshot() {
        let cache: Arc<Cache<TrustBundle>> = Cache::new();

        let mut newer = bundle("b", &[1]);
        newer.metadata.resource_version = 5;
        cache.apply(WatchEvent::Added(newer.clone()));

        let mut older = bundle("b", &[2]);
        older.metadata.resource_version = 3;
        cache.apply(WatchEvent::Modified(older));

        let held = cache.get(&ObjectKey::named("b")).unwrap();
        assert_eq!(held.metadata.resource_version, 5);
        assert_eq!(held.spec.trust_bundle, newer.spec.trust_bundle);
    }

    #[test]
    fn pod_index_lookup() {
        let index = PodIndex::new();
        index.insert(Pod::new("n1", "p1", "u1", "sa1", "node-a"));

        let found = index.pod("n1", "p1").unwrap();
        assert_eq!(found.node, "node-a");
        assert!(index.pod("n1", "missing").is_none());

        index.remove("n1", "p1");
        assert!(index.pod("n1", "p1").is_none());
    }
}
