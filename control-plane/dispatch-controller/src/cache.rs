//! Watch-fed local view of one resource kind.
//!
//! A [`ResourceCache`] is written only by its subscription task, which folds
//! `kube::runtime::watcher` events into the store and forwards the resulting
//! [`Notification`]s to a dispatcher. Readers must wait for the
//! [`SyncSignal`] before trusting a miss: until the initial replay finishes
//! an absent object may simply not have been observed yet.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use tokio::sync::{RwLock, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }

    pub fn cluster(name: &str) -> Self {
        Self {
            namespace: None,
            name: name.to_string(),
        }
    }

    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Change observed by a cache, in delivery order.
#[derive(Debug)]
pub enum Notification<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
}

impl<K> Clone for Notification<K> {
    fn clone(&self) -> Self {
        match self {
            Notification::Added(obj) => Notification::Added(obj.clone()),
            Notification::Updated { old, new } => Notification::Updated {
                old: old.clone(),
                new: new.clone(),
            },
            Notification::Deleted(obj) => Notification::Deleted(obj.clone()),
        }
    }
}

impl<K: Resource> Notification<K> {
    /// The most recent snapshot carried by the notification.
    pub fn latest(&self) -> &K {
        match self {
            Notification::Added(obj) | Notification::Deleted(obj) => obj,
            Notification::Updated { new, .. } => new,
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::of(self.latest())
    }
}

/// Equality-based label selector (`k1=v1,k2=v2`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> =
            self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{}", parts.join(","))
    }
}

/// One-shot "initial replay complete" flag of a cache.
#[derive(Clone)]
pub struct SyncSignal(watch::Receiver<bool>);

impl SyncSignal {
    pub fn is_synced(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves to `true` once the cache has synced, or `false` if the cache
    /// was dropped first.
    pub async fn wait(mut self) -> bool {
        self.0.wait_for(|synced| *synced).await.is_ok()
    }
}

struct Store<K> {
    objects: HashMap<ObjectKey, Arc<K>>,
    /// Keys seen since the last `Init`, present only while a relist runs.
    relist: Option<HashSet<ObjectKey>>,
}

pub struct ResourceCache<K> {
    store: Arc<RwLock<Store<K>>>,
    synced: Arc<watch::Sender<bool>>,
}

impl<K> Clone for ResourceCache<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            synced: self.synced.clone(),
        }
    }
}

impl<K> Default for ResourceCache<K>
where
    K: Resource<DynamicType = ()> + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> ResourceCache<K>
where
    K: Resource<DynamicType = ()> + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            store: Arc::new(RwLock::new(Store {
                objects: HashMap::new(),
                relist: None,
            })),
            synced: Arc::new(tx),
        }
    }

    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    pub fn sync_signal(&self) -> SyncSignal {
        SyncSignal(self.synced.subscribe())
    }

    pub async fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.store.read().await.objects.get(key).cloned()
    }

    /// Objects in `namespace` (all namespaces when `None`) matching
    /// `selector`, ordered by key.
    pub async fn list(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Vec<Arc<K>> {
        let r = self.store.read().await;
        let mut hits: Vec<(&ObjectKey, &Arc<K>)> = r
            .objects
            .iter()
            .filter(|(key, _)| {
                namespace.is_none() || key.namespace.as_deref() == namespace
            })
            .filter(|(_, obj)| selector.matches(obj.labels()))
            .collect();
        hits.sort_by(|a, b| a.0.cmp(b.0));
        hits.into_iter().map(|(_, obj)| obj.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.store.read().await.objects.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Fold one watcher event into the store and report what changed.
    pub async fn apply(&self, event: watcher::Event<K>) -> Vec<Notification<K>> {
        let mut w = self.store.write().await;
        match event {
            watcher::Event::Init => {
                w.relist = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                let key = ObjectKey::of(&obj);
                if let Some(seen) = w.relist.as_mut() {
                    seen.insert(key.clone());
                }
                upsert(&mut w.objects, key, obj).into_iter().collect()
            }
            watcher::Event::InitDone => {
                let seen = w.relist.take().unwrap_or_default();
                let stale: Vec<ObjectKey> = w
                    .objects
                    .keys()
                    .filter(|key| !seen.contains(*key))
                    .cloned()
                    .collect();
                let mut notes = Vec::with_capacity(stale.len());
                for key in stale {
                    if let Some(obj) = w.objects.remove(&key) {
                        trace!(%key, "cache: evicted after relist");
                        notes.push(Notification::Deleted(obj));
                    }
                }
                drop(w);
                if !self.synced.send_replace(true) {
                    info!(kind = %K::kind(&()), "cache: initial sync complete");
                }
                notes
            }
            watcher::Event::Apply(obj) => {
                let key = ObjectKey::of(&obj);
                upsert(&mut w.objects, key, obj).into_iter().collect()
            }
            watcher::Event::Delete(obj) => {
                let key = ObjectKey::of(&obj);
                w.objects.remove(&key);
                vec![Notification::Deleted(Arc::new(obj))]
            }
        }
    }

    /// Drive a watcher stream into the cache until the stream ends or
    /// `shutdown` fires. Every notification goes to each of `sinks` in
    /// delivery order; a full sink applies backpressure to the stream rather
    /// than dropping events. Nothing is forwarded before the initial sync.
    pub async fn run_subscription<S>(
        self,
        stream: S,
        sinks: Vec<mpsc::Sender<Notification<K>>>,
        shutdown: CancellationToken,
    ) where
        S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send,
    {
        let kind = K::kind(&());
        let mut stream = std::pin::pin!(stream);
        let mut backlog = Vec::new();
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = stream.next() => next,
            };
            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    warn!(%kind, error = %e, "watch stream error; continuing");
                    continue;
                }
                None => {
                    warn!(%kind, "watch stream ended");
                    break;
                }
            };
            let notes = self.apply(event).await;
            if sinks.is_empty() {
                continue;
            }
            // Consumers wait for the initial sync, so the replay is held back
            // until then instead of filling the channel ahead of `InitDone`.
            backlog.extend(notes);
            if !self.has_synced() {
                continue;
            }
            for note in backlog.drain(..) {
                for tx in &sinks {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        sent = tx.send(note.clone()) => {
                            if sent.is_err() {
                                debug!(%kind, "notification receiver closed; stopping subscription");
                                return;
                            }
                        }
                    }
                }
            }
        }
        debug!(%kind, "subscription stopped");
    }
}

fn upsert<K: Resource>(
    objects: &mut HashMap<ObjectKey, Arc<K>>,
    key: ObjectKey,
    obj: K,
) -> Option<Notification<K>> {
    let new = Arc::new(obj);
    match objects.insert(key, new.clone()) {
        None => Some(Notification::Added(new)),
        Some(old) => {
            let unchanged = old.resource_version().is_some()
                && old.resource_version() == new.resource_version();
            if unchanged {
                None
            } else {
                Some(Notification::Updated { old, new })
            }
        }
    }
}
