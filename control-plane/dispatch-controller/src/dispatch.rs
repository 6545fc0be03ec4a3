use std::fmt;
use std::sync::Arc;

use kube::Resource;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cache::{LabelSelector, Notification, ObjectKey, ResourceCache};
use crate::queue::WorkQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Add,
    Update,
    Delete,
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventAction::Add => write!(f, "add"),
            EventAction::Update => write!(f, "update"),
            EventAction::Delete => write!(f, "delete"),
        }
    }
}

/// Typed unit of work: the action plus the snapshot(s) it concerns.
/// `Add` carries `new`, `Delete` carries `old`, `Update` carries both.
#[derive(Debug)]
pub struct WorkItem<K> {
    pub action: EventAction,
    pub key: ObjectKey,
    pub old: Option<Arc<K>>,
    pub new: Option<Arc<K>>,
}

impl<K> Clone for WorkItem<K> {
    fn clone(&self) -> Self {
        Self {
            action: self.action,
            key: self.key.clone(),
            old: self.old.clone(),
            new: self.new.clone(),
        }
    }
}

impl<K: Resource> WorkItem<K> {
    pub fn add(obj: Arc<K>) -> Self {
        Self {
            action: EventAction::Add,
            key: ObjectKey::of(obj.as_ref()),
            old: None,
            new: Some(obj),
        }
    }

    pub fn update(old: Arc<K>, new: Arc<K>) -> Self {
        Self {
            action: EventAction::Update,
            key: ObjectKey::of(new.as_ref()),
            old: Some(old),
            new: Some(new),
        }
    }

    pub fn delete(obj: Arc<K>) -> Self {
        Self {
            action: EventAction::Delete,
            key: ObjectKey::of(obj.as_ref()),
            old: Some(obj),
            new: None,
        }
    }
}

impl<K: Resource> From<Notification<K>> for WorkItem<K> {
    fn from(note: Notification<K>) -> Self {
        match note {
            Notification::Added(obj) => WorkItem::add(obj),
            Notification::Updated { old, new } => WorkItem::update(old, new),
            Notification::Deleted(obj) => WorkItem::delete(obj),
        }
    }
}

/// Which objects a dispatcher hands to its controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    Namespace(String),
}

impl Scope {
    pub fn admits(&self, key: &ObjectKey) -> bool {
        match self {
            Scope::All => true,
            Scope::Namespace(ns) => key.namespace.as_deref() == Some(ns.as_str()),
        }
    }
}

/// Turns cache notifications into queued [`WorkItem`]s. Pushing into a full
/// queue waits; nothing in scope is ever dropped.
pub struct Dispatcher<K> {
    scope: Scope,
    queue: WorkQueue<WorkItem<K>>,
}

impl<K> Dispatcher<K>
where
    K: Resource<DynamicType = ()> + Send + Sync + 'static,
{
    pub fn new(scope: Scope, queue: WorkQueue<WorkItem<K>>) -> Self {
        Self { scope, queue }
    }

    /// Classify one notification and enqueue it if in scope. Returns `false`
    /// when the queue has shut down.
    pub async fn dispatch(&self, note: Notification<K>) -> bool {
        let key = note.key();
        if !self.scope.admits(&key) {
            debug!(%key, "dispatch: out of scope; dropped");
            return true;
        }
        let item = WorkItem::from(note);
        trace!(key = %item.key, action = %item.action, "dispatch: enqueue");
        self.queue.push(item.key.clone(), item).await.is_ok()
    }

    pub async fn run(
        self,
        mut notifications: mpsc::Receiver<Notification<K>>,
        shutdown: CancellationToken,
    ) {
        let kind = K::kind(&());
        loop {
            let note = tokio::select! {
                _ = shutdown.cancelled() => break,
                note = notifications.recv() => note,
            };
            let Some(note) = note else { break };
            let delivered = tokio::select! {
                _ = shutdown.cancelled() => break,
                ok = self.dispatch(note) => ok,
            };
            if !delivered {
                break;
            }
        }
        debug!(%kind, "dispatcher stopped");
    }
}

/// Re-enqueues the owners of a dependent kind whenever one of its objects
/// changes. Owners are looked up in their cache and handed to their
/// controller as an `Update` of the current snapshot, so a reconcile that
/// read a stale view of the dependents runs again once the view catches up.
pub struct Requeue<C, P> {
    scope: Scope,
    owners: ResourceCache<P>,
    queue: WorkQueue<WorkItem<P>>,
    owns: fn(&P, &C) -> bool,
}

impl<C, P> Requeue<C, P>
where
    C: Resource<DynamicType = ()> + Send + Sync + 'static,
    P: Resource<DynamicType = ()> + Send + Sync + 'static,
{
    pub fn new(
        scope: Scope,
        owners: ResourceCache<P>,
        queue: WorkQueue<WorkItem<P>>,
        owns: fn(&P, &C) -> bool,
    ) -> Self {
        Self {
            scope,
            owners,
            queue,
            owns,
        }
    }

    /// Enqueue every in-scope owner of the notified object. Returns `false`
    /// when the queue has shut down.
    pub async fn requeue(&self, note: Notification<C>) -> bool {
        let key = note.key();
        if !self.scope.admits(&key) {
            return true;
        }
        let namespace = match &self.scope {
            Scope::All => None,
            Scope::Namespace(ns) => Some(ns.as_str()),
        };
        let owners: Vec<Arc<P>> = self
            .owners
            .list(namespace, &LabelSelector::everything())
            .await
            .into_iter()
            .filter(|owner| (self.owns)(owner, note.latest()))
            .collect();
        if owners.is_empty() {
            debug!(%key, "requeue: no owner in cache");
            return true;
        }
        for owner in owners {
            let item = WorkItem::update(owner.clone(), owner);
            trace!(%key, owner = %item.key, "requeue: enqueue owner");
            if self.queue.push(item.key.clone(), item).await.is_err() {
                return false;
            }
        }
        true
    }

    pub async fn run(
        self,
        mut notifications: mpsc::Receiver<Notification<C>>,
        shutdown: CancellationToken,
    ) {
        loop {
            let note = tokio::select! {
                _ = shutdown.cancelled() => break,
                note = notifications.recv() => note,
            };
            let Some(note) = note else { break };
            let delivered = tokio::select! {
                _ = shutdown.cancelled() => break,
                ok = self.requeue(note) => ok,
            };
            if !delivered {
                break;
            }
        }
        debug!(dependent = %C::kind(&()), owner = %P::kind(&()), "requeue stopped");
    }
}
