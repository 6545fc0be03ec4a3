#![allow(dead_code)]

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dispatch_controller::cache::{LabelSelector, ObjectKey, ResourceCache};
use dispatch_controller::controller::{Controller, ControllerStats, RetryPolicy};
use dispatch_controller::controls::{
    ControlResult, CreateOutcome, DeleteOutcome, MemoryCluster, OwnedNamespaceControl,
};
use dispatch_controller::crd::{
    DispatchUser, DispatchUserSpec, OWNER_LABEL, OwnedNamespace, claim_name,
};
use dispatch_controller::dispatch::{Dispatcher, Requeue, Scope};
use dispatch_controller::queue::WorkQueue;
use dispatch_controller::reconciler::{DispatchUserReconciler, Reconciler};
use futures_util::{Stream, stream};
use kube::Resource;
use kube::runtime::watcher;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub const NS: &str = "dispatch";

// DNS-1123 safe numeric suffix for unique names
pub const DIGITS: [char; 10] =
    ['0', '1', '2', '3', '4', '5', '6', '7', '8', '9'];
pub fn uniq(prefix: &str) -> String {
    format!("{prefix}-{}", nanoid::nanoid!(6, &DIGITS))
}

pub fn user(id: &str, rv: &str, namespaces: &[&str]) -> DispatchUser {
    let mut u = DispatchUser::new(
        id,
        DispatchUserSpec {
            user_id: id.to_string(),
            namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
        },
    );
    u.metadata.namespace = Some(NS.to_string());
    u.metadata.resource_version = Some(rv.to_string());
    u
}

pub fn claim(owner: &str, namespace: &str, rv: &str) -> OwnedNamespace {
    let mut c = OwnedNamespace::for_owner(NS, owner, namespace);
    c.metadata.resource_version = Some(rv.to_string());
    c
}

pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
    }
}

type WatchItem<K> = Result<watcher::Event<K>, watcher::Error>;

/// Hand-driven stand-in for a watch stream.
pub struct EventFeed<K> {
    tx: mpsc::Sender<WatchItem<K>>,
}

impl<K> EventFeed<K> {
    pub async fn send(&self, event: watcher::Event<K>) {
        self.tx.send(Ok(event)).await.expect("feed closed");
    }

    /// Deliver a full relist of `objects`.
    pub async fn relist(&self, objects: Vec<K>) {
        self.send(watcher::Event::Init).await;
        for obj in objects {
            self.send(watcher::Event::InitApply(obj)).await;
        }
        self.send(watcher::Event::InitDone).await;
    }

    pub async fn apply(&self, obj: K) {
        self.send(watcher::Event::Apply(obj)).await;
    }

    pub async fn delete(&self, obj: K) {
        self.send(watcher::Event::Delete(obj)).await;
    }
}

pub fn feed<K: Send + 'static>()
-> (EventFeed<K>, impl Stream<Item = WatchItem<K>> + Send + 'static) {
    let (tx, rx) = mpsc::channel(64);
    let events = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|ev| (ev, rx))
    });
    (EventFeed { tx }, events)
}

/// Cache, dispatcher and controller for one kind, wired the way the
/// process wires them but fed from an [`EventFeed`].
pub struct Pipeline<K> {
    pub feed: EventFeed<K>,
    pub cache: ResourceCache<K>,
    pub stats: Arc<ControllerStats>,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
}

impl<K> Pipeline<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
{
    pub fn start<R>(reconciler: R, workers: usize, retry: RetryPolicy) -> Self
    where
        R: Reconciler<Resource = K>,
    {
        let cache = ResourceCache::new();
        let (feed, events) = feed();
        let (tx, rx) = mpsc::channel(16);
        let queue = WorkQueue::new(16);
        let shutdown = CancellationToken::new();

        let mut tasks = JoinSet::new();
        tasks.spawn(
            cache
                .clone()
                .run_subscription(events, vec![tx], shutdown.clone()),
        );
        tasks.spawn(
            Dispatcher::new(Scope::Namespace(NS.to_string()), queue.clone())
                .run(rx, shutdown.clone()),
        );
        let controller =
            Controller::new("it", Arc::new(reconciler), queue, retry)
                .wait_for(cache.sync_signal());
        let stats = controller.stats();
        tasks.spawn(controller.run(workers, shutdown.clone()));

        Self {
            feed,
            cache,
            stats,
            shutdown,
            tasks,
        }
    }

    /// Wait until `handled` items have been reconciled or dropped.
    pub async fn settle(&self, handled: u64) {
        settle(&self.stats, handled).await;
    }

    pub async fn stop(self) {
        stop(self.shutdown, self.tasks).await;
    }
}

async fn settle(stats: &Arc<ControllerStats>, handled: u64) {
    let stats = stats.clone();
    tokio::time::timeout(Duration::from_secs(10), async move {
        while stats.reconciled() + stats.dropped() < handled {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("pipeline did not settle in time");
}

async fn stop(shutdown: CancellationToken, mut tasks: JoinSet<()>) {
    shutdown.cancel();
    while let Some(res) = tasks.join_next().await {
        res.expect("pipeline task panicked");
    }
}

/// Claim control that reads claims from a watch-fed cache and writes them to
/// the in-memory cluster. Writes only show up in reads once the test feeds
/// the matching watch event.
pub struct CachedClaims {
    cache: ResourceCache<OwnedNamespace>,
    cluster: MemoryCluster,
}

#[async_trait]
impl OwnedNamespaceControl for CachedClaims {
    async fn list_for_owner(&self, owner: &str) -> ControlResult<Vec<Arc<OwnedNamespace>>> {
        let selector = LabelSelector::everything().with(OWNER_LABEL, owner);
        Ok(self.cache.list(Some(NS), &selector).await)
    }

    async fn get(
        &self,
        owner: &str,
        namespace: &str,
    ) -> ControlResult<Option<Arc<OwnedNamespace>>> {
        let key = ObjectKey::namespaced(NS, &claim_name(owner, namespace));
        Ok(self.cache.get(&key).await)
    }

    async fn create(
        &self,
        owner: &str,
        namespace: &str,
    ) -> ControlResult<CreateOutcome<OwnedNamespace>> {
        OwnedNamespaceControl::create(&self.cluster, owner, namespace).await
    }

    async fn delete(&self, owner: &str, namespace: &str) -> ControlResult<DeleteOutcome> {
        OwnedNamespaceControl::delete(&self.cluster, owner, namespace).await
    }
}

/// DispatchUser controller with both of its watches: users feed the
/// controller directly, claim changes requeue their owner. Claims are read
/// through a cache the test drives by hand.
pub struct TenantPipeline {
    pub users: EventFeed<DispatchUser>,
    pub claims: EventFeed<OwnedNamespace>,
    pub stats: Arc<ControllerStats>,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
}

impl TenantPipeline {
    pub async fn start(cluster: &MemoryCluster) -> Self {
        let user_cache: ResourceCache<DispatchUser> = ResourceCache::new();
        let claim_cache: ResourceCache<OwnedNamespace> = ResourceCache::new();
        let (users, user_events) = feed();
        let (claims, claim_events) = feed();
        let (user_tx, user_rx) = mpsc::channel(16);
        let (owner_tx, owner_rx) = mpsc::channel(16);
        let queue = WorkQueue::new(16);
        let shutdown = CancellationToken::new();

        let mut tasks = JoinSet::new();
        tasks.spawn(user_cache.clone().run_subscription(
            user_events,
            vec![user_tx],
            shutdown.clone(),
        ));
        tasks.spawn(claim_cache.clone().run_subscription(
            claim_events,
            vec![owner_tx],
            shutdown.clone(),
        ));
        tasks.spawn(
            Dispatcher::new(Scope::Namespace(NS.to_string()), queue.clone())
                .run(user_rx, shutdown.clone()),
        );
        tasks.spawn(
            Requeue::new(
                Scope::Namespace(NS.to_string()),
                user_cache.clone(),
                queue.clone(),
                DispatchUser::owns,
            )
            .run(owner_rx, shutdown.clone()),
        );

        let reconciler = DispatchUserReconciler::new(
            Arc::new(cluster.clone()),
            Arc::new(CachedClaims {
                cache: claim_cache.clone(),
                cluster: cluster.clone(),
            }),
        );
        let controller = Controller::new("it-tenant", Arc::new(reconciler), queue, fast_retry(3))
            .wait_for(user_cache.sync_signal())
            .wait_for(claim_cache.sync_signal());
        let stats = controller.stats();
        tasks.spawn(controller.run(2, shutdown.clone()));

        users.relist(vec![]).await;
        claims.relist(vec![]).await;

        Self {
            users,
            claims,
            stats,
            shutdown,
            tasks,
        }
    }

    pub async fn settle(&self, handled: u64) {
        settle(&self.stats, handled).await;
    }

    pub async fn stop(self) {
        stop(self.shutdown, self.tasks).await;
    }
}
