use std::fmt::Debug;
use std::sync::Arc;

use futures_util::Stream;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::ResourceCache;
use crate::config::DispatchConfig;
use crate::controller::{Controller, RetryPolicy};
use crate::controls::{
    KubeAccessBindingControl, KubeOwnedNamespaceControl, KubeServiceAccountControl,
};
use crate::crd::{DispatchUser, OwnedNamespace};
use crate::dispatch::{Dispatcher, Requeue, Scope};
use crate::queue::WorkQueue;
use crate::reconciler::{DispatchUserReconciler, OwnedNamespaceReconciler};

/// Watch stream for `api`, reconnecting with the watcher's default backoff.
pub fn watch<K>(
    api: Api<K>,
) -> impl Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send + 'static
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    watcher(api, watcher::Config::default()).default_backoff()
}

/// Start every cache, dispatcher and controller and wait until `shutdown`
/// fires and they have all stopped.
pub async fn run_all(
    client: Client,
    cfg: DispatchConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let ns = cfg.namespace.clone();
    let users: ResourceCache<DispatchUser> = ResourceCache::new();
    let claims: ResourceCache<OwnedNamespace> = ResourceCache::new();
    let accounts: ResourceCache<ServiceAccount> = ResourceCache::new();

    let (user_tx, user_rx) = mpsc::channel(cfg.queue_capacity);
    let (claim_tx, claim_rx) = mpsc::channel(cfg.queue_capacity);
    let (owner_tx, owner_rx) = mpsc::channel(cfg.queue_capacity);

    let mut tasks = JoinSet::new();
    spawn_named(
        &mut tasks,
        "dispatchuser cache",
        users.clone().run_subscription(
            watch(Api::<DispatchUser>::all(client.clone())),
            vec![user_tx],
            shutdown.clone(),
        ),
    );
    // Claim changes feed the claim controller and also requeue the owning
    // user, whose last pass may have read the claims before they landed.
    spawn_named(
        &mut tasks,
        "ownednamespace cache",
        claims.clone().run_subscription(
            watch(Api::<OwnedNamespace>::all(client.clone())),
            vec![claim_tx, owner_tx],
            shutdown.clone(),
        ),
    );
    // Tenant accounts are only ever read, never reconciled on their own.
    spawn_named(
        &mut tasks,
        "serviceaccount cache",
        accounts.clone().run_subscription(
            watch(Api::<ServiceAccount>::namespaced(client.clone(), &ns)),
            Vec::new(),
            shutdown.clone(),
        ),
    );

    let user_queue = WorkQueue::new(cfg.queue_capacity);
    let claim_queue = WorkQueue::new(cfg.queue_capacity);
    spawn_named(
        &mut tasks,
        "dispatchuser dispatcher",
        Dispatcher::new(Scope::Namespace(ns.clone()), user_queue.clone())
            .run(user_rx, shutdown.clone()),
    );
    spawn_named(
        &mut tasks,
        "ownednamespace dispatcher",
        Dispatcher::new(Scope::Namespace(ns.clone()), claim_queue.clone())
            .run(claim_rx, shutdown.clone()),
    );
    spawn_named(
        &mut tasks,
        "claim owner requeue",
        Requeue::new(
            Scope::Namespace(ns.clone()),
            users.clone(),
            user_queue.clone(),
            DispatchUser::owns,
        )
        .run(owner_rx, shutdown.clone()),
    );

    let retry = RetryPolicy::from(&cfg.retry);
    let user_reconciler = DispatchUserReconciler::new(
        Arc::new(KubeServiceAccountControl::new(client.clone(), &ns, accounts.clone())),
        Arc::new(KubeOwnedNamespaceControl::new(client.clone(), &ns, claims.clone())),
    );
    let claim_reconciler = OwnedNamespaceReconciler::new(
        Arc::new(KubeAccessBindingControl::new(client)),
        &ns,
        cfg.role_ref(),
    );

    let user_controller =
        Controller::new("dispatchuser", Arc::new(user_reconciler), user_queue, retry.clone())
            .wait_for(users.sync_signal())
            .wait_for(claims.sync_signal())
            .wait_for(accounts.sync_signal());
    let claim_controller =
        Controller::new("ownednamespace", Arc::new(claim_reconciler), claim_queue, retry)
            .wait_for(claims.sync_signal());
    spawn_named(
        &mut tasks,
        "dispatchuser controller",
        user_controller.run(cfg.user_workers, shutdown.clone()),
    );
    spawn_named(
        &mut tasks,
        "ownednamespace controller",
        claim_controller.run(cfg.claim_workers, shutdown.clone()),
    );

    info!(namespace = %ns, role = %cfg.role_name, "dispatch controller running");
    supervise(tasks, shutdown).await?;
    info!("dispatch controller stopped");
    Ok(())
}

fn spawn_named<F>(tasks: &mut JoinSet<&'static str>, name: &'static str, task: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tasks.spawn(async move {
        task.await;
        name
    });
}

/// Wait for every task. A task that panics, or returns while `shutdown` has
/// not fired, takes the rest down with it.
async fn supervise(
    mut tasks: JoinSet<&'static str>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    while let Some(res) = tasks.join_next().await {
        let failure = match res {
            Err(e) => anyhow::Error::from(e),
            Ok(_) if shutdown.is_cancelled() => continue,
            Ok(name) => anyhow::anyhow!("{name} exited before shutdown"),
        };
        warn!(error = %failure, "task failed; shutting down");
        shutdown.cancel();
        tasks.shutdown().await;
        return Err(failure);
    }
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
