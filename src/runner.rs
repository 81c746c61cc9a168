//! Controller wiring
//!
//! Installs the CRDs, builds one controller future per CRD and drives them
//! until a shutdown signal arrives. On SIGINT/SIGTERM the shared
//! cancellation token is tripped: controllers stop picking up new work,
//! in-flight reconciles stop at their next API call, and whatever is still
//! running after the configured timeout is abandoned.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, Pod, Secret};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Config as ControllerSettings;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::controller::{
    cache_group_error_policy, reconcile_cache_group, reconcile_sync, reconcile_warmup,
    sync_error_policy, warmup_error_policy, Context,
};
use crate::crd::{all_crds, CacheGroup, JuiceFsSync, WarmUp};
use crate::naming::{LABEL_APP_NAME, LABEL_WARMUP_JOB_VALUE, LABEL_WORKER_VALUE};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, FIELD_MANAGER};

/// Watcher timeout (seconds); must stay below the client read timeout (30s)
/// so idle watches are closed by the API server first.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A boxed controller loop
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Server-side apply every CRD the operator serves
pub async fn ensure_crds_installed(client: &Client) -> Result<(), Error> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in all_crds() {
        let name = crd.name_any();
        retry_with_backoff(
            &RetryConfig::with_max_attempts(5),
            &format!("install CRD {name}"),
            || {
                let crds = crds.clone();
                let params = params.clone();
                let crd = crd.clone();
                let name = name.clone();
                async move {
                    crds.patch(&name, &params, &Patch::Apply(&crd))
                        .await
                        .map(|_| ())
                        .map_err(Error::from)
                }
            },
        )
        .await?;
        info!(crd = %name, "CRD installed");
    }
    Ok(())
}

/// Install CRDs, run every controller and wait for a graceful shutdown
pub async fn run(client: Client, config: ControllerConfig) -> Result<(), Error> {
    ensure_crds_installed(&client).await?;

    let cancel = CancellationToken::new();
    let shutdown_timeout = config.shutdown_timeout();
    let ctx = Arc::new(
        Context::builder(client.clone())
            .config(config)
            .cancel(cancel.clone())
            .build(),
    );

    let signal_token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, draining controllers");
        signal_token.cancel();
    });

    let mut controllers = Vec::new();
    controllers.extend(build_cache_group_controller(client.clone(), ctx.clone(), &cancel));
    controllers.extend(build_warmup_controller(client.clone(), ctx.clone(), &cancel));
    controllers.extend(build_sync_controller(client, ctx, &cancel));

    let mut all = futures::future::join_all(controllers);
    tokio::select! {
        _ = &mut all => info!("all controllers stopped"),
        _ = async {
            cancel.cancelled().await;
            tokio::time::sleep(shutdown_timeout).await;
        } => warn!(
            timeout_secs = shutdown_timeout.as_secs(),
            "shutdown timeout elapsed, abandoning in-flight reconciles"
        ),
    }
    Ok(())
}

/// CacheGroup controller: owns worker pods, reacts to node and secret changes
pub fn build_cache_group_controller(
    client: Client,
    ctx: Arc<Context>,
    cancel: &CancellationToken,
) -> Vec<ControllerFuture> {
    let namespace = ctx.config.watch_namespace.clone();
    let groups: Api<CacheGroup> = scoped_api(&client, namespace.as_deref());
    let pods: Api<Pod> = scoped_api(&client, namespace.as_deref());
    let secrets: Api<Secret> = scoped_api(&client, namespace.as_deref());
    let nodes: Api<Node> = Api::all(client);

    info!(namespace = ?namespace, "- CacheGroup controller");

    let controller = Controller::new(groups, watcher_config())
        .with_config(settings(&ctx));
    let node_store = controller.store();
    let secret_store = controller.store();

    vec![Box::pin(
        controller
            .owns(
                pods,
                watcher_config().labels(&format!("{LABEL_APP_NAME}={LABEL_WORKER_VALUE}")),
            )
            .watches(nodes, watcher_config(), move |_node: Node| {
                node_store
                    .state()
                    .iter()
                    .map(|cg| ObjectRef::from_obj(cg.as_ref()))
                    .collect::<Vec<_>>()
            })
            .watches(secrets, watcher_config(), move |secret: Secret| {
                cache_groups_for_secret(&secret_store.state(), &secret)
            })
            .graceful_shutdown_on(shutdown_trigger(cancel))
            .run(reconcile_cache_group, cache_group_error_policy, ctx)
            .for_each(log_reconcile_result("CacheGroup")),
    )]
}

/// WarmUp controller: owns warm-up jobs
pub fn build_warmup_controller(
    client: Client,
    ctx: Arc<Context>,
    cancel: &CancellationToken,
) -> Vec<ControllerFuture> {
    let namespace = ctx.config.watch_namespace.clone();
    let warmups: Api<WarmUp> = scoped_api(&client, namespace.as_deref());
    let jobs: Api<Job> = scoped_api(&client, namespace.as_deref());

    info!(namespace = ?namespace, "- WarmUp controller");

    vec![Box::pin(
        Controller::new(warmups, watcher_config())
            .with_config(settings(&ctx))
            .owns(
                jobs,
                watcher_config().labels(&format!("{LABEL_APP_NAME}={LABEL_WARMUP_JOB_VALUE}")),
            )
            .graceful_shutdown_on(shutdown_trigger(cancel))
            .run(reconcile_warmup, warmup_error_policy, ctx)
            .for_each(log_reconcile_result("WarmUp")),
    )]
}

/// Sync controller: owns the derived credential secret
pub fn build_sync_controller(
    client: Client,
    ctx: Arc<Context>,
    cancel: &CancellationToken,
) -> Vec<ControllerFuture> {
    let namespace = ctx.config.watch_namespace.clone();
    let syncs: Api<JuiceFsSync> = scoped_api(&client, namespace.as_deref());
    let secrets: Api<Secret> = scoped_api(&client, namespace.as_deref());

    info!(namespace = ?namespace, "- Sync controller");

    vec![Box::pin(
        Controller::new(syncs, watcher_config())
            .with_config(settings(&ctx))
            .owns(secrets, watcher_config())
            .graceful_shutdown_on(shutdown_trigger(cancel))
            .run(reconcile_sync, sync_error_policy, ctx)
            .for_each(log_reconcile_result("Sync")),
    )]
}

/// CacheGroups in the secret's namespace whose `secretRef` names it
pub fn cache_groups_for_secret(
    groups: &[Arc<CacheGroup>],
    secret: &Secret,
) -> Vec<ObjectRef<CacheGroup>> {
    let name = secret.name_any();
    let namespace = secret.namespace();
    groups
        .iter()
        .filter(|cg| cg.namespace() == namespace && cg.spec.secret_ref.name == name)
        .map(|cg| ObjectRef::from_obj(cg.as_ref()))
        .collect()
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

fn settings(ctx: &Context) -> ControllerSettings {
    ControllerSettings::default().concurrency(ctx.config.concurrency)
}

/// Resolves once the token is cancelled
fn shutdown_trigger(cancel: &CancellationToken) -> impl Future<Output = ()> + Send + Sync + 'static {
    let (tx, rx) = futures::channel::oneshot::channel::<()>();
    let token = cancel.clone();
    tokio::spawn(async move {
        token.cancelled().await;
        let _ = tx.send(());
    });
    async move {
        let _ = rx.await;
    }
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
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
}

/// Create a reconcile result logger for a named controller
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => debug!(controller = controller_name, ?action, "reconciled"),
            Err(e) => error!(controller = controller_name, error = ?e, "reconciliation error"),
        }
        std::future::ready(())
    }
}
