//! CacheGroup reconciliation
//!
//! One pass reads the CacheGroup, its credential secret, the cluster nodes
//! and the existing workers, builds the desired worker for every expected
//! node, lets [`plan_rollout`] decide what to change, applies the plan and
//! reports progress on status. Deletion is gated by a finalizer until every
//! worker is gone.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::rollout::{is_terminating, plan_rollout, RolloutPlan, WorkerAction};
use super::{backoff_error_policy, Context};
use crate::builder::{fields_for_node, inverted_resources, selector_matches, WorkerBuilder};
use crate::crd::{
    condition_types, remove_condition, set_condition, CacheGroup, CacheGroupPhase,
    CacheGroupStatus, Condition, ConditionStatus,
};
use crate::error::{ignore_already_exists, ignore_not_found};
use crate::events::{actions, reasons};
use crate::naming::{object_key, worker_selector, ANNOTATION_BACKUP_WORKER, FINALIZER};
use crate::secret::Credentials;
use crate::Error;

/// Reconcile a CacheGroup
#[instrument(skip(cg, ctx), fields(cache_group = %cg.name_any(), namespace = ?cg.namespace()))]
pub async fn reconcile(cg: Arc<CacheGroup>, ctx: Arc<Context>) -> Result<Action, Error> {
    let action = reconcile_inner(&cg, &ctx).await?;
    ctx.backoff.reset(&object_key(cg.as_ref()));
    Ok(action)
}

/// Requeue a failed CacheGroup reconcile on its own backoff
pub fn error_policy(cg: Arc<CacheGroup>, error: &Error, ctx: Arc<Context>) -> Action {
    backoff_error_policy("CacheGroup", cg.as_ref(), error, &ctx)
}

async fn reconcile_inner(cg: &CacheGroup, ctx: &Context) -> Result<Action, Error> {
    let namespace = cg.namespace().unwrap_or_default();
    let name = cg.name_any();

    if cg.is_being_deleted() {
        return teardown(cg, ctx, &namespace, &name).await;
    }

    if !cg.finalizers().iter().any(|f| f == FINALIZER) {
        let mut finalizers = cg.finalizers().to_vec();
        finalizers.push(FINALIZER.to_string());
        ctx.kube
            .set_cache_group_finalizers(&namespace, &name, finalizers)
            .await?;
        debug!("added finalizer");
    }

    let secret_name = &cg.spec.secret_ref.name;
    let Some(secret) = ctx.kube.get_secret(&namespace, secret_name).await? else {
        let err = Error::missing_secret(object_key(cg), secret_name.clone());
        warn!(secret = %secret_name, "credential secret not found");
        return spec_problem(
            cg,
            ctx,
            reasons::SECRET_NOT_FOUND,
            err.to_string(),
            Action::requeue(ctx.config.missing_secret_requeue),
        )
        .await;
    };
    let credentials = Credentials::from_secret(&secret);

    let observed = ctx.kube.list_pods(&namespace, &worker_selector(&name)).await?;
    let nodes = ctx.kube.list_nodes().await?;
    let expected = expected_nodes(cg, &nodes, &observed);

    let desired = match desired_workers(cg, &credentials, &expected) {
        Ok(desired) => desired,
        Err(e) if e.is_spec_error() => {
            warn!(error = %e, "worker spec cannot be built");
            return spec_problem(
                cg,
                ctx,
                reasons::VALIDATION_FAILED,
                e.to_string(),
                Action::requeue(ctx.config.invalid_spec_requeue),
            )
            .await;
        }
        Err(e) => return Err(e),
    };

    let plan = plan_rollout(&name, &desired, &observed, &cg.spec.update_strategy);
    debug!(
        expected = plan.expected,
        ready = plan.ready,
        drifted = plan.drifted,
        actions = plan.actions.len(),
        "planned rollout"
    );

    for action in &plan.actions {
        if ctx.is_shutting_down() {
            info!("shutdown in progress, leaving the rollout for the next run");
            return Ok(Action::await_change());
        }
        apply(cg, ctx, &namespace, action).await?;
    }

    let inverted = desired_inverted_resources(&desired);
    let status = build_status(cg, &plan, &inverted, ctx);
    publish_transitions(cg, ctx, &status, &inverted).await;

    if cg.status.as_ref() != Some(&status) {
        ignore_not_found(
            ctx.kube
                .patch_cache_group_status(&namespace, &name, &status)
                .await,
        )?;
    }

    info!(phase = %status.phase, ready = %status.ready_str, "reconciled");
    Ok(match status.phase {
        CacheGroupPhase::Progressing => Action::requeue(ctx.config.progressing_requeue),
        CacheGroupPhase::Ready | CacheGroupPhase::Pending => Action::await_change(),
    })
}

/// Delete every worker, wait for them to disappear, then drop the finalizer
async fn teardown(
    cg: &CacheGroup,
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<Action, Error> {
    if !cg.finalizers().iter().any(|f| f == FINALIZER) {
        return Ok(Action::await_change());
    }

    let workers = ctx.kube.list_pods(namespace, &worker_selector(name)).await?;
    if !workers.is_empty() {
        for pod in workers.iter().filter(|p| !is_terminating(p)) {
            ignore_not_found(ctx.kube.delete_pod(namespace, &pod.name_any()).await)?;
        }
        info!(remaining = workers.len(), "waiting for workers to terminate");
        return Ok(Action::requeue(ctx.config.teardown_requeue));
    }

    let finalizers: Vec<String> = cg
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != FINALIZER)
        .cloned()
        .collect();
    ignore_not_found(
        ctx.kube
            .set_cache_group_finalizers(namespace, name, finalizers)
            .await,
    )?;
    info!("workers removed, finalizer released");
    Ok(Action::await_change())
}

/// Nodes that should run a worker
///
/// A node must match the template's node selector. An unschedulable node
/// keeps the worker it already has but does not receive a new one.
fn expected_nodes<'a>(cg: &CacheGroup, nodes: &'a [Node], observed: &[Pod]) -> Vec<&'a Node> {
    let hosting: BTreeSet<&str> = observed
        .iter()
        .filter(|p| !is_terminating(p))
        .filter_map(|p| p.spec.as_ref()?.node_name.as_deref())
        .collect();
    let selector = cg.spec.worker.template.node_selector.as_ref();

    nodes
        .iter()
        .filter(|node| selector_matches(selector, node.labels()))
        .filter(|node| {
            let unschedulable = node
                .spec
                .as_ref()
                .and_then(|s| s.unschedulable)
                .unwrap_or(false);
            !unschedulable || hosting.contains(node.name_any().as_str())
        })
        .collect()
}

fn desired_workers(
    cg: &CacheGroup,
    credentials: &Credentials,
    nodes: &[&Node],
) -> Result<BTreeMap<String, Pod>, Error> {
    nodes
        .iter()
        .map(|node| {
            let node_name = node.name_any();
            let fields = fields_for_node(&cg.spec.worker, &node_name, node.labels());
            let pod = WorkerBuilder::new(cg, credentials, &node_name, &fields)?.build()?;
            Ok((node_name, pod))
        })
        .collect()
}

fn desired_inverted_resources(desired: &BTreeMap<String, Pod>) -> Vec<String> {
    desired
        .values()
        .filter_map(|pod| pod.spec.as_ref())
        .flat_map(|spec| spec.containers.iter())
        .filter_map(|c| c.resources.as_ref())
        .flat_map(inverted_resources)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

async fn apply(
    cg: &CacheGroup,
    ctx: &Context,
    namespace: &str,
    action: &WorkerAction,
) -> Result<(), Error> {
    let object = cg.object_ref(&());
    match action {
        WorkerAction::Create(pod) => {
            let worker = pod.name_any();
            ignore_already_exists(ctx.kube.create_pod(namespace, pod).await)?;
            info!(%worker, "created worker");
            ctx.events
                .publish(
                    &object,
                    EventType::Normal,
                    reasons::WORKER_CREATED,
                    actions::CREATE,
                    Some(format!("Created worker {worker}")),
                )
                .await;
        }
        WorkerAction::Annotate { pod, key } => {
            ignore_not_found(ctx.kube.annotate_pod(namespace, pod, key, "true").await)?;
            debug!(worker = %pod, annotation = %key, "annotated worker");
            if *key == ANNOTATION_BACKUP_WORKER {
                ctx.events
                    .publish(
                        &object,
                        EventType::Normal,
                        reasons::WORKER_REPLACING,
                        actions::ROLL,
                        Some(format!("Keeping {pod} as backup while its replacement starts")),
                    )
                    .await;
            }
        }
        WorkerAction::Unannotate { pod, key } => {
            ignore_not_found(ctx.kube.remove_pod_annotation(namespace, pod, key).await)?;
            debug!(worker = %pod, annotation = %key, "cleared worker annotation");
        }
        WorkerAction::Delete { pod } => {
            ignore_not_found(ctx.kube.delete_pod(namespace, pod).await)?;
            info!(worker = %pod, "deleted worker");
            ctx.events
                .publish(
                    &object,
                    EventType::Normal,
                    reasons::WORKER_DELETED,
                    actions::DELETE,
                    Some(format!("Deleted worker {pod}")),
                )
                .await;
        }
    }
    Ok(())
}

fn build_status(
    cg: &CacheGroup,
    plan: &RolloutPlan,
    inverted: &[String],
    ctx: &Context,
) -> CacheGroupStatus {
    let settled = plan.is_settled();
    let phase = if plan.expected == 0 && settled {
        CacheGroupPhase::Pending
    } else if plan.expected > 0 && plan.ready == plan.expected && settled {
        CacheGroupPhase::Ready
    } else {
        CacheGroupPhase::Progressing
    };

    let mut status = cg.status.clone().unwrap_or_default();
    let ready_condition = match phase {
        CacheGroupPhase::Ready => Condition::new(
            condition_types::READY,
            ConditionStatus::True,
            "WorkersReady",
            format!("{}/{} workers ready", plan.ready, plan.expected),
        ),
        CacheGroupPhase::Pending => Condition::new(
            condition_types::READY,
            ConditionStatus::False,
            "NoEligibleNodes",
            "no node matches the worker node selector",
        ),
        CacheGroupPhase::Progressing => Condition::new(
            condition_types::READY,
            ConditionStatus::False,
            "WorkersProgressing",
            format!("{}/{} workers ready", plan.ready, plan.expected),
        ),
    };
    set_condition(&mut status.conditions, ready_condition.at(ctx.now()));

    if inverted.is_empty() {
        remove_condition(&mut status.conditions, condition_types::RESOURCES_INVERTED);
    } else {
        set_condition(
            &mut status.conditions,
            Condition::new(
                condition_types::RESOURCES_INVERTED,
                ConditionStatus::True,
                "LimitsBelowRequests",
                format!("worker limits are below requests for {}", inverted.join(", ")),
            )
            .at(ctx.now()),
        );
    }

    status.phase = phase;
    status.ready_worker = plan.ready;
    status.expect_worker = plan.expected;
    status.ready_str = format!("{}/{}", plan.ready, plan.expected);
    status.cache_group = cg.cache_group_tag();
    status.back_up_worker = plan.backup_workers;
    status.waiting_deleted_workers = plan.waiting_deleted.clone();
    status.observed_generation = cg.metadata.generation;
    status
}

async fn publish_transitions(
    cg: &CacheGroup,
    ctx: &Context,
    status: &CacheGroupStatus,
    inverted: &[String],
) {
    let previous = cg.status.as_ref();
    let object = cg.object_ref(&());

    let was_inverted = previous
        .map(|s| {
            s.conditions
                .iter()
                .any(|c| c.type_ == condition_types::RESOURCES_INVERTED)
        })
        .unwrap_or(false);
    if !inverted.is_empty() && !was_inverted {
        warn!(resources = ?inverted, "worker limits are below requests");
        ctx.events
            .publish(
                &object,
                EventType::Warning,
                reasons::RESOURCES_INVERTED,
                actions::RECONCILE,
                Some(format!("Worker limits are below requests for {}", inverted.join(", "))),
            )
            .await;
    }

    let was_ready = previous.map(|s| s.phase == CacheGroupPhase::Ready).unwrap_or(false);
    if status.phase == CacheGroupPhase::Ready && !was_ready {
        ctx.events
            .publish(
                &object,
                EventType::Normal,
                reasons::CACHE_GROUP_READY,
                actions::RECONCILE,
                Some(format!("{} workers ready", status.ready_str)),
            )
            .await;
    }
}

/// Record a problem only a spec or secret change can fix
async fn spec_problem(
    cg: &CacheGroup,
    ctx: &Context,
    reason: &str,
    message: String,
    requeue: Action,
) -> Result<Action, Error> {
    let mut status = cg.status.clone().unwrap_or_default();
    status.cache_group = cg.cache_group_tag();
    set_condition(
        &mut status.conditions,
        Condition::new(condition_types::READY, ConditionStatus::False, reason, &message)
            .at(ctx.now()),
    );

    if cg.status.as_ref() != Some(&status) {
        ignore_not_found(
            ctx.kube
                .patch_cache_group_status(
                    &cg.namespace().unwrap_or_default(),
                    &cg.name_any(),
                    &status,
                )
                .await,
        )?;
        ctx.events
            .publish(
                &cg.object_ref(&()),
                EventType::Warning,
                reason,
                actions::RECONCILE,
                Some(message),
            )
            .await;
    }
    Ok(requeue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::FakeCluster;
    use crate::controller::{KubeClient, MockKubeClient};
    use crate::crd::{
        CacheGroupSpec, CacheGroupUpdateStrategy, CacheGroupWorker, CacheGroupWorkerOverwrite,
        CacheGroupWorkerTemplate, RollingUpdate, SecretRef, UpdateStrategyType, WorkerFields,
    };
    use crate::error::api_error;
    use crate::events::RecordingEventPublisher;
    use crate::naming::{
        rolling_worker_name, worker_name, ANNOTATION_WAITING_DELETE_WORKER, LABEL_WORKER_HASH,
    };
    use chrono::{TimeZone, Utc};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::time::Duration;

    const NS: &str = "ns1";
    const CG: &str = "cg1";

    fn selector() -> BTreeMap<String, String> {
        BTreeMap::from([("juicefs.io/cache".to_string(), "true".to_string())])
    }

    fn sample_cache_group(tag: Option<&str>) -> CacheGroup {
        let mut cg = CacheGroup::new(
            CG,
            CacheGroupSpec {
                cache_group: tag.map(str::to_string),
                secret_ref: SecretRef {
                    name: "juicefs-secret".to_string(),
                },
                worker: CacheGroupWorker {
                    template: CacheGroupWorkerTemplate {
                        node_selector: Some(selector()),
                        fields: WorkerFields {
                            image: Some("juicedata/mount:v1".to_string()),
                            ..Default::default()
                        },
                    },
                    overwrite: Vec::new(),
                },
                update_strategy: CacheGroupUpdateStrategy::default(),
            },
        );
        cg.metadata.namespace = Some(NS.to_string());
        cg.metadata.uid = Some("uid-cg1".to_string());
        cg.metadata.generation = Some(1);
        cg
    }

    struct Harness {
        fake: Arc<FakeCluster>,
        events: Arc<RecordingEventPublisher>,
        ctx: Arc<Context>,
    }

    impl Harness {
        fn new(cg: CacheGroup) -> Self {
            let fake = Arc::new(FakeCluster::new());
            fake.add_node("n1", &[("juicefs.io/cache", "true")]);
            fake.add_node("n2", &[("juicefs.io/cache", "true")]);
            fake.add_node("n3", &[]);
            fake.add_secret(
                NS,
                "juicefs-secret",
                &[("name", "myfs"), ("token", "T"), ("access-key", "A"), ("secret-key", "S")],
            );
            fake.put_cache_group(cg);
            let events = Arc::new(RecordingEventPublisher::default());
            let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
            let ctx = Arc::new(Context::for_testing(fake.clone(), events.clone(), now));
            Self { fake, events, ctx }
        }

        async fn reconcile(&self) -> Action {
            let cg = self.fake.cache_group(NS, CG).expect("cache group exists");
            reconcile(Arc::new(cg), self.ctx.clone())
                .await
                .expect("reconcile succeeds")
        }

        fn status(&self) -> CacheGroupStatus {
            self.fake
                .cache_group(NS, CG)
                .and_then(|cg| cg.status)
                .unwrap_or_default()
        }

        fn update_spec(&self, f: impl FnOnce(&mut CacheGroupSpec)) {
            let mut cg = self.fake.cache_group(NS, CG).expect("cache group exists");
            f(&mut cg.spec);
            cg.metadata.generation = cg.metadata.generation.map(|g| g + 1);
            self.fake.put_cache_group(cg);
        }

        fn worker(&self, name: &str) -> Pod {
            self.fake.pod(NS, name).expect("worker exists")
        }
    }

    fn command_of(pod: &Pod) -> String {
        pod.spec.as_ref().unwrap().containers[0]
            .command
            .as_ref()
            .unwrap()
            .join(" ")
    }

    fn hash_of(pod: &Pod) -> String {
        pod.labels()[LABEL_WORKER_HASH].clone()
    }

    // ==========================================================================
    // Story Tests: creating workers
    // ==========================================================================

    mod creation {
        use super::*;

        /// Story: a user creates a CacheGroup with an explicit tag on two
        /// labelled nodes and gets one authenticated worker per node
        #[tokio::test]
        async fn story_happy_path_creates_one_worker_per_matching_node() {
            let h = Harness::new(sample_cache_group(Some("prod")));

            let action = h.reconcile().await;

            assert_eq!(
                h.fake.pod_names(),
                vec![worker_name(CG, "n1"), worker_name(CG, "n2")]
            );
            let pod = h.worker(&worker_name(CG, "n1"));
            let command = command_of(&pod);
            assert!(command.contains(
                "juicefs auth myfs --token ${TOKEN} --access-key A --secret-key ${SECRET_KEY}"
            ));
            assert!(command.contains("-o foreground,cache-group=prod,cache-dir=/var/jfsCache"));

            let env = pod.spec.as_ref().unwrap().containers[0].env.clone().unwrap();
            let names: Vec<&str> = env.iter().map(|e| e.name.as_str()).collect();
            assert!(names.contains(&"TOKEN"));
            assert!(names.contains(&"SECRET_KEY"));

            let status = h.status();
            assert_eq!(status.phase, CacheGroupPhase::Progressing);
            assert_eq!(status.ready_str, "0/2");
            assert_eq!(status.cache_group, "prod");
            assert_eq!(action, Action::requeue(Duration::from_secs(10)));
            assert_eq!(
                h.fake.cache_group(NS, CG).unwrap().finalizers(),
                &[FINALIZER.to_string()]
            );
        }

        /// Story: without an explicit tag the workers join `<namespace>-<name>`
        #[tokio::test]
        async fn story_default_tag_is_namespace_dash_name() {
            let h = Harness::new(sample_cache_group(None));
            h.reconcile().await;

            let command = command_of(&h.worker(&worker_name(CG, "n1")));
            assert!(command.contains("cache-group=ns1-cg1"));
            assert_eq!(h.status().cache_group, "ns1-cg1");
        }

        /// Story: an override for n2 replaces the option list instead of merging it
        #[tokio::test]
        async fn story_override_replaces_options_on_matched_node_only() {
            let mut cg = sample_cache_group(Some("prod"));
            cg.spec.worker.template.fields.opts = Some(vec!["a=1".to_string(), "b=2".to_string()]);
            cg.spec.worker.overwrite = vec![CacheGroupWorkerOverwrite {
                nodes: Some(vec!["n2".to_string()]),
                fields: WorkerFields {
                    opts: Some(vec!["a=9".to_string()]),
                    ..Default::default()
                },
                ..Default::default()
            }];
            let h = Harness::new(cg);
            h.reconcile().await;

            let n1 = command_of(&h.worker(&worker_name(CG, "n1")));
            let n2 = command_of(&h.worker(&worker_name(CG, "n2")));
            assert!(n1.contains("foreground,cache-group=prod,a=1,b=2,cache-dir=/var/jfsCache"));
            assert!(n2.contains("foreground,cache-group=prod,a=9,cache-dir=/var/jfsCache"));
            assert!(!n2.contains("b=2"));
        }

        /// Story: once the workers report Ready the group turns Ready and
        /// stops requeueing
        #[tokio::test]
        async fn story_ready_workers_make_the_group_ready() {
            let h = Harness::new(sample_cache_group(Some("prod")));
            h.reconcile().await;
            h.fake.mark_all_pods_ready();

            let action = h.reconcile().await;

            let status = h.status();
            assert_eq!(status.phase, CacheGroupPhase::Ready);
            assert_eq!(status.ready_worker, 2);
            assert_eq!(status.expect_worker, 2);
            assert_eq!(status.ready_str, "2/2");
            assert_eq!(status.observed_generation, Some(1));
            assert_eq!(action, Action::await_change());
            assert!(h.events.reasons().contains(&reasons::CACHE_GROUP_READY.to_string()));
        }

        /// Story: a second reconcile with nothing changed performs no writes
        #[tokio::test]
        async fn story_second_pass_is_a_no_op() {
            let h = Harness::new(sample_cache_group(Some("prod")));
            h.reconcile().await;
            h.fake.mark_all_pods_ready();
            h.reconcile().await;
            h.fake.clear_writes();

            h.reconcile().await;

            assert!(h.fake.writes().is_empty(), "unexpected writes: {:?}", h.fake.writes());
        }

        /// Story: recreating an identical CacheGroup yields identical names and hashes
        #[tokio::test]
        async fn story_recreated_group_reproduces_workers() {
            let first = Harness::new(sample_cache_group(Some("prod")));
            first.reconcile().await;
            let second = Harness::new(sample_cache_group(Some("prod")));
            second.reconcile().await;

            assert_eq!(first.fake.pod_names(), second.fake.pod_names());
            for name in first.fake.pod_names() {
                assert_eq!(hash_of(&first.worker(&name)), hash_of(&second.worker(&name)));
            }
        }

        /// Story: no node carries the selector label, so nothing is created
        #[tokio::test]
        async fn story_zero_matching_nodes_is_pending() {
            let mut cg = sample_cache_group(Some("prod"));
            cg.spec.worker.template.node_selector = Some(BTreeMap::from([(
                "juicefs.io/cache".to_string(),
                "nowhere".to_string(),
            )]));
            let h = Harness::new(cg);

            let action = h.reconcile().await;

            assert!(h.fake.pods().is_empty());
            assert_eq!(h.status().phase, CacheGroupPhase::Pending);
            assert_eq!(h.status().ready_str, "0/0");
            assert_eq!(action, Action::await_change());
        }

        /// Story: the default resources have limits below requests, which is
        /// surfaced once as a warning condition
        #[tokio::test]
        async fn story_inverted_default_resources_are_reported() {
            let h = Harness::new(sample_cache_group(Some("prod")));
            h.reconcile().await;
            h.reconcile().await;

            let condition = h
                .status()
                .conditions
                .into_iter()
                .find(|c| c.type_ == condition_types::RESOURCES_INVERTED)
                .expect("inverted condition");
            assert!(condition.message.contains("cpu"));
            assert!(condition.message.contains("memory"));
            let warnings = h
                .events
                .reasons()
                .into_iter()
                .filter(|r| r == reasons::RESOURCES_INVERTED)
                .count();
            assert_eq!(warnings, 1);
        }
    }

    // ==========================================================================
    // Story Tests: spec problems
    // ==========================================================================

    mod spec_problems {
        use super::*;

        /// Story: the secret does not exist yet; the group reports it and retries
        #[tokio::test]
        async fn story_missing_secret_sets_condition_and_requeues() {
            let mut cg = sample_cache_group(Some("prod"));
            cg.spec.secret_ref.name = "absent".to_string();
            let h = Harness::new(cg);

            let action = h.reconcile().await;

            assert!(h.fake.pods().is_empty());
            assert_eq!(action, Action::requeue(Duration::from_secs(30)));
            let ready = h
                .status()
                .conditions
                .into_iter()
                .find(|c| c.type_ == condition_types::READY)
                .expect("ready condition");
            assert_eq!(ready.status, ConditionStatus::False);
            assert_eq!(ready.reason, reasons::SECRET_NOT_FOUND);
            assert_eq!(h.events.reasons(), vec![reasons::SECRET_NOT_FOUND.to_string()]);

            h.fake.clear_writes();
            h.reconcile().await;
            assert!(h.fake.writes().is_empty());
            assert_eq!(h.events.reasons().len(), 1);
        }

        /// Story: a secret without the volume name cannot produce workers
        #[tokio::test]
        async fn story_secret_without_volume_name_waits_for_a_fix() {
            let h = Harness::new(sample_cache_group(Some("prod")));
            h.fake.add_secret(NS, "juicefs-secret", &[("token", "T")]);

            let action = h.reconcile().await;

            assert!(h.fake.pods().is_empty());
            assert_eq!(action, Action::requeue(Duration::from_secs(60)));
            assert_eq!(h.events.reasons(), vec![reasons::VALIDATION_FAILED.to_string()]);
        }
    }

    // ==========================================================================
    // Story Tests: rolling updates
    // ==========================================================================

    mod rolling {
        use super::*;

        async fn ready_group(h: &Harness) {
            h.reconcile().await;
            h.fake.mark_all_pods_ready();
            h.reconcile().await;
            assert_eq!(h.status().phase, CacheGroupPhase::Ready);
            h.fake.clear_writes();
        }

        fn set_image(h: &Harness, image: &str) {
            h.update_spec(|spec| {
                spec.worker.template.fields.image = Some(image.to_string());
            });
        }

        /// Story: an image change rotates workers one node at a time,
        /// keeping the old worker as a backup until its replacement is Ready
        #[tokio::test]
        async fn story_image_change_rotates_one_node_at_a_time() {
            let h = Harness::new(sample_cache_group(Some("prod")));
            ready_group(&h).await;
            set_image(&h, "juicedata/mount:v2");

            let n1 = worker_name(CG, "n1");
            let n1_rolling = rolling_worker_name(CG, "n1");
            let n2 = worker_name(CG, "n2");
            let n2_rolling = rolling_worker_name(CG, "n2");

            h.reconcile().await;
            assert_eq!(
                h.fake.writes()[..2],
                [
                    format!("annotate pod {n1} {ANNOTATION_BACKUP_WORKER}"),
                    format!("create pod {n1_rolling}"),
                ]
            );
            assert!(h.fake.pod(NS, &n2_rolling).is_none());
            assert_eq!(h.status().phase, CacheGroupPhase::Progressing);
            assert_eq!(h.status().back_up_worker, 1);

            // Replacement still starting: nothing more may happen
            h.fake.clear_writes();
            h.reconcile().await;
            assert!(h
                .fake
                .writes()
                .iter()
                .all(|w| w.starts_with("status")));

            h.fake.set_pod_ready(NS, &n1_rolling, true);
            h.fake.clear_writes();
            h.reconcile().await;
            let writes = h.fake.writes();
            assert_eq!(
                writes[..4],
                [
                    format!("annotate pod {n1} {ANNOTATION_WAITING_DELETE_WORKER}"),
                    format!("delete pod {n1}"),
                    format!("annotate pod {n2} {ANNOTATION_BACKUP_WORKER}"),
                    format!("create pod {n2_rolling}"),
                ]
            );
            assert_eq!(h.status().waiting_deleted_workers, vec![n1.clone()]);

            h.fake.set_pod_ready(NS, &n2_rolling, true);
            h.reconcile().await;
            h.reconcile().await;

            assert_eq!(h.fake.pod_names(), vec![n1_rolling, n2_rolling]);
            let status = h.status();
            assert_eq!(status.phase, CacheGroupPhase::Ready);
            assert!(status.waiting_deleted_workers.is_empty());
            assert_eq!(status.back_up_worker, 0);
            assert!(h.events.reasons().contains(&reasons::WORKER_REPLACING.to_string()));
        }

        /// Story: maxUnavailable=0 freezes rotation and leaves the group Progressing
        #[tokio::test]
        async fn story_zero_max_unavailable_never_rotates() {
            let h = Harness::new(sample_cache_group(Some("prod")));
            ready_group(&h).await;
            h.update_spec(|spec| {
                spec.worker.template.fields.image = Some("juicedata/mount:v2".to_string());
                spec.update_strategy.rolling_update = Some(RollingUpdate {
                    max_unavailable: Some(0),
                });
            });

            let action = h.reconcile().await;
            h.reconcile().await;

            assert_eq!(h.fake.pods().len(), 2);
            assert!(h.fake.writes().iter().all(|w| w.starts_with("status")));
            assert_eq!(h.status().phase, CacheGroupPhase::Progressing);
            assert_eq!(action, Action::requeue(Duration::from_secs(10)));
        }

        /// Story: OnDelete leaves drifted workers alone until a user deletes one
        #[tokio::test]
        async fn story_on_delete_replaces_only_deleted_workers() {
            let h = Harness::new(sample_cache_group(Some("prod")));
            ready_group(&h).await;
            h.update_spec(|spec| {
                spec.worker.template.fields.image = Some("juicedata/mount:v2".to_string());
                spec.update_strategy.type_ = UpdateStrategyType::OnDelete;
            });

            h.reconcile().await;
            assert!(h.fake.writes().iter().all(|w| !w.contains("pod")));
            assert_eq!(h.status().phase, CacheGroupPhase::Ready);

            let old_hash = hash_of(&h.worker(&worker_name(CG, "n1")));
            h.fake.delete_pod(NS, &worker_name(CG, "n1")).await.unwrap();
            h.reconcile().await;

            let new_hash = hash_of(&h.worker(&worker_name(CG, "n1")));
            assert_ne!(old_hash, new_hash);
        }
    }

    // ==========================================================================
    // Story Tests: node membership and teardown
    // ==========================================================================

    mod membership {
        use super::*;

        /// Story: a cordoned node keeps its worker but a fresh group skips it
        #[tokio::test]
        async fn story_unschedulable_node_keeps_existing_worker() {
            let h = Harness::new(sample_cache_group(Some("prod")));
            h.reconcile().await;
            h.fake.add_node_with("n2", &[("juicefs.io/cache", "true")], true);
            h.fake.add_node_with("n4", &[("juicefs.io/cache", "true")], true);

            h.reconcile().await;

            assert_eq!(
                h.fake.pod_names(),
                vec![worker_name(CG, "n1"), worker_name(CG, "n2")]
            );
            assert_eq!(h.status().expect_worker, 2);
        }

        /// Story: a node leaving the cluster takes its worker with it
        #[tokio::test]
        async fn story_removed_node_retires_its_worker() {
            let h = Harness::new(sample_cache_group(Some("prod")));
            h.reconcile().await;
            h.fake.remove_node("n2");

            h.reconcile().await;

            assert_eq!(h.fake.pod_names(), vec![worker_name(CG, "n1")]);
            assert_eq!(h.status().expect_worker, 1);
        }

        /// Story: deleting the group removes every worker before the
        /// finalizer is released
        #[tokio::test]
        async fn story_teardown_removes_workers_then_finalizer() {
            let h = Harness::new(sample_cache_group(Some("prod")));
            h.reconcile().await;
            let mut cg = h.fake.cache_group(NS, CG).unwrap();
            cg.metadata.deletion_timestamp = Some(Time(Utc::now()));
            h.fake.put_cache_group(cg);

            let action = h.reconcile().await;
            assert!(h.fake.pods().is_empty());
            assert_eq!(action, Action::requeue(Duration::from_secs(5)));
            assert!(h.fake.cache_group(NS, CG).is_some());

            h.reconcile().await;
            assert!(h.fake.cache_group(NS, CG).is_none());
        }

        /// Story: shutdown stops a pass before it touches any worker
        #[tokio::test]
        async fn story_shutdown_stops_before_writing_workers() {
            let h = Harness::new(sample_cache_group(Some("prod")));
            h.ctx.cancel.cancel();

            h.reconcile().await;

            assert!(h.fake.pods().is_empty());
        }
    }

    // ==========================================================================
    // Story Tests: platform failures
    // ==========================================================================

    mod failures {
        use super::*;

        fn with_finalizer() -> CacheGroup {
            let mut cg = sample_cache_group(Some("prod"));
            cg.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
            cg
        }

        /// Story: the API server fails while reading the secret; the error
        /// surfaces and the retry delay grows per object
        #[tokio::test]
        async fn story_api_failure_backs_off_exponentially() {
            let mut mock = MockKubeClient::new();
            mock.expect_get_secret()
                .returning(|_, _| Err(api_error(500, "InternalError")));
            let ctx = Arc::new(Context::for_testing(
                Arc::new(mock),
                Arc::new(RecordingEventPublisher::default()),
                Utc::now(),
            ));
            let cg = Arc::new(with_finalizer());

            let err = reconcile(cg.clone(), ctx.clone()).await.unwrap_err();
            assert!(err.is_retryable());

            assert_eq!(
                error_policy(cg.clone(), &err, ctx.clone()),
                Action::requeue(Duration::from_secs(5))
            );
            assert_eq!(
                error_policy(cg, &err, ctx),
                Action::requeue(Duration::from_secs(10))
            );
        }

        /// Story: a worker created by a concurrent pass is not an error
        #[tokio::test]
        async fn story_already_existing_worker_is_tolerated() {
            let mut mock = MockKubeClient::new();
            mock.expect_get_secret().returning(|_, _| {
                let mut secret = k8s_openapi::api::core::v1::Secret::default();
                secret.data = Some(BTreeMap::from([(
                    "name".to_string(),
                    k8s_openapi::ByteString(b"myfs".to_vec()),
                )]));
                Ok(Some(secret))
            });
            mock.expect_list_pods().returning(|_, _| Ok(Vec::new()));
            mock.expect_list_nodes().returning(|| {
                let mut node = Node::default();
                node.metadata.name = Some("n1".to_string());
                node.metadata.labels = Some(selector());
                Ok(vec![node])
            });
            mock.expect_create_pod()
                .times(1)
                .returning(|_, _| Err(api_error(409, "AlreadyExists")));
            mock.expect_patch_cache_group_status()
                .times(1)
                .returning(|_, _, _| Ok(()));
            let ctx = Arc::new(Context::for_testing(
                Arc::new(mock),
                Arc::new(RecordingEventPublisher::default()),
                Utc::now(),
            ));

            let action = reconcile(Arc::new(with_finalizer()), ctx).await.unwrap();
            assert_eq!(action, Action::requeue(Duration::from_secs(10)));
        }

        /// Story: an object that vanishes mid-failure stops being tracked
        #[tokio::test]
        async fn story_not_found_forgets_the_backoff() {
            let ctx = Arc::new(Context::for_testing(
                Arc::new(MockKubeClient::new()),
                Arc::new(RecordingEventPublisher::default()),
                Utc::now(),
            ));
            let cg = Arc::new(with_finalizer());

            error_policy(cg.clone(), &api_error(500, "InternalError"), ctx.clone());
            assert_eq!(ctx.backoff.tracked(), 1);

            let action = error_policy(cg, &api_error(404, "NotFound"), ctx.clone());
            assert_eq!(action, Action::requeue(Duration::from_secs(5)));
            assert_eq!(ctx.backoff.tracked(), 0);
        }

        #[rstest::rstest]
        #[case::validation_error(Error::validation("bad spec"))]
        #[case::missing_secret(Error::missing_secret("cg1", "creds"))]
        #[case::internal_error(Error::internal("boom"))]
        fn error_policy_requeues_with_initial_backoff(#[case] error: Error) {
            let ctx = Arc::new(Context::for_testing(
                Arc::new(MockKubeClient::new()),
                Arc::new(RecordingEventPublisher::default()),
                Utc::now(),
            ));

            let action = error_policy(Arc::new(with_finalizer()), &error, ctx);
            assert_eq!(action, Action::requeue(Duration::from_secs(5)));
        }
    }
}
