//! WarmUp reconciliation
//!
//! A one-shot WarmUp starts a single job once its CacheGroup is Ready and
//! follows it to Complete or Failed. A scheduled WarmUp starts one job per
//! cron trigger, subject to its concurrency policy. In both cases finished
//! jobs are removed once `ttlSecondsAfterFinished` has elapsed, while the
//! service account, role and binding stay until the WarmUp is deleted.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::rollout::is_pod_ready;
use super::{backoff_error_policy, Context};
use crate::builder::{
    build_role, build_role_binding, build_service_account, build_warmup_job, is_job_active,
    is_job_complete, is_job_failed, job_failure_message, job_finish_time,
};
use crate::crd::{
    condition_types, set_condition, CacheGroupPhase, ConcurrencyPolicy, Condition,
    ConditionStatus, CronPolicy, WarmUp, WarmUpPhase, WarmUpStatus,
};
use crate::error::{ignore_already_exists, ignore_not_found};
use crate::events::{actions, reasons};
use crate::naming::{
    object_key, scheduled_warmup_job_name, warmup_job_name, warmup_job_selector,
    warmup_role_binding_name, warmup_role_name, warmup_service_account_name, worker_selector,
    FINALIZER,
};
use crate::Error;

/// Reconcile a WarmUp
#[instrument(skip(wu, ctx), fields(warmup = %wu.name_any(), namespace = ?wu.namespace()))]
pub async fn reconcile(wu: Arc<WarmUp>, ctx: Arc<Context>) -> Result<Action, Error> {
    let action = reconcile_inner(&wu, &ctx).await?;
    ctx.backoff.reset(&object_key(wu.as_ref()));
    Ok(action)
}

/// Requeue a failed WarmUp reconcile on its own backoff
pub fn error_policy(wu: Arc<WarmUp>, error: &Error, ctx: Arc<Context>) -> Action {
    backoff_error_policy("WarmUp", wu.as_ref(), error, &ctx)
}

async fn reconcile_inner(wu: &WarmUp, ctx: &Context) -> Result<Action, Error> {
    let namespace = wu.namespace().unwrap_or_default();
    let name = wu.name_any();

    if wu.is_being_deleted() {
        return cleanup(wu, ctx, &namespace, &name).await;
    }

    if !wu.finalizers().iter().any(|f| f == FINALIZER) {
        let mut finalizers = wu.finalizers().to_vec();
        finalizers.push(FINALIZER.to_string());
        ctx.kube
            .set_warmup_finalizers(&namespace, &name, finalizers)
            .await?;
        debug!("added finalizer");
    }

    let jobs: Vec<Job> = ctx
        .kube
        .list_jobs(&namespace, &warmup_job_selector(&name))
        .await?
        .into_iter()
        .filter(|j| j.metadata.deletion_timestamp.is_none())
        .collect();

    match wu.spec.schedule() {
        Some(cron) => reconcile_scheduled(wu, ctx, &namespace, &name, cron, jobs).await,
        None => reconcile_once(wu, ctx, &namespace, &name, jobs).await,
    }
}

async fn reconcile_once(
    wu: &WarmUp,
    ctx: &Context,
    namespace: &str,
    name: &str,
    jobs: Vec<Job>,
) -> Result<Action, Error> {
    let mut status = wu.status.clone().unwrap_or_default();
    let job_name = warmup_job_name(name);
    let job = jobs.iter().find(|j| j.name_any() == job_name);

    if status.phase.is_terminal() {
        if status.observed_generation == wu.metadata.generation {
            let wait = match job {
                Some(job) => expire_finished(wu, ctx, namespace, job).await?,
                None => None,
            };
            return Ok(wait.map(Action::requeue).unwrap_or_else(Action::await_change));
        }

        info!(phase = %status.phase, "spec changed after the warm-up finished, running again");
        if let Some(job) = job {
            ignore_not_found(ctx.kube.delete_job(namespace, &job.name_any()).await)?;
        }
        status.phase = WarmUpPhase::Pending;
        status.observed_generation = wu.metadata.generation;
        write_status(wu, ctx, &status).await?;
        return Ok(Action::requeue(ctx.config.progressing_requeue));
    }

    if let Some(job) = job {
        track_job(wu, ctx, &mut status, job).await;
        write_status(wu, ctx, &status).await?;
        if status.phase.is_terminal() {
            let wait = expire_finished(wu, ctx, namespace, job).await?;
            return Ok(wait.map(Action::requeue).unwrap_or_else(Action::await_change));
        }
        return Ok(Action::await_change());
    }

    let Some(worker) = select_worker(wu, ctx, namespace, &mut status).await? else {
        return wait_for_cache_group(wu, ctx, &status).await;
    };
    if ctx.is_shutting_down() {
        return Ok(Action::await_change());
    }

    start_job(wu, ctx, namespace, &job_name, &worker).await?;
    status.phase = WarmUpPhase::Running;
    status.observed_generation = wu.metadata.generation;
    set_condition(
        &mut status.conditions,
        Condition::new(
            condition_types::READY,
            ConditionStatus::False,
            "JobRunning",
            format!("warm-up job {job_name} is running"),
        )
        .at(ctx.now()),
    );
    write_status(wu, ctx, &status).await?;
    Ok(Action::await_change())
}

async fn reconcile_scheduled(
    wu: &WarmUp,
    ctx: &Context,
    namespace: &str,
    name: &str,
    cron: &CronPolicy,
    mut jobs: Vec<Job>,
) -> Result<Action, Error> {
    let mut status = wu.status.clone().unwrap_or_default();
    let now = ctx.now();

    let schedule = match parse_schedule(&cron.schedule) {
        Ok(schedule) => schedule,
        Err(e) => {
            warn!(schedule = %cron.schedule, error = %e, "invalid cron schedule");
            let message = format!("invalid schedule {:?}: {e}", cron.schedule);
            set_condition(
                &mut status.conditions,
                Condition::new(
                    condition_types::READY,
                    ConditionStatus::False,
                    reasons::INVALID_SCHEDULE,
                    &message,
                )
                .at(now),
            );
            if write_status(wu, ctx, &status).await? {
                publish(
                    ctx,
                    wu,
                    EventType::Warning,
                    reasons::INVALID_SCHEDULE,
                    actions::SCHEDULE,
                    message,
                )
                .await;
            }
            return Ok(Action::requeue(ctx.config.invalid_spec_requeue));
        }
    };

    jobs.sort_by(|a, b| {
        let created = |j: &Job| j.creation_timestamp().map(|t| t.0);
        created(a)
            .cmp(&created(b))
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });

    let mut wait: Option<Duration> = None;
    for job in jobs.iter().filter(|j| !is_job_active(j)) {
        if let Some(remaining) = expire_finished(wu, ctx, namespace, job).await? {
            wait = Some(wait.map_or(remaining, |w| w.min(remaining)));
        }
    }
    if let Some(latest) = jobs.last() {
        track_job(wu, ctx, &mut status, latest).await;
    }

    let since = status
        .last_schedule_time
        .or_else(|| wu.creation_timestamp().map(|t| t.0))
        .unwrap_or(now);
    if let Some(trigger) = latest_due(&schedule, since, now) {
        let Some(worker) = select_worker(wu, ctx, namespace, &mut status).await? else {
            return wait_for_cache_group(wu, ctx, &status).await;
        };
        if ctx.is_shutting_down() {
            return Ok(Action::await_change());
        }

        let active: Vec<&Job> = jobs.iter().filter(|j| is_job_active(j)).collect();
        if cron.concurrency_policy == ConcurrencyPolicy::Forbid && !active.is_empty() {
            info!(%trigger, active = active.len(), "skipping trigger while a job is active");
            publish(
                ctx,
                wu,
                EventType::Normal,
                reasons::JOB_SKIPPED,
                actions::SCHEDULE,
                format!("Skipped trigger at {trigger}: a warm-up job is still running"),
            )
            .await;
        } else {
            if cron.concurrency_policy == ConcurrencyPolicy::Replace {
                for job in &active {
                    ignore_not_found(ctx.kube.delete_job(namespace, &job.name_any()).await)?;
                    info!(job = %job.name_any(), "replaced active job");
                }
            }
            let job_name = scheduled_warmup_job_name(name, trigger.timestamp() / 60);
            start_job(wu, ctx, namespace, &job_name, &worker).await?;
            status.phase = WarmUpPhase::Running;
        }
        status.last_schedule_time = Some(trigger);
        status.observed_generation = wu.metadata.generation;
    }

    write_status(wu, ctx, &status).await?;

    if let Some(next) = schedule.after(&now).next() {
        let until = (next - now).to_std().unwrap_or_default();
        wait = Some(wait.map_or(until, |w| w.min(until)));
    }
    Ok(wait.map(Action::requeue).unwrap_or_else(Action::await_change))
}

/// Parse a cron expression, accepting the five-field form
pub(crate) fn parse_schedule(expression: &str) -> Result<Schedule, cron::error::Error> {
    let expression = expression.trim();
    if expression.split_whitespace().count() == 5 {
        Schedule::from_str(&format!("0 {expression}"))
    } else {
        Schedule::from_str(expression)
    }
}

/// The most recent trigger in `(since, now]`
///
/// Bisects on "is there a trigger after t" instead of walking every missed
/// trigger, so a long backlog costs a logarithmic number of lookups.
fn latest_due(schedule: &Schedule, since: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let fires_after = |t: DateTime<Utc>| schedule.after(&t).next().filter(|next| *next <= now);

    // lo is a trigger; no trigger lies in (hi, now]
    let mut lo = fires_after(since)?;
    let mut hi = now;
    while hi - lo > chrono::Duration::seconds(1) {
        let mid = lo + chrono::Duration::seconds((hi - lo).num_seconds() / 2);
        match fires_after(mid) {
            Some(t) => lo = t,
            None => hi = mid,
        }
    }
    Some(fires_after(lo).unwrap_or(lo))
}

fn job_phase(job: &Job) -> WarmUpPhase {
    if is_job_complete(job) {
        WarmUpPhase::Complete
    } else if is_job_failed(job) {
        WarmUpPhase::Failed
    } else {
        WarmUpPhase::Running
    }
}

/// Fold the state of `job` into the status, publishing terminal transitions
async fn track_job(wu: &WarmUp, ctx: &Context, status: &mut WarmUpStatus, job: &Job) {
    let phase = job_phase(job);
    let job_name = job.name_any();
    let changed = status.phase != phase;

    let condition = match phase {
        WarmUpPhase::Complete => {
            status.last_complete_time = job_finish_time(job).or(status.last_complete_time);
            Condition::new(
                condition_types::READY,
                ConditionStatus::True,
                "JobComplete",
                format!("warm-up job {job_name} completed"),
            )
        }
        WarmUpPhase::Failed => Condition::new(
            condition_types::READY,
            ConditionStatus::False,
            "JobFailed",
            job_failure_message(job).unwrap_or_else(|| format!("warm-up job {job_name} failed")),
        ),
        WarmUpPhase::Running | WarmUpPhase::Pending => Condition::new(
            condition_types::READY,
            ConditionStatus::False,
            "JobRunning",
            format!("warm-up job {job_name} is running"),
        ),
    };
    set_condition(&mut status.conditions, condition.at(ctx.now()));
    status.phase = phase.clone();

    if !changed {
        return;
    }
    match phase {
        WarmUpPhase::Complete => {
            info!(job = %job_name, "warm-up complete");
            publish(
                ctx,
                wu,
                EventType::Normal,
                reasons::JOB_COMPLETE,
                actions::RECONCILE,
                format!("Warm-up job {job_name} completed"),
            )
            .await;
        }
        WarmUpPhase::Failed => {
            let message = job_failure_message(job).unwrap_or_default();
            warn!(job = %job_name, %message, "warm-up failed");
            publish(
                ctx,
                wu,
                EventType::Warning,
                reasons::JOB_FAILED,
                actions::RECONCILE,
                format!("Warm-up job {job_name} failed: {message}"),
            )
            .await;
        }
        WarmUpPhase::Running | WarmUpPhase::Pending => {}
    }
}

/// Delete a finished job whose TTL elapsed; otherwise return the time left
async fn expire_finished(
    wu: &WarmUp,
    ctx: &Context,
    namespace: &str,
    job: &Job,
) -> Result<Option<Duration>, Error> {
    let Some(ttl) = wu.spec.ttl_seconds_after_finished else {
        return Ok(None);
    };
    let Some(finished) = job_finish_time(job) else {
        return Ok(None);
    };

    let now = ctx.now();
    let expires = finished + chrono::Duration::seconds(i64::from(ttl.max(0)));
    if expires <= now {
        ignore_not_found(ctx.kube.delete_job(namespace, &job.name_any()).await)?;
        info!(job = %job.name_any(), ttl, "deleted finished job");
        Ok(None)
    } else {
        Ok(Some((expires - now).to_std().unwrap_or_default()))
    }
}

/// Pick the Ready worker with the smallest name in a Ready CacheGroup
///
/// Records the outcome as the `CacheGroupReady` condition.
async fn select_worker(
    wu: &WarmUp,
    ctx: &Context,
    namespace: &str,
    status: &mut WarmUpStatus,
) -> Result<Option<String>, Error> {
    let cg_name = &wu.spec.cache_group_name;
    let cache_group = ctx.kube.get_cache_group(namespace, cg_name).await?;

    let worker = match &cache_group {
        Some(cg)
            if cg.status.as_ref().map(|s| &s.phase) == Some(&CacheGroupPhase::Ready) =>
        {
            ctx.kube
                .list_pods(namespace, &worker_selector(cg_name))
                .await?
                .iter()
                .filter(|p| is_pod_ready(p))
                .map(|p| p.name_any())
                .min()
        }
        _ => None,
    };

    let condition = match (&cache_group, &worker) {
        (_, Some(worker)) => Condition::new(
            condition_types::CACHE_GROUP_READY,
            ConditionStatus::True,
            "CacheGroupReady",
            format!("warming through worker {worker}"),
        ),
        (None, None) => Condition::new(
            condition_types::CACHE_GROUP_READY,
            ConditionStatus::False,
            reasons::CACHE_GROUP_NOT_READY,
            format!("CacheGroup {cg_name} not found"),
        ),
        (Some(cg), None) => {
            let message = match cg.status.as_ref().map(|s| &s.phase) {
                Some(CacheGroupPhase::Ready) => format!("CacheGroup {cg_name} has no Ready worker"),
                _ => format!("CacheGroup {cg_name} is not Ready"),
            };
            Condition::new(
                condition_types::CACHE_GROUP_READY,
                ConditionStatus::False,
                reasons::CACHE_GROUP_NOT_READY,
                message,
            )
        }
    };
    set_condition(&mut status.conditions, condition.at(ctx.now()));
    Ok(worker)
}

async fn wait_for_cache_group(
    wu: &WarmUp,
    ctx: &Context,
    status: &WarmUpStatus,
) -> Result<Action, Error> {
    debug!(cache_group = %wu.spec.cache_group_name, "waiting for the cache group");
    if write_status(wu, ctx, status).await? {
        let message = status
            .conditions
            .iter()
            .find(|c| c.type_ == condition_types::CACHE_GROUP_READY)
            .map(|c| c.message.clone())
            .unwrap_or_default();
        publish(
            ctx,
            wu,
            EventType::Warning,
            reasons::CACHE_GROUP_NOT_READY,
            actions::RECONCILE,
            message,
        )
        .await;
    }
    Ok(Action::requeue(ctx.config.cache_group_wait_requeue))
}

/// Ensure the RBAC trio, then create the job
async fn start_job(
    wu: &WarmUp,
    ctx: &Context,
    namespace: &str,
    job_name: &str,
    worker: &str,
) -> Result<(), Error> {
    ignore_already_exists(
        ctx.kube
            .create_service_account(namespace, &build_service_account(wu)?)
            .await,
    )?;
    ignore_already_exists(ctx.kube.create_role(namespace, &build_role(wu)?).await)?;
    ignore_already_exists(
        ctx.kube
            .create_role_binding(namespace, &build_role_binding(wu)?)
            .await,
    )?;

    let job = build_warmup_job(wu, job_name, worker, &ctx.config.warmup_image)?;
    ignore_already_exists(ctx.kube.create_job(namespace, &job).await)?;
    info!(job = %job_name, %worker, "started warm-up job");
    publish(
        ctx,
        wu,
        EventType::Normal,
        reasons::JOB_CREATED,
        actions::CREATE,
        format!("Started warm-up job {job_name} on worker {worker}"),
    )
    .await;
    Ok(())
}

/// Delete every job and the RBAC trio, then release the finalizer
async fn cleanup(wu: &WarmUp, ctx: &Context, namespace: &str, name: &str) -> Result<Action, Error> {
    if !wu.finalizers().iter().any(|f| f == FINALIZER) {
        return Ok(Action::await_change());
    }

    for job in ctx.kube.list_jobs(namespace, &warmup_job_selector(name)).await? {
        ignore_not_found(ctx.kube.delete_job(namespace, &job.name_any()).await)?;
    }
    ignore_not_found(
        ctx.kube
            .delete_role_binding(namespace, &warmup_role_binding_name(name))
            .await,
    )?;
    ignore_not_found(ctx.kube.delete_role(namespace, &warmup_role_name(name)).await)?;
    ignore_not_found(
        ctx.kube
            .delete_service_account(namespace, &warmup_service_account_name(name))
            .await,
    )?;

    let finalizers: Vec<String> = wu
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != FINALIZER)
        .cloned()
        .collect();
    ignore_not_found(ctx.kube.set_warmup_finalizers(namespace, name, finalizers).await)?;
    info!("warm-up resources removed, finalizer released");
    Ok(Action::await_change())
}

/// Patch the status when it differs from the stored one
async fn write_status(wu: &WarmUp, ctx: &Context, status: &WarmUpStatus) -> Result<bool, Error> {
    if wu.status.as_ref() == Some(status) {
        return Ok(false);
    }
    ignore_not_found(
        ctx.kube
            .patch_warmup_status(&wu.namespace().unwrap_or_default(), &wu.name_any(), status)
            .await,
    )?;
    Ok(true)
}

async fn publish(
    ctx: &Context,
    wu: &WarmUp,
    type_: EventType,
    reason: &str,
    action: &str,
    note: String,
) {
    ctx.events
        .publish(&wu.object_ref(&()), type_, reason, action, Some(note))
        .await;
}
