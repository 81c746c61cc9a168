//! Warm-up job and RBAC construction
//!
//! A warm-up job does not mount the filesystem itself. It runs `kubectl
//! exec` into a Ready cache worker and invokes `juicefs warmup` there, so the
//! blocks land in that worker's cache group. The job's service account gets
//! just enough RBAC to find and exec into worker pods.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, ServiceAccount};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use crate::crd::{WarmUp, WarmUpSpec, WarmUpTarget};
use crate::naming::{
    warmup_role_binding_name, warmup_role_name, warmup_service_account_name, JUICEFS_BINARY,
    LABEL_APP_NAME, LABEL_WARMUP, LABEL_WARMUP_JOB_VALUE, MOUNT_POINT, WARMUP_CONTAINER_NAME,
    WORKER_CONTAINER_NAME,
};
use crate::options::parse_options;
use crate::Error;

fn owner_ref(warmup: &WarmUp) -> Result<OwnerReference, Error> {
    warmup
        .controller_owner_ref(&())
        .ok_or_else(|| Error::internal_with_context("WarmUp has no UID", "warmup-builder"))
}

fn metadata(warmup: &WarmUp, name: String) -> Result<ObjectMeta, Error> {
    Ok(ObjectMeta {
        name: Some(name),
        namespace: warmup.namespace(),
        labels: Some(warmup_labels(&warmup.name_any())),
        owner_references: Some(vec![owner_ref(warmup)?]),
        ..Default::default()
    })
}

/// Labels carried by every object created for a WarmUp
pub fn warmup_labels(warmup_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_APP_NAME.to_string(), LABEL_WARMUP_JOB_VALUE.to_string()),
        (LABEL_WARMUP.to_string(), warmup_name.to_string()),
    ])
}

fn push_options(parts: &mut Vec<String>, options: &[String]) {
    for opt in parse_options(options) {
        parts.push(format!("--{}", opt.key));
        if let Some(value) = opt.value.filter(|v| !v.is_empty()) {
            parts.push(value);
        }
    }
}

fn target_argv(target: &WarmUpTarget, global_options: &[String]) -> Vec<String> {
    let path = target.path.trim_start_matches('/');
    let mut argv = vec![
        JUICEFS_BINARY.to_string(),
        "warmup".to_string(),
        if path.is_empty() {
            MOUNT_POINT.to_string()
        } else {
            format!("{MOUNT_POINT}/{path}")
        },
    ];
    if let Some(threads) = target.threads {
        argv.push("--threads".to_string());
        argv.push(threads.to_string());
    }
    push_options(&mut argv, &target.options);
    push_options(&mut argv, global_options);
    argv
}

/// One `kubectl exec` argv per target, in order
///
/// Arguments are passed straight to the process without a shell, so user
/// paths and options stay single arguments. A spec without targets warms the
/// whole filesystem.
pub fn warmup_steps(spec: &WarmUpSpec, namespace: &str, worker_pod: &str) -> Vec<Vec<String>> {
    let root = WarmUpTarget::default();
    let targets: Vec<&WarmUpTarget> = if spec.targets.is_empty() {
        vec![&root]
    } else {
        spec.targets.iter().collect()
    };

    targets
        .into_iter()
        .map(|target| {
            let mut argv: Vec<String> = [
                "kubectl",
                "exec",
                "-n",
                namespace,
                worker_pod,
                "-c",
                WORKER_CONTAINER_NAME,
                "--",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect();
            argv.extend(target_argv(target, &spec.options));
            argv
        })
        .collect()
}

/// Build a warm-up job that execs into `worker_pod`
pub fn build_warmup_job(
    warmup: &WarmUp,
    job_name: &str,
    worker_pod: &str,
    default_image: &str,
) -> Result<Job, Error> {
    let namespace = warmup.namespace().unwrap_or_default();
    let image = warmup
        .spec
        .image
        .clone()
        .filter(|i| !i.is_empty())
        .unwrap_or_else(|| default_image.to_string());

    // Init containers run one at a time and the first failure fails the
    // pod, so every target but the last becomes an init container.
    let mut containers: Vec<Container> = warmup_steps(&warmup.spec, &namespace, worker_pod)
        .into_iter()
        .enumerate()
        .map(|(i, argv)| Container {
            name: format!("{WARMUP_CONTAINER_NAME}-{i}"),
            image: Some(image.clone()),
            command: Some(argv),
            ..Default::default()
        })
        .collect();
    let mut main = containers.pop().ok_or_else(|| {
        Error::internal_with_context("warm-up has no steps", "warmup-builder")
    })?;
    main.name = WARMUP_CONTAINER_NAME.to_string();
    let init_containers = (!containers.is_empty()).then_some(containers);

    Ok(Job {
        metadata: metadata(warmup, job_name.to_string())?,
        spec: Some(JobSpec {
            backoff_limit: Some(warmup.spec.backoff_limit()),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(warmup_labels(&warmup.name_any())),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    init_containers,
                    containers: vec![main],
                    restart_policy: Some("Never".to_string()),
                    service_account_name: Some(warmup_service_account_name(&warmup.name_any())),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

/// Service account the warm-up job runs as
pub fn build_service_account(warmup: &WarmUp) -> Result<ServiceAccount, Error> {
    Ok(ServiceAccount {
        metadata: metadata(warmup, warmup_service_account_name(&warmup.name_any()))?,
        ..Default::default()
    })
}

/// Role allowing the job to find and exec into worker pods
pub fn build_role(warmup: &WarmUp) -> Result<Role, Error> {
    let rule = |resource: &str, verbs: &[&str]| PolicyRule {
        api_groups: Some(vec![String::new()]),
        resources: Some(vec![resource.to_string()]),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    };
    Ok(Role {
        metadata: metadata(warmup, warmup_role_name(&warmup.name_any()))?,
        rules: Some(vec![
            rule("pods", &["get", "list"]),
            rule("pods/exec", &["create"]),
        ]),
    })
}

/// Binding of the warm-up role to the warm-up service account
pub fn build_role_binding(warmup: &WarmUp) -> Result<RoleBinding, Error> {
    let name = warmup.name_any();
    Ok(RoleBinding {
        metadata: metadata(warmup, warmup_role_binding_name(&name))?,
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: warmup_role_name(&name),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: warmup_service_account_name(&name),
            namespace: warmup.namespace(),
            ..Default::default()
        }]),
    })
}

fn job_condition_time(job: &Job, type_: &str) -> Option<Option<DateTime<Utc>>> {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.type_ == type_ && c.status == "True")
                .map(|c| c.last_transition_time.as_ref().map(|t| t.0))
        })
}

/// Check if a Job has completed successfully
pub fn is_job_complete(job: &Job) -> bool {
    job_condition_time(job, "Complete").is_some()
}

/// Check if a Job has failed
pub fn is_job_failed(job: &Job) -> bool {
    job_condition_time(job, "Failed").is_some()
}

/// Check if a Job is neither complete nor failed
pub fn is_job_active(job: &Job) -> bool {
    !is_job_complete(job) && !is_job_failed(job)
}

/// Extract failure message from a failed Job
pub fn job_failure_message(job: &Job) -> Option<String> {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.type_ == "Failed" && c.status == "True")
                .and_then(|c| c.message.clone())
        })
}

/// When a finished Job finished, if it did
///
/// Successful jobs report `completionTime`; failed ones only carry the
/// transition time of their `Failed` condition.
pub fn job_finish_time(job: &Job) -> Option<DateTime<Utc>> {
    if let Some(t) = job.status.as_ref().and_then(|s| s.completion_time.as_ref()) {
        return Some(t.0);
    }
    job_condition_time(job, "Complete")
        .or_else(|| job_condition_time(job, "Failed"))
        .flatten()
}
