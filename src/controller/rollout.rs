//! Worker rollout planning
//!
//! Given the desired worker for every expected node and the workers that
//! currently exist, [`plan_rollout`] decides which pods to create, annotate
//! and delete in this pass. Planning is pure; the CacheGroup reconciler
//! applies the returned actions in order.
//!
//! Per expected node:
//! - no worker: create one under the canonical name
//! - a current worker (matching `worker-hash`): keep it, drop duplicates,
//!   clear a leftover backup mark, and once it is Ready retire every stale
//!   worker on the node
//! - only stale workers: under `RollingUpdate`, mark the Ready one as a
//!   backup and start a replacement in the other name slot; a stale worker
//!   that is not Ready is replaced outright
//!
//! Workers on nodes that are no longer expected are retired. Replacing a
//! Ready worker and retiring a Ready extraneous worker both draw from the
//! `maxUnavailable` budget, which counts not-Ready workers.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::crd::{CacheGroupUpdateStrategy, UpdateStrategyType};
use crate::naming::{
    replacement_worker_name, ANNOTATION_BACKUP_WORKER, ANNOTATION_WAITING_DELETE_WORKER,
    LABEL_WORKER_HASH,
};

/// One change to apply to the cluster
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerAction {
    /// Create this pod
    Create(Box<Pod>),
    /// Set annotation `key=true` on the named pod
    Annotate {
        /// Pod name
        pod: String,
        /// Annotation key
        key: &'static str,
    },
    /// Remove annotation `key` from the named pod
    Unannotate {
        /// Pod name
        pod: String,
        /// Annotation key
        key: &'static str,
    },
    /// Delete the named pod
    Delete {
        /// Pod name
        pod: String,
    },
}

/// Outcome of planning one pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RolloutPlan {
    /// Actions in application order
    pub actions: Vec<WorkerAction>,
    /// Number of expected nodes
    pub expected: u32,
    /// Expected nodes served by at least one Ready worker
    pub ready: u32,
    /// Expected nodes whose workers still run an outdated spec under `RollingUpdate`
    pub drifted: u32,
    /// Stale workers kept alive while their replacement starts
    pub backup_workers: u32,
    /// Workers marked for deletion, including those still terminating
    pub waiting_deleted: Vec<String>,
    /// Progress is blocked on something outside this pass
    pub blocked: bool,
}

impl RolloutPlan {
    /// Nothing to do and nothing outstanding
    pub fn is_settled(&self) -> bool {
        self.actions.is_empty() && !self.blocked && self.drifted == 0
    }
}

/// Ready condition is True and the pod is not being deleted
pub fn is_pod_ready(pod: &Pod) -> bool {
    !is_terminating(pod)
        && pod
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false)
}

/// The pod has a deletion timestamp
pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

fn pod_hash(pod: &Pod) -> Option<&str> {
    pod.labels().get(LABEL_WORKER_HASH).map(String::as_str)
}

fn pod_node(pod: &Pod) -> &str {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .unwrap_or_default()
}

fn has_annotation(pod: &Pod, key: &str) -> bool {
    pod.annotations().contains_key(key)
}

/// Ready pods first, then by name
fn availability_order(a: &&Pod, b: &&Pod) -> std::cmp::Ordering {
    is_pod_ready(b)
        .cmp(&is_pod_ready(a))
        .then_with(|| a.name_any().cmp(&b.name_any()))
}

struct Planner<'a> {
    cache_group: &'a str,
    budget: u32,
    unavailable: u32,
    occupied: BTreeSet<String>,
    waiting_deleted: BTreeSet<String>,
    plan: RolloutPlan,
}

impl Planner<'_> {
    fn annotate(&mut self, pod: &Pod, key: &'static str) {
        if !has_annotation(pod, key) {
            self.plan.actions.push(WorkerAction::Annotate {
                pod: pod.name_any(),
                key,
            });
        }
    }

    fn retire(&mut self, pod: &Pod) {
        self.annotate(pod, ANNOTATION_WAITING_DELETE_WORKER);
        self.plan.actions.push(WorkerAction::Delete {
            pod: pod.name_any(),
        });
        self.occupied.insert(pod.name_any());
        self.waiting_deleted.insert(pod.name_any());
    }

    fn create_as(&mut self, desired: &Pod, name: String) {
        if self.occupied.contains(&name) {
            self.plan.blocked = true;
            return;
        }
        let mut pod = desired.clone();
        pod.metadata.name = Some(name.clone());
        self.occupied.insert(name);
        self.plan.actions.push(WorkerAction::Create(Box::new(pod)));
    }

    fn has_budget(&self) -> bool {
        self.unavailable < self.budget
    }

    fn expected_node(&mut self, node: &str, desired: &Pod, pods: Vec<&Pod>, rolling: bool) {
        let want = pod_hash(desired);
        let (mut current, mut stale): (Vec<&Pod>, Vec<&Pod>) =
            pods.into_iter().partition(|p| pod_hash(p) == want);
        current.sort_by(availability_order);
        stale.sort_by(availability_order);

        if let Some((keep, duplicates)) = current.split_first() {
            for dup in duplicates {
                self.retire(dup);
            }
            // an undone rollout brings a backup back to the current spec
            if has_annotation(keep, ANNOTATION_BACKUP_WORKER) {
                self.plan.actions.push(WorkerAction::Unannotate {
                    pod: keep.name_any(),
                    key: ANNOTATION_BACKUP_WORKER,
                });
            }
            if is_pod_ready(keep) {
                self.plan.ready += 1;
                for old in &stale {
                    self.retire(old);
                }
            } else if !stale.is_empty() {
                if stale.iter().any(|p| is_pod_ready(p)) {
                    self.plan.ready += 1;
                }
                for old in &stale {
                    self.annotate(old, ANNOTATION_BACKUP_WORKER);
                    self.plan.backup_workers += 1;
                }
            }
            return;
        }

        let Some((old, extra)) = stale.split_first() else {
            let name = desired.name_any();
            self.create_as(desired, name);
            return;
        };

        for pod in extra {
            self.retire(pod);
        }
        let old_ready = is_pod_ready(old);
        if old_ready {
            self.plan.ready += 1;
        }
        if !rolling {
            return;
        }
        self.plan.drifted += 1;
        if self.budget == 0 {
            return;
        }

        let slot = replacement_worker_name(self.cache_group, node, &old.name_any());
        if old_ready {
            if !self.has_budget() || self.occupied.contains(&slot) {
                self.plan.blocked |= self.occupied.contains(&slot);
                return;
            }
            self.annotate(old, ANNOTATION_BACKUP_WORKER);
            self.plan.backup_workers += 1;
            self.create_as(desired, slot);
            self.unavailable += 1;
        } else {
            self.retire(old);
            self.create_as(desired, slot);
        }
    }

    fn extraneous(&mut self, pods: Vec<&Pod>) {
        for pod in pods {
            if is_pod_ready(pod) {
                if !self.has_budget() {
                    self.plan.blocked = true;
                    continue;
                }
                self.unavailable += 1;
            }
            self.retire(pod);
        }
    }
}

/// Plan one reconcile pass over the workers of a CacheGroup
///
/// `desired` maps each expected node to its desired worker under the
/// canonical name; `observed` holds every existing worker of the group.
pub fn plan_rollout(
    cache_group: &str,
    desired: &BTreeMap<String, Pod>,
    observed: &[Pod],
    strategy: &CacheGroupUpdateStrategy,
) -> RolloutPlan {
    let mut live: BTreeMap<&str, Vec<&Pod>> = BTreeMap::new();
    for pod in observed.iter().filter(|p| !is_terminating(p)) {
        live.entry(pod_node(pod)).or_default().push(pod);
    }

    let unavailable = desired
        .keys()
        .filter_map(|node| live.get(node.as_str()))
        .flatten()
        .filter(|p| !is_pod_ready(p))
        .count() as u32;

    let mut planner = Planner {
        cache_group,
        budget: strategy.max_unavailable(),
        unavailable,
        occupied: observed
            .iter()
            .filter(|p| is_terminating(p))
            .map(|p| p.name_any())
            .collect(),
        waiting_deleted: observed
            .iter()
            .filter(|p| has_annotation(p, ANNOTATION_WAITING_DELETE_WORKER))
            .map(|p| p.name_any())
            .collect(),
        plan: RolloutPlan {
            expected: desired.len() as u32,
            ..Default::default()
        },
    };
    let rolling = strategy.type_ == UpdateStrategyType::RollingUpdate;

    for (node, pod) in desired {
        let pods = live.remove(node.as_str()).unwrap_or_default();
        planner.expected_node(node, pod, pods, rolling);
    }

    let mut leftovers: Vec<&Pod> = live.into_values().flatten().collect();
    leftovers.sort_by(availability_order);
    leftovers.reverse();
    planner.extraneous(leftovers);

    planner.plan.waiting_deleted = planner.waiting_deleted.into_iter().collect();
    planner.plan
}
