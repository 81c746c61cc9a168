//! In-memory cluster for reconciler scenario tests
//!
//! Implements [`KubeClient`] over plain maps. Deletes are immediate, creates
//! of an existing name fail with AlreadyExists, and every write is logged so
//! tests can assert that a pass changed nothing.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::{
    Node, NodeSpec, Pod, PodCondition, PodStatus, Secret, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::ByteString;
use kube::{Resource, ResourceExt};

use super::KubeClient;
use crate::crd::{CacheGroup, CacheGroupStatus, WarmUp, WarmUpStatus};
use crate::error::api_error;
use crate::Error;

fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .all(|pair| match pair.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(pair),
        })
}

fn not_found() -> Error {
    api_error(404, "NotFound")
}

fn already_exists() -> Error {
    api_error(409, "AlreadyExists")
}

#[derive(Default)]
struct State {
    cache_groups: BTreeMap<String, CacheGroup>,
    warmups: BTreeMap<String, WarmUp>,
    secrets: BTreeMap<String, Secret>,
    nodes: BTreeMap<String, Node>,
    pods: BTreeMap<String, Pod>,
    jobs: BTreeMap<String, Job>,
    service_accounts: BTreeMap<String, ServiceAccount>,
    roles: BTreeMap<String, Role>,
    role_bindings: BTreeMap<String, RoleBinding>,
    writes: Vec<String>,
}

fn insert_new<K: Resource>(
    map: &mut BTreeMap<String, K>,
    namespace: &str,
    mut obj: K,
) -> Result<(), Error> {
    let k = key(namespace, &obj.meta().name.clone().unwrap_or_default());
    if map.contains_key(&k) {
        return Err(already_exists());
    }
    obj.meta_mut().namespace = Some(namespace.to_string());
    map.insert(k, obj);
    Ok(())
}

fn remove<K>(map: &mut BTreeMap<String, K>, namespace: &str, name: &str) -> Result<(), Error> {
    map.remove(&key(namespace, name)).map(|_| ()).ok_or_else(not_found)
}

/// Fake cluster implementing [`KubeClient`]
#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_node(&self, name: &str, labels: &[(&str, &str)]) {
        self.add_node_with(name, labels, false);
    }

    pub(crate) fn add_node_with(&self, name: &str, labels: &[(&str, &str)], unschedulable: bool) {
        let mut node = Node::default();
        node.metadata.name = Some(name.to_string());
        node.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        node.spec = Some(NodeSpec {
            unschedulable: Some(unschedulable),
            ..Default::default()
        });
        self.state.lock().unwrap().nodes.insert(name.to_string(), node);
    }

    pub(crate) fn remove_node(&self, name: &str) {
        self.state.lock().unwrap().nodes.remove(name);
    }

    pub(crate) fn add_secret(&self, namespace: &str, name: &str, pairs: &[(&str, &str)]) {
        let mut secret = Secret::default();
        secret.metadata.name = Some(name.to_string());
        secret.metadata.namespace = Some(namespace.to_string());
        secret.data = Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        );
        self.state
            .lock()
            .unwrap()
            .secrets
            .insert(key(namespace, name), secret);
    }

    pub(crate) fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.state.lock().unwrap().secrets.get(&key(namespace, name)).cloned()
    }

    pub(crate) fn put_cache_group(&self, cg: CacheGroup) {
        let k = key(&cg.namespace().unwrap_or_default(), &cg.name_any());
        self.state.lock().unwrap().cache_groups.insert(k, cg);
    }

    pub(crate) fn cache_group(&self, namespace: &str, name: &str) -> Option<CacheGroup> {
        self.state
            .lock()
            .unwrap()
            .cache_groups
            .get(&key(namespace, name))
            .cloned()
    }

    pub(crate) fn put_warmup(&self, wu: WarmUp) {
        let k = key(&wu.namespace().unwrap_or_default(), &wu.name_any());
        self.state.lock().unwrap().warmups.insert(k, wu);
    }

    pub(crate) fn warmup(&self, namespace: &str, name: &str) -> Option<WarmUp> {
        self.state
            .lock()
            .unwrap()
            .warmups
            .get(&key(namespace, name))
            .cloned()
    }

    pub(crate) fn pods(&self) -> Vec<Pod> {
        self.state.lock().unwrap().pods.values().cloned().collect()
    }

    pub(crate) fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.state.lock().unwrap().pods.get(&key(namespace, name)).cloned()
    }

    pub(crate) fn pod_names(&self) -> Vec<String> {
        self.pods().iter().map(|p| p.name_any()).collect()
    }

    /// Insert a pod as if another actor created it
    pub(crate) fn put_pod(&self, pod: Pod) {
        let k = key(&pod.namespace().unwrap_or_default(), &pod.name_any());
        self.state.lock().unwrap().pods.insert(k, pod);
    }

    pub(crate) fn set_pod_ready(&self, namespace: &str, name: &str, ready: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(pod) = state.pods.get_mut(&key(namespace, name)) {
            pod.status = Some(PodStatus {
                phase: Some("Running".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            });
        }
    }

    pub(crate) fn mark_all_pods_ready(&self) {
        let names: Vec<(String, String)> = self
            .pods()
            .iter()
            .map(|p| (p.namespace().unwrap_or_default(), p.name_any()))
            .collect();
        for (ns, name) in names {
            self.set_pod_ready(&ns, &name, true);
        }
    }

    pub(crate) fn job(&self, namespace: &str, name: &str) -> Option<Job> {
        self.state.lock().unwrap().jobs.get(&key(namespace, name)).cloned()
    }

    pub(crate) fn job_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .values()
            .map(|j| j.name_any())
            .collect()
    }

    /// Finish a job with the given condition type at `at`
    pub(crate) fn finish_job(&self, namespace: &str, name: &str, type_: &str, at: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.get_mut(&key(namespace, name)) {
            job.status = Some(JobStatus {
                completion_time: (type_ == "Complete").then(|| Time(at)),
                conditions: Some(vec![JobCondition {
                    type_: type_.to_string(),
                    status: "True".to_string(),
                    last_transition_time: Some(Time(at)),
                    message: (type_ == "Failed").then(|| "BackoffLimitExceeded".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            });
        }
    }

    pub(crate) fn has_service_account(&self, namespace: &str, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .service_accounts
            .contains_key(&key(namespace, name))
    }

    pub(crate) fn has_role(&self, namespace: &str, name: &str) -> bool {
        self.state.lock().unwrap().roles.contains_key(&key(namespace, name))
    }

    pub(crate) fn has_role_binding(&self, namespace: &str, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .role_bindings
            .contains_key(&key(namespace, name))
    }

    pub(crate) fn writes(&self) -> Vec<String> {
        self.state.lock().unwrap().writes.clone()
    }

    pub(crate) fn clear_writes(&self) {
        self.state.lock().unwrap().writes.clear();
    }

    fn log(&self, state: &mut State, entry: String) {
        state.writes.push(entry);
    }
}

#[async_trait]
impl KubeClient for FakeCluster {
    async fn get_cache_group(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CacheGroup>, Error> {
        Ok(self.cache_group(namespace, name))
    }

    async fn patch_cache_group_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CacheGroupStatus,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let cg = state
            .cache_groups
            .get_mut(&key(namespace, name))
            .ok_or_else(not_found)?;
        cg.status = Some(status.clone());
        self.log(&mut state, format!("status cachegroup {name}"));
        Ok(())
    }

    async fn set_cache_group_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let k = key(namespace, name);
        let cg = state.cache_groups.get_mut(&k).ok_or_else(not_found)?;
        let gone = finalizers.is_empty() && cg.metadata.deletion_timestamp.is_some();
        cg.metadata.finalizers = Some(finalizers);
        if gone {
            state.cache_groups.remove(&k);
        }
        self.log(&mut state, format!("finalizers cachegroup {name}"));
        Ok(())
    }

    async fn patch_warmup_status(
        &self,
        namespace: &str,
        name: &str,
        status: &WarmUpStatus,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let wu = state
            .warmups
            .get_mut(&key(namespace, name))
            .ok_or_else(not_found)?;
        wu.status = Some(status.clone());
        self.log(&mut state, format!("status warmup {name}"));
        Ok(())
    }

    async fn set_warmup_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let k = key(namespace, name);
        let wu = state.warmups.get_mut(&k).ok_or_else(not_found)?;
        let gone = finalizers.is_empty() && wu.metadata.deletion_timestamp.is_some();
        wu.metadata.finalizers = Some(finalizers);
        if gone {
            state.warmups.remove(&k);
        }
        self.log(&mut state, format!("finalizers warmup {name}"));
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        Ok(self.secret(namespace, name))
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        insert_new(&mut state.secrets, namespace, secret.clone())?;
        self.log(&mut state, format!("create secret {}", secret.name_any()));
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        Ok(self.state.lock().unwrap().nodes.values().cloned().collect())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pods
            .values()
            .filter(|p| p.namespace().as_deref() == Some(namespace))
            .filter(|p| selector_matches(selector, p.labels()))
            .cloned()
            .collect())
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        insert_new(&mut state.pods, namespace, pod.clone())?;
        self.log(&mut state, format!("create pod {}", pod.name_any()));
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        remove(&mut state.pods, namespace, name)?;
        self.log(&mut state, format!("delete pod {name}"));
        Ok(())
    }

    async fn annotate_pod(
        &self,
        namespace: &str,
        name: &str,
        key_: &str,
        value: &str,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let pod = state
            .pods
            .get_mut(&key(namespace, name))
            .ok_or_else(not_found)?;
        pod.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key_.to_string(), value.to_string());
        self.log(&mut state, format!("annotate pod {name} {key_}"));
        Ok(())
    }

    async fn remove_pod_annotation(
        &self,
        namespace: &str,
        name: &str,
        key_: &str,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let pod = state
            .pods
            .get_mut(&key(namespace, name))
            .ok_or_else(not_found)?;
        if let Some(annotations) = pod.metadata.annotations.as_mut() {
            annotations.remove(key_);
        }
        self.log(&mut state, format!("unannotate pod {name} {key_}"));
        Ok(())
    }

    async fn list_jobs(&self, namespace: &str, selector: &str) -> Result<Vec<Job>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .jobs
            .values()
            .filter(|j| j.namespace().as_deref() == Some(namespace))
            .filter(|j| selector_matches(selector, j.labels()))
            .cloned()
            .collect())
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        insert_new(&mut state.jobs, namespace, job.clone())?;
        self.log(&mut state, format!("create job {}", job.name_any()));
        Ok(())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        remove(&mut state.jobs, namespace, name)?;
        self.log(&mut state, format!("delete job {name}"));
        Ok(())
    }

    async fn create_service_account(
        &self,
        namespace: &str,
        service_account: &ServiceAccount,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        insert_new(&mut state.service_accounts, namespace, service_account.clone())?;
        self.log(&mut state, format!("create sa {}", service_account.name_any()));
        Ok(())
    }

    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        remove(&mut state.service_accounts, namespace, name)?;
        self.log(&mut state, format!("delete sa {name}"));
        Ok(())
    }

    async fn create_role(&self, namespace: &str, role: &Role) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        insert_new(&mut state.roles, namespace, role.clone())?;
        self.log(&mut state, format!("create role {}", role.name_any()));
        Ok(())
    }

    async fn delete_role(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        remove(&mut state.roles, namespace, name)?;
        self.log(&mut state, format!("delete role {name}"));
        Ok(())
    }

    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        insert_new(&mut state.role_bindings, namespace, binding.clone())?;
        self.log(&mut state, format!("create rolebinding {}", binding.name_any()));
        Ok(())
    }

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        remove(&mut state.role_bindings, namespace, name)?;
        self.log(&mut state, format!("delete rolebinding {name}"));
        Ok(())
    }
}
