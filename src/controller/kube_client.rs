//! Platform access seam for the reconcilers
//!
//! Every API call a reconciler makes goes through [`KubeClient`], so the
//! reconcile logic can be driven in tests by an in-memory cluster or by
//! mockall expectations instead of an API server.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, Pod, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

use crate::crd::{CacheGroup, CacheGroupStatus, WarmUp, WarmUpStatus};
use crate::{Error, FIELD_MANAGER};

/// Trait abstracting Kubernetes client operations used by the reconcilers
///
/// Reads of single objects return `Ok(None)` when the object is absent.
/// Creates and deletes surface AlreadyExists and NotFound as errors; callers
/// collapse them with [`crate::error::ignore_already_exists`] and
/// [`crate::error::ignore_not_found`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Fetch a CacheGroup
    async fn get_cache_group(&self, namespace: &str, name: &str)
        -> Result<Option<CacheGroup>, Error>;

    /// Replace the status of a CacheGroup
    async fn patch_cache_group_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CacheGroupStatus,
    ) -> Result<(), Error>;

    /// Replace the finalizer list of a CacheGroup
    async fn set_cache_group_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), Error>;

    /// Replace the status of a WarmUp
    async fn patch_warmup_status(
        &self,
        namespace: &str,
        name: &str,
        status: &WarmUpStatus,
    ) -> Result<(), Error>;

    /// Replace the finalizer list of a WarmUp
    async fn set_warmup_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), Error>;

    /// Fetch a secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Create a secret
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error>;

    /// List every node of the cluster
    async fn list_nodes(&self) -> Result<Vec<Node>, Error>;

    /// List pods matching a label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error>;

    /// Create a pod
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), Error>;

    /// Delete a pod
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Set one annotation on a pod
    async fn annotate_pod(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), Error>;

    /// Remove an annotation from a pod
    async fn remove_pod_annotation(&self, namespace: &str, name: &str, key: &str)
        -> Result<(), Error>;

    /// List jobs matching a label selector
    async fn list_jobs(&self, namespace: &str, selector: &str) -> Result<Vec<Job>, Error>;

    /// Create a job
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), Error>;

    /// Delete a job together with its pods
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Create a service account
    async fn create_service_account(
        &self,
        namespace: &str,
        service_account: &ServiceAccount,
    ) -> Result<(), Error>;

    /// Delete a service account
    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Create a role
    async fn create_role(&self, namespace: &str, role: &Role) -> Result<(), Error>;

    /// Delete a role
    async fn delete_role(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Create a role binding
    async fn create_role_binding(&self, namespace: &str, binding: &RoleBinding)
        -> Result<(), Error>;

    /// Delete a role binding
    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

async fn create<K>(api: Api<K>, obj: &K) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    api.create(&PostParams::default(), obj).await?;
    Ok(())
}

async fn delete<K>(api: Api<K>, name: &str, params: &DeleteParams) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    api.delete(name, params).await?;
    Ok(())
}

async fn merge_patch<K>(api: Api<K>, name: &str, patch: serde_json::Value) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn merge_patch_status<K>(api: Api<K>, name: &str, status: impl Serialize) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_cache_group(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CacheGroup>, Error> {
        Ok(self.api::<CacheGroup>(namespace).get_opt(name).await?)
    }

    async fn patch_cache_group_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CacheGroupStatus,
    ) -> Result<(), Error> {
        merge_patch_status(self.api::<CacheGroup>(namespace), name, status).await
    }

    async fn set_cache_group_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        merge_patch(self.api::<CacheGroup>(namespace), name, patch).await
    }

    async fn patch_warmup_status(
        &self,
        namespace: &str,
        name: &str,
        status: &WarmUpStatus,
    ) -> Result<(), Error> {
        merge_patch_status(self.api::<WarmUp>(namespace), name, status).await
    }

    async fn set_warmup_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        merge_patch(self.api::<WarmUp>(namespace), name, patch).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        Ok(self.api::<Secret>(namespace).get_opt(name).await?)
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        create(self.api(namespace), secret).await
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error> {
        let params = ListParams::default().labels(selector);
        Ok(self.api::<Pod>(namespace).list(&params).await?.items)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), Error> {
        create(self.api(namespace), pod).await
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        delete(self.api::<Pod>(namespace), name, &DeleteParams::default()).await
    }

    async fn annotate_pod(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), Error> {
        let mut annotations = serde_json::Map::new();
        annotations.insert(key.to_string(), serde_json::Value::from(value));
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        merge_patch(self.api::<Pod>(namespace), name, patch).await
    }

    async fn remove_pod_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<(), Error> {
        let mut annotations = serde_json::Map::new();
        annotations.insert(key.to_string(), serde_json::Value::Null);
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        merge_patch(self.api::<Pod>(namespace), name, patch).await
    }

    async fn list_jobs(&self, namespace: &str, selector: &str) -> Result<Vec<Job>, Error> {
        let params = ListParams::default().labels(selector);
        Ok(self.api::<Job>(namespace).list(&params).await?.items)
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), Error> {
        create(self.api(namespace), job).await
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), Error> {
        delete(self.api::<Job>(namespace), name, &DeleteParams::background()).await
    }

    async fn create_service_account(
        &self,
        namespace: &str,
        service_account: &ServiceAccount,
    ) -> Result<(), Error> {
        create(self.api(namespace), service_account).await
    }

    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<(), Error> {
        delete(self.api::<ServiceAccount>(namespace), name, &DeleteParams::default()).await
    }

    async fn create_role(&self, namespace: &str, role: &Role) -> Result<(), Error> {
        create(self.api(namespace), role).await
    }

    async fn delete_role(&self, namespace: &str, name: &str) -> Result<(), Error> {
        delete(self.api::<Role>(namespace), name, &DeleteParams::default()).await
    }

    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<(), Error> {
        create(self.api(namespace), binding).await
    }

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<(), Error> {
        delete(self.api::<RoleBinding>(namespace), name, &DeleteParams::default()).await
    }
}
