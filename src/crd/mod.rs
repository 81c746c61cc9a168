//! Custom Resource Definitions for the JuiceFS operator
//!
//! All resources live in the `juicefs.io/v1` API group.

mod cache_group;
mod sync;
mod types;
mod warmup;

pub use cache_group::{
    CacheGroup, CacheGroupPhase, CacheGroupSpec, CacheGroupStatus, CacheGroupUpdateStrategy,
    CacheGroupWorker, CacheGroupWorkerOverwrite, CacheGroupWorkerTemplate, RollingUpdate,
    SecretRef, UpdateStrategyType, WorkerFields,
};
pub use sync::{JuiceFsSync, SyncSink, SyncSinkExternal, SyncSinkJuiceFs, SyncSinkValue, SyncSpec};
pub use types::{condition_types, remove_condition, set_condition, Condition, ConditionStatus};
pub use warmup::{
    ConcurrencyPolicy, CronPolicy, WarmUp, WarmUpPhase, WarmUpPolicy, WarmUpPolicyType,
    WarmUpSpec, WarmUpStatus, WarmUpTarget, DEFAULT_BACKOFF_LIMIT,
};

/// All CRDs served by the operator, for installation and `--crd` output
pub fn all_crds(
) -> Vec<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition>
{
    use kube::CustomResourceExt;
    vec![CacheGroup::crd(), WarmUp::crd(), JuiceFsSync::crd()]
}
