//! CacheGroup Custom Resource Definition
//!
//! A CacheGroup declares a pool of JuiceFS cache workers, one per matching
//! node, that mount the same volume and share cache blocks under a common
//! cache-group tag.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    EnvVar, Lifecycle, Probe, ResourceRequirements, SecurityContext, Toleration, Volume,
    VolumeDevice, VolumeMount,
};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// Specification for a CacheGroup
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "juicefs.io",
    version = "v1",
    kind = "CacheGroup",
    plural = "cachegroups",
    shortname = "cg",
    status = "CacheGroupStatus",
    namespaced,
    printcolumn = r#"{"name":"Cache Group","type":"string","jsonPath":".status.cacheGroup"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.readyStr"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CacheGroupSpec {
    /// Explicit cache-group tag; defaults to `<namespace>-<name>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_group: Option<String>,

    /// Credential secret in the same namespace
    pub secret_ref: SecretRef,

    /// Worker template and per-node overrides
    #[serde(default)]
    pub worker: CacheGroupWorker,

    /// How drifted workers are replaced
    #[serde(default)]
    pub update_strategy: CacheGroupUpdateStrategy,
}

/// Reference to a secret in the CacheGroup's namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SecretRef {
    /// Secret name
    pub name: String,
}

/// Worker configuration of a CacheGroup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheGroupWorker {
    /// Group-wide worker template
    #[serde(default)]
    pub template: CacheGroupWorkerTemplate,

    /// Ordered per-node overrides; the first matching entry applies
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overwrite: Vec<CacheGroupWorkerOverwrite>,
}

/// Base worker template
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheGroupWorkerTemplate {
    /// Nodes eligible for a worker; empty selects every node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Worker fields
    #[serde(flatten)]
    pub fields: WorkerFields,
}

/// A per-node override entry
///
/// Matches nodes by explicit name (`nodes`) or by label (`nodeSelector`).
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheGroupWorkerOverwrite {
    /// Node names this entry applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<String>>,

    /// Node labels this entry applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Fields replacing the template's when set
    #[serde(flatten)]
    pub fields: WorkerFields,
}

/// Worker fields shared by the template and its overrides
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerFields {
    /// Worker container image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Extra environment, appended after the credential variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,

    /// Resource requests and limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Liveness probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<Probe>,

    /// Readiness probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<Probe>,

    /// Startup probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_probe: Option<Probe>,

    /// Container security context; privileged when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,

    /// Lifecycle hooks; a pre-stop unmount when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<Lifecycle>,

    /// Pod volumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<Volume>>,

    /// Container volume mounts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mounts: Option<Vec<VolumeMount>>,

    /// Container volume devices
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_devices: Option<Vec<VolumeDevice>>,

    /// Scheduler name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_name: Option<String>,

    /// Pod tolerations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,

    /// Pod service account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Host networking; true when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_network: Option<bool>,

    /// Pod DNS policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_policy: Option<String>,

    /// Mount options (`key[=value]`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opts: Option<Vec<String>>,
}

/// Worker update strategy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CacheGroupUpdateStrategy {
    /// Strategy type
    #[serde(rename = "type", default)]
    pub type_: UpdateStrategyType,

    /// Rolling update parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdate>,
}

impl CacheGroupUpdateStrategy {
    /// Workers allowed to be unavailable during a rollout (default 1)
    pub fn max_unavailable(&self) -> u32 {
        self.rolling_update
            .as_ref()
            .and_then(|r| r.max_unavailable)
            .unwrap_or(1)
    }
}

/// Strategy type for worker replacement
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UpdateStrategyType {
    /// Replace drifted workers automatically, bounded by `maxUnavailable`
    #[default]
    RollingUpdate,
    /// Replace workers only when a user deletes them
    OnDelete,
}

/// Rolling update parameters
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdate {
    /// Maximum number of workers not Ready during a rollout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<u32>,
}

/// CacheGroup lifecycle phase
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CacheGroupPhase {
    /// No workers expected or nothing has happened yet
    #[default]
    Pending,
    /// Workers are being created, replaced or removed
    Progressing,
    /// Every expected worker is Ready
    Ready,
}

impl std::fmt::Display for CacheGroupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Progressing => write!(f, "Progressing"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

/// Status for a CacheGroup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheGroupStatus {
    /// Current phase
    #[serde(default)]
    pub phase: CacheGroupPhase,

    /// Workers reporting Ready
    #[serde(default)]
    pub ready_worker: u32,

    /// Workers expected from the node selection
    #[serde(default)]
    pub expect_worker: u32,

    /// `ready/expected`
    #[serde(default)]
    pub ready_str: String,

    /// Effective cache-group tag
    #[serde(default)]
    pub cache_group: String,

    /// Workers kept as backups during replacement
    #[serde(default)]
    pub back_up_worker: u32,

    /// Workers about to be deleted; always serialized so a merge patch clears it
    #[serde(default)]
    pub waiting_deleted_workers: Vec<String>,

    /// Generation last acted upon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions representing the group state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl CacheGroup {
    /// Effective cache-group tag: the explicit one or `<namespace>-<name>`
    pub fn cache_group_tag(&self) -> String {
        match self.spec.cache_group.as_deref() {
            Some(tag) if !tag.is_empty() => tag.to_string(),
            _ => format!(
                "{}-{}",
                self.namespace().unwrap_or_default(),
                self.name_any()
            ),
        }
    }

    /// Whether deletion has been requested
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
