//! WarmUp Custom Resource Definition
//!
//! A WarmUp preloads paths of a JuiceFS volume into an existing CacheGroup's
//! cache, once or on a cron schedule.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// Default job retries before a warm-up is marked Failed
pub const DEFAULT_BACKOFF_LIMIT: i32 = 3;

/// Specification for a WarmUp
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "juicefs.io",
    version = "v1",
    kind = "WarmUp",
    plural = "warmups",
    shortname = "wu",
    status = "WarmUpStatus",
    namespaced,
    printcolumn = r#"{"name":"Cache Group","type":"string","jsonPath":".spec.cacheGroupName"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Last Schedule","type":"date","jsonPath":".status.lastScheduleTime"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WarmUpSpec {
    /// CacheGroup to warm, in the same namespace
    pub cache_group_name: String,

    /// One-shot or scheduled execution
    #[serde(default)]
    pub policy: WarmUpPolicy,

    /// Paths to warm, relative to the filesystem root
    #[serde(default)]
    pub targets: Vec<WarmUpTarget>,

    /// Extra `juicefs warmup` options applied to every target
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,

    /// Job retries before the warm-up is marked Failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,

    /// Seconds a finished job is kept before deletion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,

    /// Job image; the controller default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// A single warm-up path
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WarmUpTarget {
    /// Path relative to the filesystem root
    pub path: String,

    /// Concurrent warm-up threads for this path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,

    /// Extra options for this path only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// How a WarmUp is triggered
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WarmUpPolicy {
    /// Policy type
    #[serde(rename = "type", default)]
    pub type_: WarmUpPolicyType,

    /// Schedule, required when `type` is Cron
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<CronPolicy>,
}

/// Trigger kind
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum WarmUpPolicyType {
    /// Run once
    #[default]
    Once,
    /// Run on a cron schedule
    Cron,
}

/// Cron trigger configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CronPolicy {
    /// Standard five-field cron expression (UTC)
    pub schedule: String,

    /// What to do when a trigger fires while a job is still active
    #[serde(default)]
    pub concurrency_policy: ConcurrencyPolicy,
}

/// Overlap handling for scheduled warm-ups
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConcurrencyPolicy {
    /// Start a new job regardless of active ones
    #[default]
    Allow,
    /// Skip the trigger while a job is active
    Forbid,
    /// Delete active jobs, then start a new one
    Replace,
}

/// WarmUp lifecycle phase
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum WarmUpPhase {
    /// Waiting for the CacheGroup or the first trigger
    #[default]
    Pending,
    /// A job is running
    Running,
    /// The last job succeeded
    Complete,
    /// The last job exhausted its retries
    Failed,
}

impl WarmUpPhase {
    /// Complete or Failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl std::fmt::Display for WarmUpPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Complete => write!(f, "Complete"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Status for a WarmUp
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WarmUpStatus {
    /// Current phase
    #[serde(default)]
    pub phase: WarmUpPhase,

    /// Last time a scheduled job was started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_schedule_time: Option<DateTime<Utc>>,

    /// Last time a job completed successfully
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_complete_time: Option<DateTime<Utc>>,

    /// Generation the current phase refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions representing the warm-up state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl WarmUpSpec {
    /// Effective job retry limit
    pub fn backoff_limit(&self) -> i32 {
        self.backoff_limit.unwrap_or(DEFAULT_BACKOFF_LIMIT)
    }

    /// The cron policy when this warm-up is scheduled
    pub fn schedule(&self) -> Option<&CronPolicy> {
        match self.policy.type_ {
            WarmUpPolicyType::Cron => self.policy.cron.as_ref(),
            WarmUpPolicyType::Once => None,
        }
    }
}

impl WarmUp {
    /// Whether deletion has been requested
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
