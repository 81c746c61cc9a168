//! Sync Custom Resource Definition
//!
//! Describes a `juicefs sync` between two sinks. The operator's only
//! responsibility for a Sync is the derived credential secret its workers
//! read; the transfer itself is run elsewhere.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a Sync
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "juicefs.io",
    version = "v1",
    kind = "Sync",
    root = "JuiceFsSync",
    plural = "syncs",
    namespaced,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SyncSpec {
    /// Source sink
    #[serde(default)]
    pub from: SyncSink,

    /// Destination sink
    #[serde(default)]
    pub to: SyncSink,

    /// Number of sync workers; more than one runs distributed over SSH
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

impl SyncSpec {
    /// Whether the sync runs across several workers
    pub fn is_distributed(&self) -> bool {
        self.replicas.unwrap_or(1) > 1
    }
}

/// One end of a sync
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncSink {
    /// A JuiceFS volume
    #[serde(rename = "juicefs", default, skip_serializing_if = "Option::is_none")]
    pub juicefs: Option<SyncSinkJuiceFs>,

    /// An external object store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<SyncSinkExternal>,
}

/// JuiceFS volume sink
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncSinkJuiceFs {
    /// Volume name
    #[serde(default)]
    pub volume_name: String,
    /// Path inside the volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Volume token
    #[serde(default)]
    pub token: SyncSinkValue,
    /// Object store access key
    #[serde(default)]
    pub access_key: SyncSinkValue,
    /// Object store secret key
    #[serde(default)]
    pub secret_key: SyncSinkValue,
}

/// External object store sink
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncSinkExternal {
    /// Object store URI
    #[serde(default)]
    pub uri: String,
    /// Access key
    #[serde(default)]
    pub access_key: SyncSinkValue,
    /// Secret key
    #[serde(default)]
    pub secret_key: SyncSinkValue,
}

/// A literal credential value
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SyncSinkValue {
    /// The value; empty means unset
    #[serde(default)]
    pub value: String,
}
