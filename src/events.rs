//! Kubernetes Event recording for the operator's controllers.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so reconcilers can surface spec problems and lifecycle milestones through
//! `kubectl describe`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors.

use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "SecretNotFound")
    /// * `action` - What action was taken (e.g. "Reconcile")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// A recorded event, as seen by [`RecordingEventPublisher`]
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    /// Name of the object the event is about
    pub object: Option<String>,
    /// True for Warning events
    pub warning: bool,
    /// Event reason
    pub reason: String,
    /// Event note
    pub note: Option<String>,
}

/// Publisher that keeps events in memory, for tests and dry runs.
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    /// Events published so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Reasons of events published so far, in order
    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        if let Ok(mut events) = self.events.lock() {
            events.push(RecordedEvent {
                object: resource_ref.name.clone(),
                warning: matches!(type_, EventType::Warning),
                reason: reason.to_string(),
                note,
            });
        }
    }
}

/// Well-known event reason strings.
pub mod reasons {
    // CacheGroup
    /// The credential secret referenced by a CacheGroup does not exist
    pub const SECRET_NOT_FOUND: &str = "SecretNotFound";
    /// The CacheGroup spec cannot be turned into workers
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// A worker pod was created
    pub const WORKER_CREATED: &str = "WorkerCreated";
    /// A worker pod was deleted
    pub const WORKER_DELETED: &str = "WorkerDeleted";
    /// A drifted worker got a replacement
    pub const WORKER_REPLACING: &str = "WorkerReplacing";
    /// Worker limits are below their requests
    pub const RESOURCES_INVERTED: &str = "ResourcesInverted";
    /// Every expected worker is Ready
    pub const CACHE_GROUP_READY: &str = "CacheGroupReady";

    // WarmUp
    /// The referenced CacheGroup is missing or not Ready
    pub const CACHE_GROUP_NOT_READY: &str = "CacheGroupNotReady";
    /// A warm-up job was started
    pub const JOB_CREATED: &str = "JobCreated";
    /// A warm-up job succeeded
    pub const JOB_COMPLETE: &str = "JobComplete";
    /// A warm-up job exhausted its retries
    pub const JOB_FAILED: &str = "JobFailed";
    /// A scheduled trigger was skipped because a job is still active
    pub const JOB_SKIPPED: &str = "JobSkipped";
    /// The cron schedule cannot be parsed
    pub const INVALID_SCHEDULE: &str = "InvalidSchedule";

    // Sync
    /// The derived sync secret was created
    pub const SECRET_CREATED: &str = "SecretCreated";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Creating child objects
    pub const CREATE: &str = "Create";
    /// Deleting child objects
    pub const DELETE: &str = "Delete";
    /// Rolling a worker forward
    pub const ROLL: &str = "Roll";
    /// Starting a scheduled job
    pub const SCHEDULE: &str = "Schedule";
}
