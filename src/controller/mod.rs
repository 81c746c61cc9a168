//! Reconcilers for the operator CRDs
//!
//! Each controller follows the observe-diff-act loop: read the parent
//! object and everything it owns, compute the desired children with the
//! pure builders, apply the difference, and report progress on status.

mod cache_group;
mod kube_client;
pub mod rollout;
mod sync;
mod warmup;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::{Client, Resource};
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use cache_group::{error_policy as cache_group_error_policy, reconcile as reconcile_cache_group};
pub use kube_client::{KubeClient, KubeClientImpl};
#[cfg(test)]
pub use kube_client::MockKubeClient;
pub use sync::{error_policy as sync_error_policy, reconcile as reconcile_sync};
pub use warmup::{error_policy as warmup_error_policy, reconcile as reconcile_warmup};

use crate::config::ControllerConfig;
use crate::events::{EventPublisher, KubeEventPublisher};
use crate::naming::object_key;
use crate::retry::ErrorBackoff;
use crate::Error;

/// Source of the current time
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Controller context shared by every reconcile
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Event sink for user-visible milestones and spec problems
    pub events: Arc<dyn EventPublisher>,
    /// Runtime settings
    pub config: ControllerConfig,
    /// Per-object error backoff
    pub backoff: ErrorBackoff,
    /// Cancelled when the operator starts shutting down
    pub cancel: CancellationToken,
    clock: Clock,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Current time as seen by the reconcilers
    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// True once shutdown has begun; reconciles stop at the next API call
    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Create a context for testing with a custom client and fixed clock
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        events: Arc<dyn EventPublisher>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            kube,
            events,
            config: ControllerConfig::default(),
            backoff: ErrorBackoff::default(),
            cancel: CancellationToken::new(),
            clock: Arc::new(move || now),
        }
    }

    /// Replace the clock of a test context
    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    events: Option<Arc<dyn EventPublisher>>,
    config: ControllerConfig,
    cancel: CancellationToken,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            events: None,
            config: ControllerConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Set the controller configuration
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a cancellation token with the runner
    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the context
    pub fn build(self) -> Context {
        let client = self.client;
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(client.clone()))),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(client, crate::FIELD_MANAGER))
            }),
            config: self.config,
            backoff: ErrorBackoff::default(),
            cancel: self.cancel,
            clock: Arc::new(Utc::now),
        }
    }
}

/// Shared error policy: log, then requeue on the object's own backoff
pub(crate) fn backoff_error_policy<K: Resource>(
    kind: &str,
    obj: &K,
    error: &Error,
    ctx: &Context,
) -> Action {
    let key = object_key(obj);
    if error.is_not_found() {
        ctx.backoff.reset(&key);
        warn!(kind, object = %key, error = %error, "object or dependency gone");
        return Action::requeue(ctx.backoff.initial_delay());
    }
    let delay = ctx.backoff.next_delay(&key);
    warn!(
        kind,
        object = %key,
        error = %error,
        resource = ?error.resource(),
        retryable = error.is_retryable(),
        requeue_secs = delay.as_secs(),
        "reconcile failed"
    );
    Action::requeue(delay)
}
