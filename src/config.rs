//! Controller configuration
//!
//! Parsed from the `controller` subcommand's flags (with environment
//! fallbacks) and shared with every reconciler through its context.

use std::time::Duration;

/// Image used by warm-up jobs that do not name one; it must ship `kubectl`
pub const DEFAULT_WARMUP_IMAGE: &str = "bitnami/kubectl:1.31";

/// Runtime settings for the controllers
#[derive(Clone, Debug, clap::Args)]
pub struct ControllerConfig {
    /// Maximum concurrent reconciles per controller
    #[arg(long, env = "CONTROLLER_CONCURRENCY", default_value_t = 4)]
    pub concurrency: u16,

    /// Seconds to wait for in-flight reconciles on shutdown
    #[arg(long = "shutdown-timeout", env = "SHUTDOWN_TIMEOUT", default_value_t = 30)]
    pub shutdown_timeout_secs: u64,

    /// Image for warm-up jobs that do not set one
    #[arg(long, env = "JUICEFS_WARMUP_IMAGE", default_value = DEFAULT_WARMUP_IMAGE)]
    pub warmup_image: String,

    /// Restrict every watch to one namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Requeue interval while workers are still converging
    #[arg(skip = Duration::from_secs(10))]
    pub progressing_requeue: Duration,

    /// Requeue interval while a referenced secret is missing
    #[arg(skip = Duration::from_secs(30))]
    pub missing_secret_requeue: Duration,

    /// Requeue interval while a spec cannot be acted upon
    #[arg(skip = Duration::from_secs(60))]
    pub invalid_spec_requeue: Duration,

    /// Requeue interval while a WarmUp waits for its CacheGroup
    #[arg(skip = Duration::from_secs(10))]
    pub cache_group_wait_requeue: Duration,

    /// Requeue interval while workers are being torn down
    #[arg(skip = Duration::from_secs(5))]
    pub teardown_requeue: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            shutdown_timeout_secs: 30,
            warmup_image: DEFAULT_WARMUP_IMAGE.to_string(),
            watch_namespace: None,
            progressing_requeue: Duration::from_secs(10),
            missing_secret_requeue: Duration::from_secs(30),
            invalid_spec_requeue: Duration::from_secs(60),
            cache_group_wait_requeue: Duration::from_secs(10),
            teardown_requeue: Duration::from_secs(5),
        }
    }
}

impl ControllerConfig {
    /// Grace period for in-flight reconciles on shutdown
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
