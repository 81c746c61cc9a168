//! Well-known names, labels and annotations
//!
//! Every string here is part of the operator's external contract: workers,
//! jobs and RBAC objects created by older releases must still be found by
//! newer ones, so these values never change.

use kube::{Resource, ResourceExt};

/// API group of all operator CRDs
pub const API_GROUP: &str = "juicefs.io";
/// API version of all operator CRDs
pub const API_VERSION: &str = "juicefs.io/v1";

/// Finalizer gating CacheGroup and WarmUp deletion
pub const FINALIZER: &str = "juicefs.io/finalizer";

/// Container name of the cache worker
pub const WORKER_CONTAINER_NAME: &str = "juicefs-cg-worker";
/// Container name of the warm-up job
pub const WARMUP_CONTAINER_NAME: &str = "juicefs-warmup";

/// Prefix of worker pod names
pub const WORKER_NAME_PREFIX: &str = "juicefs-cg-worker";
/// Prefix of warm-up job and RBAC object names
pub const WARMUP_NAME_PREFIX: &str = "juicefs-warmup";
/// Prefix of Sync credential secrets
pub const SYNC_SECRET_NAME_PREFIX: &str = "juicefs-sync-secret";
/// Suffix of the second worker slot used while replacing a worker
pub const ROLLING_SUFFIX: &str = "rolling";

/// JuiceFS client binary
pub const JUICEFS_BINARY: &str = "/usr/bin/juicefs";
/// JuiceFS mount helper
pub const JUICEFS_MOUNT_BINARY: &str = "/sbin/mount.juicefs";
/// Mount point of the filesystem inside the worker
pub const MOUNT_POINT: &str = "/mnt/jfs";
/// Cache directory used when the user sets none
pub const DEFAULT_CACHE_DIR: &str = "/var/jfsCache";
/// Directory the init-config secret item is mounted into
pub const INIT_CONFIG_DIR: &str = "/etc/juicefs";
/// Volume name of the init-config secret volume
pub const INIT_CONFIG_VOLUME: &str = "init-config";

/// Label naming the owning CacheGroup on every worker
pub const LABEL_CACHE_GROUP: &str = "juicefs.io/cache-group";
/// Label carrying the content hash of the worker spec
pub const LABEL_WORKER_HASH: &str = "juicefs.io/worker-hash";
/// Label naming the owning WarmUp on every warm-up job
pub const LABEL_WARMUP: &str = "juicefs.io/warmup";
/// Standard application name label
pub const LABEL_APP_NAME: &str = "app.kubernetes.io/name";
/// Application name of cache workers
pub const LABEL_WORKER_VALUE: &str = "juicefs-cache-group-worker";
/// Application name of warm-up jobs
pub const LABEL_WARMUP_JOB_VALUE: &str = "juicefs-warmup-job";

/// Marks a worker kept alive while its replacement warms up
pub const ANNOTATION_BACKUP_WORKER: &str = "juicefs.io/backup-worker";
/// Marks a worker that is about to be deleted
pub const ANNOTATION_WAITING_DELETE_WORKER: &str = "juicefs.io/waiting-delete-worker";

/// Canonical worker name for a (CacheGroup, node) pair
pub fn worker_name(cg_name: &str, node_name: &str) -> String {
    format!("{WORKER_NAME_PREFIX}-{cg_name}-{node_name}")
}

/// The second slot a replacement worker is created in
pub fn rolling_worker_name(cg_name: &str, node_name: &str) -> String {
    format!("{}-{ROLLING_SUFFIX}", worker_name(cg_name, node_name))
}

/// The slot a replacement for `current` must use
///
/// Replacements alternate between the canonical and rolling slots so the
/// surviving worker never needs renaming.
pub fn replacement_worker_name(cg_name: &str, node_name: &str, current: &str) -> String {
    let canonical = worker_name(cg_name, node_name);
    if current == canonical {
        rolling_worker_name(cg_name, node_name)
    } else {
        canonical
    }
}

/// One-shot warm-up job name
pub fn warmup_job_name(wu_name: &str) -> String {
    format!("{WARMUP_NAME_PREFIX}-{wu_name}")
}

/// Scheduled warm-up job name, unique per trigger minute
pub fn scheduled_warmup_job_name(wu_name: &str, trigger_minutes: i64) -> String {
    format!("{}-{trigger_minutes}", warmup_job_name(wu_name))
}

/// Warm-up service account name
pub fn warmup_service_account_name(wu_name: &str) -> String {
    format!("{}-sa", warmup_job_name(wu_name))
}

/// Warm-up role name
pub fn warmup_role_name(wu_name: &str) -> String {
    format!("{}-role", warmup_job_name(wu_name))
}

/// Warm-up role binding name
pub fn warmup_role_binding_name(wu_name: &str) -> String {
    format!("{}-binding", warmup_job_name(wu_name))
}

/// Credential secret derived from a Sync
pub fn sync_secret_name(sync_name: &str) -> String {
    format!("{SYNC_SECRET_NAME_PREFIX}-{sync_name}")
}

/// `namespace/name` of an object, used as its key in logs, errors and backoff
pub fn object_key<K: Resource>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Label selector matching every worker of a CacheGroup
pub fn worker_selector(cg_name: &str) -> String {
    format!("{LABEL_CACHE_GROUP}={cg_name},{LABEL_APP_NAME}={LABEL_WORKER_VALUE}")
}

/// Label selector matching every job of a WarmUp
pub fn warmup_job_selector(wu_name: &str) -> String {
    format!("{LABEL_WARMUP}={wu_name},{LABEL_APP_NAME}={LABEL_WARMUP_JOB_VALUE}")
}
