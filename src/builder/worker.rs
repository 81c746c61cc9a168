//! Cache worker pod construction
//!
//! Translates a CacheGroup, a node, the node's merged worker fields and the
//! group's credentials into a worker pod. The builder is a pure function of
//! its inputs: identical inputs produce byte-identical pods, and the pod's
//! `worker-hash` label is the content hash of the pod spec it carries.
//!
//! The worker runs a single shell command in two stages:
//! - authenticate (`juicefs auth` with secret-derived flags, or copy a
//!   pre-rendered config from the `initconfig` secret key)
//! - `exec` the mount helper in the foreground with the cache-group tag

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, ExecAction, KeyToPath, Lifecycle, LifecycleHandler, Pod,
    PodSpec, SecretKeySelector, SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use tracing::warn;

use super::resources::default_resources;
use crate::crd::{CacheGroup, WorkerFields};
use crate::hash::content_hash;
use crate::naming::{
    object_key, worker_name, DEFAULT_CACHE_DIR, INIT_CONFIG_DIR, INIT_CONFIG_VOLUME, JUICEFS_BINARY,
    JUICEFS_MOUNT_BINARY, LABEL_APP_NAME, LABEL_CACHE_GROUP, LABEL_WORKER_HASH,
    LABEL_WORKER_VALUE, MOUNT_POINT, WORKER_CONTAINER_NAME,
};
use crate::options::parse_options;
use crate::secret::{Credentials, KEY_FORMAT_OPTIONS, KEY_INIT_CONFIG, KEY_NAME};
use crate::Error;

/// Secret keys passed to `juicefs auth`, in flag order
const AUTH_KEYS: &[&str] = &[
    "token",
    "access-key",
    "access-key2",
    "bucket",
    "bucket2",
    "subdir",
    "secret-key",
    "secret-key2",
];

/// Secret keys passed by environment reference rather than inline:
/// (secret key, env var, optional)
const ENV_KEYS: &[(&str, &str, bool)] = &[
    ("token", "TOKEN", false),
    ("secret-key", "SECRET_KEY", false),
    ("secret-key2", "SECRET_KEY_2", true),
];

fn env_name_for(key: &str) -> Option<&'static str> {
    ENV_KEYS
        .iter()
        .find(|(k, _, _)| *k == key)
        .map(|(_, env, _)| *env)
}

/// Builds the worker pod for one node of a CacheGroup
pub struct WorkerBuilder<'a> {
    cache_group: &'a CacheGroup,
    credentials: &'a Credentials,
    node_name: &'a str,
    fields: &'a WorkerFields,
    volume_name: &'a str,
}

impl<'a> WorkerBuilder<'a> {
    /// Create a builder
    ///
    /// Fails with a validation error when the credentials carry no volume
    /// name, since no worker can be built without one.
    pub fn new(
        cache_group: &'a CacheGroup,
        credentials: &'a Credentials,
        node_name: &'a str,
        fields: &'a WorkerFields,
    ) -> Result<Self, Error> {
        let volume_name = credentials.volume_name().ok_or_else(|| {
            Error::validation_for_field(
                object_key(cache_group),
                format!("secret/{}.data.{KEY_NAME}", cache_group.spec.secret_ref.name),
                "credential secret has no volume name",
            )
        })?;
        Ok(Self {
            cache_group,
            credentials,
            node_name,
            fields,
            volume_name,
        })
    }

    /// Build the worker pod under its canonical name
    pub fn build(&self) -> Result<Pod, Error> {
        let owner = self.cache_group.controller_owner_ref(&()).ok_or_else(|| {
            Error::internal_with_context("CacheGroup has no UID", "worker-builder")
        })?;

        let spec = self.pod_spec();
        let hash = content_hash(&spec)?;

        let labels = BTreeMap::from([
            (LABEL_CACHE_GROUP.to_string(), self.cache_group.name_any()),
            (LABEL_APP_NAME.to_string(), LABEL_WORKER_VALUE.to_string()),
            (LABEL_WORKER_HASH.to_string(), hash),
        ]);

        Ok(Pod {
            metadata: ObjectMeta {
                name: Some(worker_name(&self.cache_group.name_any(), self.node_name)),
                namespace: self.cache_group.namespace(),
                labels: Some(labels),
                owner_references: Some(vec![owner]),
                ..Default::default()
            },
            spec: Some(spec),
            status: None,
        })
    }

    fn has_init_config(&self) -> bool {
        self.credentials.init_config().is_some()
    }

    fn pod_spec(&self) -> PodSpec {
        let f = self.fields;

        let mut volumes = f.volumes.clone();
        let mut volume_mounts = f.volume_mounts.clone();
        if self.has_init_config() {
            volumes.get_or_insert_with(Vec::new).push(self.init_config_volume());
            volume_mounts
                .get_or_insert_with(Vec::new)
                .push(VolumeMount {
                    name: INIT_CONFIG_VOLUME.to_string(),
                    mount_path: INIT_CONFIG_DIR.to_string(),
                    ..Default::default()
                });
        }

        let container = Container {
            name: WORKER_CONTAINER_NAME.to_string(),
            image: f.image.clone(),
            command: Some(self.command()),
            env: Some(self.env()),
            resources: Some(f.resources.clone().unwrap_or_else(default_resources)),
            liveness_probe: f.liveness_probe.clone(),
            readiness_probe: f.readiness_probe.clone(),
            startup_probe: f.startup_probe.clone(),
            security_context: Some(f.security_context.clone().unwrap_or_else(|| {
                SecurityContext {
                    privileged: Some(true),
                    ..Default::default()
                }
            })),
            lifecycle: Some(f.lifecycle.clone().unwrap_or_else(default_lifecycle)),
            volume_mounts,
            volume_devices: f.volume_devices.clone(),
            ..Default::default()
        };

        PodSpec {
            node_name: Some(self.node_name.to_string()),
            host_network: Some(f.host_network.unwrap_or(true)),
            dns_policy: f.dns_policy.clone(),
            scheduler_name: f.scheduler_name.clone().filter(|s| !s.is_empty()),
            service_account_name: f.service_account_name.clone().filter(|s| !s.is_empty()),
            tolerations: f.tolerations.clone(),
            volumes,
            containers: vec![container],
            ..Default::default()
        }
    }

    fn init_config_volume(&self) -> Volume {
        Volume {
            name: INIT_CONFIG_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(self.cache_group.spec.secret_ref.name.clone()),
                items: Some(vec![KeyToPath {
                    key: KEY_INIT_CONFIG.to_string(),
                    path: format!("{}.conf", self.volume_name),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn env(&self) -> Vec<EnvVar> {
        let secret_name = &self.cache_group.spec.secret_ref.name;
        let mut env: Vec<EnvVar> = ENV_KEYS
            .iter()
            .map(|(key, name, optional)| EnvVar {
                name: name.to_string(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: secret_name.clone(),
                        key: key.to_string(),
                        optional: Some(*optional),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect();
        if let Some(extra) = &self.fields.env {
            env.extend(extra.iter().cloned());
        }
        env
    }

    /// The authentication stage of the worker command
    pub fn auth_command(&self) -> String {
        if self.has_init_config() {
            return format!(
                "cp {INIT_CONFIG_DIR}/{}.conf /root/.juicefs",
                self.volume_name
            );
        }

        let mut parts = vec![
            JUICEFS_BINARY.to_string(),
            "auth".to_string(),
            self.volume_name.to_string(),
        ];
        for key in AUTH_KEYS {
            let Some(value) = self.credentials.get(key) else {
                continue;
            };
            parts.push(format!("--{key}"));
            match env_name_for(key) {
                Some(env) => parts.push(format!("${{{env}}}")),
                None => parts.push(value.to_string()),
            }
        }

        if let Some(raw) = self.credentials.get(KEY_FORMAT_OPTIONS) {
            for opt in parse_options(&[raw]) {
                parts.push(format!("--{}", opt.key));
                if let Some(value) = opt.value.filter(|v| !v.is_empty()) {
                    parts.push(value);
                }
            }
        }

        parts.join(" ")
    }

    /// The mount stage of the worker command
    pub fn mount_command(&self) -> String {
        let mut opts = vec![
            "foreground".to_string(),
            format!("cache-group={}", self.cache_group.cache_group_tag()),
        ];

        let mut cache_dirs: Vec<String> = Vec::new();
        let user_opts = self.fields.opts.as_deref().unwrap_or_default();
        for opt in parse_options(user_opts) {
            if opt.key == "cache-dir" {
                match opt.value.as_deref() {
                    Some(dirs) if !dirs.is_empty() => {
                        cache_dirs = dirs.split(':').map(str::to_string).collect();
                    }
                    _ => warn!(
                        cache_group = %self.cache_group.name_any(),
                        "ignoring cache-dir option without a value"
                    ),
                }
                continue;
            }
            opts.push(opt.render());
        }

        if cache_dirs.is_empty() {
            cache_dirs.push(DEFAULT_CACHE_DIR.to_string());
        }
        opts.push(format!("cache-dir={}", cache_dirs.join(":")));

        format!(
            "exec {JUICEFS_MOUNT_BINARY} {} {MOUNT_POINT} -o {}",
            self.volume_name,
            opts.join(",")
        )
    }

    /// The full worker command: auth stage, newline, mount stage
    pub fn command(&self) -> Vec<String> {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("{}\n{}", self.auth_command(), self.mount_command()),
        ]
    }
}

fn default_lifecycle() -> Lifecycle {
    Lifecycle {
        pre_stop: Some(LifecycleHandler {
            exec: Some(ExecAction {
                command: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("umount {MOUNT_POINT}"),
                ]),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
