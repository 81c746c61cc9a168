//! Per-node override merging
//!
//! Overrides replace whole fields of the template: a set field wins, an
//! unset one (None, or an empty string) leaves the template value. Lists
//! and maps are replaced, never concatenated. The first override entry that
//! matches a node is the only one applied to it.

use std::collections::BTreeMap;

use crate::crd::{CacheGroupWorker, CacheGroupWorkerOverwrite, WorkerFields};

fn pick<T: Clone>(base: &Option<T>, over: &Option<T>) -> Option<T> {
    over.as_ref().or(base.as_ref()).cloned()
}

fn pick_str(base: &Option<String>, over: &Option<String>) -> Option<String> {
    match over {
        Some(s) if !s.is_empty() => Some(s.clone()),
        _ => base.clone(),
    }
}

/// Apply `over` onto `base`, field by field
pub fn merge_fields(base: &WorkerFields, over: &WorkerFields) -> WorkerFields {
    WorkerFields {
        image: pick_str(&base.image, &over.image),
        env: pick(&base.env, &over.env),
        resources: pick(&base.resources, &over.resources),
        liveness_probe: pick(&base.liveness_probe, &over.liveness_probe),
        readiness_probe: pick(&base.readiness_probe, &over.readiness_probe),
        startup_probe: pick(&base.startup_probe, &over.startup_probe),
        security_context: pick(&base.security_context, &over.security_context),
        lifecycle: pick(&base.lifecycle, &over.lifecycle),
        volumes: pick(&base.volumes, &over.volumes),
        volume_mounts: pick(&base.volume_mounts, &over.volume_mounts),
        volume_devices: pick(&base.volume_devices, &over.volume_devices),
        scheduler_name: pick_str(&base.scheduler_name, &over.scheduler_name),
        tolerations: pick(&base.tolerations, &over.tolerations),
        service_account_name: pick_str(&base.service_account_name, &over.service_account_name),
        host_network: pick(&base.host_network, &over.host_network),
        dns_policy: pick_str(&base.dns_policy, &over.dns_policy),
        opts: pick(&base.opts, &over.opts),
    }
}

/// True when every selector pair is present in `labels`; no selector matches all
pub fn selector_matches(
    selector: Option<&BTreeMap<String, String>>,
    labels: &BTreeMap<String, String>,
) -> bool {
    selector
        .map(|s| s.iter().all(|(k, v)| labels.get(k) == Some(v)))
        .unwrap_or(true)
}

/// Whether an override entry applies to a node
///
/// An entry without `nodes` and without a `nodeSelector` matches nothing.
pub fn overwrite_matches(
    entry: &CacheGroupWorkerOverwrite,
    node_name: &str,
    node_labels: &BTreeMap<String, String>,
) -> bool {
    if let Some(nodes) = &entry.nodes {
        if nodes.iter().any(|n| n == node_name) {
            return true;
        }
    }
    match &entry.node_selector {
        Some(selector) if !selector.is_empty() => selector_matches(Some(selector), node_labels),
        _ => false,
    }
}

/// Template fields for a node after applying its first matching override
pub fn fields_for_node(
    worker: &CacheGroupWorker,
    node_name: &str,
    node_labels: &BTreeMap<String, String>,
) -> WorkerFields {
    match worker
        .overwrite
        .iter()
        .find(|entry| overwrite_matches(entry, node_name, node_labels))
    {
        Some(entry) => merge_fields(&worker.template.fields, &entry.fields),
        None => worker.template.fields.clone(),
    }
}
