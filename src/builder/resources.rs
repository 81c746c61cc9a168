//! Worker resource defaults and sanity checks

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// Resources applied when a worker template sets none
///
/// The limits sit below the requests. The values are kept for compatibility
/// with existing worker hashes; [`inverted_resources`] reports the mismatch.
pub fn default_resources() -> ResourceRequirements {
    ResourceRequirements {
        limits: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity("100m".to_string())),
            ("memory".to_string(), Quantity("100Mi".to_string())),
        ])),
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity("1".to_string())),
            ("memory".to_string(), Quantity("1Gi".to_string())),
        ])),
        ..Default::default()
    }
}

/// Resource names whose limit is lower than their request, sorted
pub fn inverted_resources(resources: &ResourceRequirements) -> Vec<String> {
    let (Some(limits), Some(requests)) = (&resources.limits, &resources.requests) else {
        return Vec::new();
    };
    requests
        .iter()
        .filter_map(|(name, request)| {
            let limit = parse_quantity(&limits.get(name)?.0)?;
            let request = parse_quantity(&request.0)?;
            (limit < request).then(|| name.clone())
        })
        .collect()
}

/// Parse a Kubernetes quantity into a plain number of base units
///
/// Accepts binary (`Ki`..`Ei`) and decimal (`n`, `u`, `m`, `k`..`E`)
/// suffixes and bare numbers. Returns `None` for anything else.
pub fn parse_quantity(raw: &str) -> Option<f64> {
    const SUFFIXES: &[(&str, f64)] = &[
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("Ei", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("n", 1e-9),
        ("u", 1e-6),
        ("m", 1e-3),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("E", 1e18),
    ];

    let raw = raw.trim();
    for (suffix, factor) in SUFFIXES {
        if let Some(number) = raw.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|n| n * factor);
        }
    }
    raw.parse::<f64>().ok()
}
