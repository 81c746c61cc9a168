//! Credential view over a user-provided secret
//!
//! Binary `data` is decoded as UTF-8, `stringData` overlays it, and every
//! value is trimmed. Keys with empty values are treated as absent.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;

/// Secret key holding the JuiceFS volume name
pub const KEY_NAME: &str = "name";
/// Secret key holding a pre-rendered client configuration
pub const KEY_INIT_CONFIG: &str = "initconfig";
/// Secret key holding extra `juicefs auth` flags
pub const KEY_FORMAT_OPTIONS: &str = "format-options";

/// Parsed, trimmed key/value view of a credential secret
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    data: BTreeMap<String, String>,
}

impl Credentials {
    /// Parse a platform secret
    pub fn from_secret(secret: &Secret) -> Self {
        let mut data = BTreeMap::new();
        if let Some(raw) = &secret.data {
            for (k, v) in raw {
                data.insert(k.clone(), String::from_utf8_lossy(&v.0).trim().to_string());
            }
        }
        if let Some(plain) = &secret.string_data {
            for (k, v) in plain {
                data.insert(k.clone(), v.trim().to_string());
            }
        }
        data.retain(|_, v| !v.is_empty());
        Self { data }
    }

    /// Build from literal pairs
    pub fn from_pairs<K: Into<String>, V: Into<String>>(
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        let data = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into().trim().to_string()))
            .filter(|(_, v)| !v.is_empty())
            .collect();
        Self { data }
    }

    /// Value of `key`, if present and non-empty
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    /// True if `key` is present
    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// The JuiceFS volume name
    pub fn volume_name(&self) -> Option<&str> {
        self.get(KEY_NAME)
    }

    /// The pre-rendered client configuration, if any
    pub fn init_config(&self) -> Option<&str> {
        self.get(KEY_INIT_CONFIG)
    }
}
