//! Mount and format option parsing
//!
//! Options arrive as a list of strings, each of which may itself hold several
//! comma-separated `key[=value]` entries. Parsing trims whitespace and keeps
//! the flag/pair shape so builders can re-emit them faithfully.

use tracing::warn;

/// A parsed option: `key` with an optional value
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountOption {
    /// Option name
    pub key: String,
    /// Option value; `None` for bare flags
    pub value: Option<String>,
}

impl MountOption {
    /// Render as `key=value` or `key`
    pub fn render(&self) -> String {
        match &self.value {
            Some(v) => format!("{}={}", self.key, v),
            None => self.key.clone(),
        }
    }
}

/// Parse option strings into ordered `key[=value]` entries
///
/// Empty entries are skipped. An entry with an empty key (`=v`) is
/// invalid and logged.
pub fn parse_options<S: AsRef<str>>(options: &[S]) -> Vec<MountOption> {
    options
        .iter()
        .flat_map(|raw| raw.as_ref().split(','))
        .filter_map(parse_one)
        .collect()
}

fn parse_one(entry: &str) -> Option<MountOption> {
    let entry = entry.trim();
    if entry.is_empty() {
        return None;
    }
    let (key, value) = match entry.split_once('=') {
        Some((k, v)) => (k.trim(), Some(v.trim().to_string())),
        None => (entry, None),
    };
    if key.is_empty() {
        warn!(option = %entry, "ignoring option without a name");
        return None;
    }
    Some(MountOption {
        key: key.to_string(),
        value,
    })
}
