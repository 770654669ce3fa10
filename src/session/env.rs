//! Process-environment snapshots and the settings diff.
//!
//! Instead of reaching into ambient global state at capture time, the
//! recorder works on two explicit maps: one taken before the session
//! started, one at the capture call. The diff is a pure function over the
//! two maps plus a denylist of sensitive or noisy names.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

/// Names never written into a log regardless of their value.
pub const DEFAULT_DENYLIST: &[&str] = &[
    "KFORGE_BOT_TOKEN",
    "KFORGE_CHAT_ID",
    "LS_COLORS",
    "OLDPWD",
    "PWD",
    "SHLVL",
];

/// Settings keys are uppercase/digit/underscore identifiers, 3–32 chars.
static KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z0-9_]{3,32}$").unwrap_or_else(|_| unreachable!()));

/// A point-in-time snapshot of the process-wide named variables.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvSnapshot {
    /// Capture every currently set variable. Entries whose name or value is
    /// not valid UTF-8 are skipped; settings keys are plain ASCII anyway and
    /// `std::env::vars` would panic on them.
    pub fn capture() -> Self {
        EnvSnapshot {
            vars: std::env::vars_os()
                .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
                .collect(),
        }
    }

    /// Build a snapshot from explicit pairs (used by tests and callers that
    /// track variables themselves).
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        EnvSnapshot {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Compute the `KEY=value` lines introduced or changed between two
/// snapshots, restricted to well-formed settings keys and filtered by the
/// denylist. Output order is lexicographic (BTreeMap iteration order).
pub fn settings_diff(before: &EnvSnapshot, after: &EnvSnapshot, denylist: &[&str]) -> Vec<String> {
    after
        .vars
        .iter()
        .filter(|(key, value)| {
            KEY_PATTERN.is_match(key)
                && !denylist.contains(&key.as_str())
                && before.vars.get(*key) != Some(*value)
        })
        .map(|(key, value)| format!("{key}={value}"))
        .collect()
}
