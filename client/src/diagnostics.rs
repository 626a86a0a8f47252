//! Recoverable data-quality warnings.
//!
//! Emitted via `tracing` with a dedicated target so they can be filtered
//! apart from lifecycle logging. Each distinct key warns once; repeats are
//! counted silently.

use std::collections::HashMap;
use tracing::warn;

pub const DIAG_TARGET: &str = "toolgear::diag";

/// Per-key warn-once bookkeeping.
#[derive(Debug, Default)]
pub struct Diagnostics {
    seen: HashMap<String, u64>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time `key` is seen.
    fn first(&mut self, key: String) -> bool {
        let n = self.seen.entry(key).or_insert(0);
        *n += 1;
        *n == 1
    }

    /// How often `key` has been reported, including the first time.
    pub fn occurrences(&self, key: &str) -> u64 {
        self.seen.get(key).copied().unwrap_or(0)
    }

    /// Every key reported so far with its count, sorted by key.
    pub fn entries(&self) -> Vec<(&str, u64)> {
        let mut all: Vec<(&str, u64)> = self.seen.iter().map(|(k, &n)| (k.as_str(), n)).collect();
        all.sort_unstable();
        all
    }

    /// A NaN or infinite value was dropped.
    pub fn nonfinite_value(&mut self, function: &str, entry: &str, attr: &str, value: f64) {
        if self.first(format!("nonfinite:{}:{}:{}", function, entry, attr)) {
            warn!(
                target: DIAG_TARGET,
                event = "nonfinite_value",
                function = %function,
                entry = %entry,
                attr = %attr,
                value = %value,
            );
        }
    }

    /// A declaration or enable arrived a second time and was ignored.
    pub fn duplicate(&mut self, what: &str, name: &str) {
        if self.first(format!("duplicate:{}:{}", what, name)) {
            warn!(
                target: DIAG_TARGET,
                event = "duplicate",
                what = %what,
                name = %name,
            );
        }
    }

    /// A line was already mapped to another function.
    pub fn line_conflict(&mut self, file: &str, line: i32, existing: &str, incoming: &str) {
        if self.first(format!("line:{}:{}", file, line)) {
            warn!(
                target: DIAG_TARGET,
                event = "line_conflict",
                file = %file,
                line = line,
                existing = %existing,
                incoming = %incoming,
            );
        }
    }

    /// An action state change not allowed by the declared transitions.
    pub fn illegal_transition(&mut self, action: &str, from: &str, to: &str) {
        if self.first(format!("transition:{}:{}:{}", action, from, to)) {
            warn!(
                target: DIAG_TARGET,
                event = "illegal_transition",
                action = %action,
                from = %from,
                to = %to,
            );
        }
    }

    /// A frame the client does not understand.
    pub fn unknown_tag(&mut self, tag: i32) {
        if self.first(format!("tag:{}", tag)) {
            warn!(target: DIAG_TARGET, event = "unknown_tag", tag = tag);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diag_target_is_static() {
        assert_eq!(DIAG_TARGET, "toolgear::diag");
    }

    #[test]
    fn test_warns_once_per_key() {
        let mut diag = Diagnostics::new();
        diag.nonfinite_value("f", "e", "time", f64::NAN);
        diag.nonfinite_value("f", "e", "time", f64::INFINITY);
        diag.nonfinite_value("f", "e2", "time", f64::NAN);
        assert_eq!(diag.occurrences("nonfinite:f:e:time"), 2);
        assert_eq!(diag.occurrences("nonfinite:f:e2:time"), 1);
        assert_eq!(diag.occurrences("nonfinite:g:e:time"), 0);
    }
}
