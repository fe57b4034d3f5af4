//! Placeholder substitution for `$NAME` and `$1`..`$9`.

use std::collections::HashMap;

use crate::context::{RequestContext, vars};

/// Named values that `$name` placeholders resolve to.
///
/// Keys are stored without the leading `$`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backreferences {
    values: HashMap<String, String>,
}

impl Backreferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collects env vars, then server vars on top, plus `REQUEST_FILENAME`
    /// derived from the document root and the working request path.
    pub fn from_context(ctx: &RequestContext) -> Self {
        let mut refs = Self::new();
        for (k, v) in ctx.env_vars() {
            refs.insert(k.clone(), v.clone());
        }
        for (k, v) in ctx.server_vars() {
            refs.insert(k.clone(), v.clone());
        }
        if !refs.contains(vars::REQUEST_FILENAME) {
            let uri = ctx.server_var(vars::X_REQUEST_URI).unwrap_or("");
            let filename = format!(
                "{}/{}",
                ctx.document_root().trim_end_matches('/'),
                uri.trim_start_matches('/')
            );
            refs.insert(vars::REQUEST_FILENAME, filename);
        }
        refs
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let name = name.strip_prefix('$').map(str::to_string).unwrap_or(name);
        self.values.insert(name, value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.strip_prefix('$').unwrap_or(name);
        self.values.get(name).map(|v| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Overlays `other` on top of `self`.
    pub fn extend(&mut self, other: &Backreferences) {
        for (k, v) in &other.values {
            self.values.insert(k.clone(), v.clone());
        }
    }

    /// Substitutes every `$name` in `input` in a single left-to-right pass.
    ///
    /// At each `$` the longest known key wins, so `$HTTP_HOST` is never
    /// mangled by a shorter `$HTTP`. Substituted text is not scanned again.
    /// A `$` that starts no known key is copied through unchanged.
    pub fn resolve(&self, input: &str) -> String {
        if !input.contains('$') || self.values.is_empty() {
            return input.to_string();
        }

        let mut keys: Vec<&str> = self.values.keys().map(|k| k.as_str()).collect();
        keys.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));

        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];
            match keys.iter().find(|k| !k.is_empty() && after.starts_with(**k)) {
                Some(key) => {
                    out.push_str(&self.values[*key]);
                    rest = &after[key.len()..];
                }
                None => {
                    out.push('$');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(pairs: &[(&str, &str)]) -> Backreferences {
        let mut r = Backreferences::new();
        for (k, v) in pairs {
            r.insert(*k, *v);
        }
        r
    }

    #[test]
    fn longest_key_wins() {
        let r = refs(&[("HTTP", "short"), ("HTTP_HOST", "example.com")]);
        assert_eq!(r.resolve("//$HTTP_HOST/x"), "//example.com/x");
        assert_eq!(r.resolve("$HTTP-x"), "short-x");
    }

    #[test]
    fn numbered_captures_and_unknown_names() {
        let r = refs(&[("$1", "foo"), ("2", "bar")]);
        assert_eq!(r.resolve("/new/$1/$2/$3"), "/new/foo/bar/$3");
        assert_eq!(r.resolve("^/old/(.*)$"), "^/old/(.*)$");
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let r = refs(&[("A", "$B"), ("B", "nope")]);
        assert_eq!(r.resolve("$A"), "$B");
    }

    #[test]
    fn resolving_is_deterministic() {
        let r = refs(&[("X_REQUEST_URI", "/a"), ("X", "b"), ("1", "c")]);
        let input = "$X_REQUEST_URI?$X&$1";
        assert_eq!(r.resolve(input), r.resolve(input));
        assert_eq!(r.resolve(input), "/a?b&c");
    }
}
