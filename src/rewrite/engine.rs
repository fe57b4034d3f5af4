use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::Path;

use crate::config::RewriteConfig;
use crate::context::RequestContext;
use crate::error::ConfigError;
use crate::http::response::Response;
use crate::rewrite::backreference::Backreferences;
use crate::rewrite::rule::{Rule, RuleOutcome};

/// Distinct host+URI keys kept before the cache starts over.
const DEFAULT_CACHE_CAPACITY: usize = 4096;

/// Evaluates rewrite rules in order against a request.
///
/// Parsed rules are cached per host+URI for as long as the engine lives,
/// so repeated requests for the same URL skip re-parsing the configured
/// strings. Cached rules are re-resolved on every request.
#[derive(Debug)]
pub struct RewriteEngine {
    cache: HashMap<String, Vec<Rule>>,
    capacity: usize,
}

impl Default for RewriteEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RewriteEngine {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cache: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Parses every configured rule, so malformed ones surface at startup.
    pub fn validate(configs: &[RewriteConfig]) -> Result<(), ConfigError> {
        for config in configs {
            Rule::from_config(config)?;
        }
        Ok(())
    }

    pub fn cached_keys(&self) -> usize {
        self.cache.len()
    }

    fn rules_for(
        &mut self,
        key: &str,
        configs: &[RewriteConfig],
    ) -> Result<&mut Vec<Rule>, ConfigError> {
        if self.cache.len() >= self.capacity && !self.cache.contains_key(key) {
            tracing::debug!(entries = self.cache.len(), "Rewrite cache full, clearing");
            self.cache.clear();
        }

        match self.cache.entry(key.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let rules = configs
                    .iter()
                    .map(Rule::from_config)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(entry.insert(rules))
            }
        }
    }

    /// Runs `configs` for the request identified by `key` (host + URI).
    ///
    /// Returns the number of rules that were applied. Stops after a rule
    /// with the `L` flag, or after a redirect.
    pub fn rewrite(
        &mut self,
        key: &str,
        configs: &[RewriteConfig],
        ctx: &mut RequestContext,
        response: &mut Response,
    ) -> Result<usize, ConfigError> {
        if configs.is_empty() {
            return Ok(0);
        }

        let document_root = ctx.document_root().to_string();
        let rules = self.rules_for(key, configs)?;
        let mut applied = 0;

        for rule in rules.iter_mut() {
            let backreferences = Backreferences::from_context(ctx);
            if !rule.matches(&backreferences, Path::new(&document_root)) {
                continue;
            }

            applied += 1;
            let outcome = rule.apply(&backreferences, ctx, response);
            if outcome == RuleOutcome::Stop || response.is_dispatched() {
                break;
            }
        }

        Ok(applied)
    }
}
