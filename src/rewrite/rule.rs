//! Rewrite rules.
//!
//! A condition string is a list of positions joined by `{AND}`. Each
//! position is one condition or an `{OR}` group of conditions. A group may
//! put its operand on the last member only, in which case every member
//! tests that operand:
//!
//! ```text
//! -d{OR}-f{OR}-l@$REQUEST_FILENAME
//! ^/api/(.*)${AND}!=off@$API_ENABLED
//! ```
//!
//! Conditions without an operand test `$X_REQUEST_URI`.

use std::collections::BTreeMap;
use std::path::Path;

use crate::config::{RewriteConfig, RewriteTarget};
use crate::context::{RequestContext, vars};
use crate::error::ConfigError;
use crate::http::response::{Response, StatusCode};
use crate::rewrite::backreference::Backreferences;
use crate::rewrite::condition::Condition;

const AND_DELIMITER: &str = "{AND}";
const OR_DELIMITER: &str = "{OR}";
const DEFAULT_OPERAND: &str = "$X_REQUEST_URI";

pub const FLAG_REDIRECT: &str = "R";
pub const FLAG_LAST: &str = "L";
pub const FLAG_MAP: &str = "M";

/// What the engine should do after a rule has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOutcome {
    Continue,
    Stop,
}

/// How a resolved target is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// Existing absolute path on disk; becomes the script file name
    Absolute,
    /// Absolute URL; always answered with a redirect
    Url,
    /// New request path, optionally with a query string
    Relative,
}

impl TargetKind {
    pub fn classify(target: &str) -> Self {
        let path = Path::new(target);
        if path.is_absolute() && std::fs::metadata(path).is_ok() {
            return TargetKind::Absolute;
        }
        match url::Url::parse(target) {
            Ok(url) if url.has_host() => TargetKind::Url,
            _ => TargetKind::Relative,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    condition_string: String,
    /// AND of OR-groups
    conditions: Vec<Vec<Condition>>,
    target: RewriteTarget,
    flags: BTreeMap<String, Option<String>>,
    matching_backreferences: Backreferences,
    target_backreferences: Backreferences,
}

impl Rule {
    pub fn from_config(config: &RewriteConfig) -> Result<Self, ConfigError> {
        Self::new(&config.condition, config.target.clone(), &config.flag)
    }

    pub fn new(
        condition_string: &str,
        target: RewriteTarget,
        flag_string: &str,
    ) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidRule {
            rule: condition_string.to_string(),
            reason: reason.to_string(),
        };

        let conditions = parse_conditions(condition_string)?;
        if conditions.is_empty() {
            return Err(invalid("no conditions"));
        }
        let flags = parse_flags(flag_string)?;

        match (&target, flags.contains_key(FLAG_MAP)) {
            (RewriteTarget::Map(_), false) => {
                return Err(invalid("a map target needs the M flag"));
            }
            (RewriteTarget::Literal(_), true) => {
                return Err(invalid("the M flag needs a map target"));
            }
            _ => {}
        }

        Ok(Self {
            condition_string: condition_string.to_string(),
            conditions,
            target,
            flags,
            matching_backreferences: Backreferences::new(),
            target_backreferences: Backreferences::new(),
        })
    }

    pub fn condition_string(&self) -> &str {
        &self.condition_string
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.contains_key(flag)
    }

    pub fn flag_param(&self, flag: &str) -> Option<&str> {
        self.flags.get(flag).and_then(|p| p.as_deref())
    }

    pub fn matching_backreferences(&self) -> &Backreferences {
        &self.matching_backreferences
    }

    pub fn target_backreferences(&self) -> &Backreferences {
        &self.target_backreferences
    }

    /// Resolves every condition against `backreferences`.
    pub fn resolve(&mut self, backreferences: &Backreferences) {
        for group in &mut self.conditions {
            for condition in group {
                condition.resolve(backreferences);
            }
        }
    }

    /// Resolves and evaluates the rule.
    ///
    /// When the first pass captured anything, the conditions are resolved
    /// again with those captures added, so one condition's groups can feed
    /// another condition. The second pass decides the result.
    pub fn matches(&mut self, backreferences: &Backreferences, document_root: &Path) -> bool {
        self.matching_backreferences.clear();
        self.resolve(backreferences);
        let first = self.evaluate(document_root);

        if self.matching_backreferences.is_empty() {
            return first;
        }

        let mut merged = backreferences.clone();
        merged.extend(&self.matching_backreferences);
        self.resolve(&merged);
        self.evaluate(document_root)
    }

    fn evaluate(&mut self, document_root: &Path) -> bool {
        for group in &mut self.conditions {
            let mut group_matched = false;
            for condition in group.iter_mut() {
                if condition.matches(document_root) {
                    self.matching_backreferences
                        .extend(condition.backreferences());
                    group_matched = true;
                    break;
                }
            }
            if !group_matched {
                return false;
            }
        }
        true
    }

    /// Applies a matched rule to the request.
    pub fn apply(
        &mut self,
        backreferences: &Backreferences,
        ctx: &mut RequestContext,
        response: &mut Response,
    ) -> RuleOutcome {
        let current_uri = ctx.server_var(vars::X_REQUEST_URI).unwrap_or("/").to_string();
        let current_query = ctx.server_var(vars::QUERY_STRING).unwrap_or("").to_string();

        self.target_backreferences = backreferences.clone();
        self.target_backreferences
            .extend(&self.matching_backreferences);
        self.target_backreferences
            .insert(vars::REDIRECT_URL, current_uri.clone());
        self.target_backreferences
            .insert(vars::REDIRECT_QUERY_STRING, current_query.clone());

        let target = match &self.target {
            RewriteTarget::Literal(target) => target.clone(),
            RewriteTarget::Map(map) => {
                let key_template = self.flag_param(FLAG_MAP).unwrap_or(DEFAULT_OPERAND);
                let key = self.target_backreferences.resolve(key_template);
                match map.get(&key) {
                    Some(target) => target.clone(),
                    None => {
                        tracing::trace!(rule = %self.condition_string, key = %key, "Map has no entry, rule skipped");
                        return RuleOutcome::Continue;
                    }
                }
            }
        };
        let target = self.target_backreferences.resolve(&target);

        if !target.is_empty() && target != "-" {
            let kind = TargetKind::classify(&target);
            tracing::debug!(
                rule = %self.condition_string,
                from = %current_uri,
                to = %target,
                kind = ?kind,
                "Applying rewrite"
            );

            match kind {
                TargetKind::Absolute => {
                    let root = ctx.document_root().trim_end_matches('/').to_string();
                    if let Some(script_name) = target.strip_prefix(&root).filter(|_| !root.is_empty()) {
                        ctx.set_server_var(vars::SCRIPT_NAME, ensure_leading_slash(script_name));
                    }
                    ctx.set_server_var(vars::SCRIPT_FILENAME, target.clone());
                }
                TargetKind::Relative => {
                    let target = ensure_leading_slash(&target);
                    match target.split_once('?') {
                        Some((path, query)) => {
                            ctx.set_server_var(vars::X_REQUEST_URI, path);
                            ctx.set_server_var(vars::QUERY_STRING, query);
                        }
                        None => ctx.set_server_var(vars::X_REQUEST_URI, target.clone()),
                    }
                }
                TargetKind::Url => {}
            }

            if self.has_flag(FLAG_REDIRECT) || kind == TargetKind::Url {
                self.redirect(kind, &target, ctx, response);
                ctx.set_server_var(vars::REDIRECT_STATUS, "200");
                return RuleOutcome::Stop;
            }
        }

        ctx.set_server_var(vars::REDIRECT_STATUS, "200");

        if self.has_flag(FLAG_LAST) {
            RuleOutcome::Stop
        } else {
            RuleOutcome::Continue
        }
    }

    fn redirect(
        &self,
        kind: TargetKind,
        target: &str,
        ctx: &RequestContext,
        response: &mut Response,
    ) {
        let status = self
            .flag_param(FLAG_REDIRECT)
            .and_then(|p| p.parse::<u16>().ok())
            .and_then(StatusCode::from_u16)
            .unwrap_or(if self.has_flag(FLAG_REDIRECT) {
                StatusCode::MOVED_PERMANENTLY
            } else {
                StatusCode::FOUND
            });

        let location = match kind {
            TargetKind::Url => target.to_string(),
            TargetKind::Absolute | TargetKind::Relative => {
                let scheme = match ctx.server_var(vars::HTTPS) {
                    Some("on") => "https",
                    _ => "http",
                };
                let host = ctx
                    .server_var(vars::HTTP_HOST)
                    .or_else(|| ctx.server_var(vars::SERVER_NAME))
                    .unwrap_or("localhost");
                format!("{scheme}://{host}{}", ensure_leading_slash(target))
            }
        };

        response.set_status(status);
        response.set_header("Location", location);
        response.dispatch();
    }
}

fn ensure_leading_slash(s: &str) -> String {
    if s.starts_with('/') {
        s.to_string()
    } else {
        format!("/{s}")
    }
}

/// Splits `action@operand` at the last `@` that introduces a `$` placeholder.
fn split_operand(member: &str) -> (&str, Option<&str>) {
    let mut search = member;
    while let Some(at) = search.rfind('@') {
        if member[at + 1..].starts_with('$') {
            return (&member[..at], Some(&member[at + 1..]));
        }
        search = &member[..at];
    }
    (member, None)
}

fn parse_conditions(condition_string: &str) -> Result<Vec<Vec<Condition>>, ConfigError> {
    let mut positions = Vec::new();

    for position in condition_string.split(AND_DELIMITER) {
        let position = position.trim();
        if position.is_empty() {
            continue;
        }

        let members: Vec<(&str, Option<&str>)> =
            position.split(OR_DELIMITER).map(split_operand).collect();
        let shared = members
            .iter()
            .rev()
            .find_map(|(_, operand)| *operand)
            .unwrap_or(DEFAULT_OPERAND);

        let group = members
            .into_iter()
            .map(|(token, operand)| Condition::parse(token.trim(), operand.unwrap_or(shared)))
            .collect::<Result<Vec<_>, _>>()?;
        positions.push(group);
    }

    Ok(positions)
}

/// Parses `R=302,L` style flags. Long names are accepted too.
fn parse_flags(flag_string: &str) -> Result<BTreeMap<String, Option<String>>, ConfigError> {
    let mut flags = BTreeMap::new();

    for flag in flag_string.split(',') {
        let flag = flag.trim();
        if flag.is_empty() {
            continue;
        }

        let (name, param) = match flag.split_once('=') {
            Some((name, param)) => (name.trim(), Some(param.trim().to_string())),
            None => (flag, None),
        };

        let name = match name.to_ascii_uppercase().as_str() {
            "R" | "REDIRECT" => FLAG_REDIRECT,
            "L" | "LAST" => FLAG_LAST,
            "M" | "MAP" => FLAG_MAP,
            _ => return Err(ConfigError::InvalidFlag(flag.to_string())),
        };

        if name == FLAG_REDIRECT {
            if let Some(code) = &param {
                let valid = code
                    .parse::<u16>()
                    .map(|c| (300..400).contains(&c))
                    .unwrap_or(false);
                if !valid {
                    return Err(ConfigError::InvalidFlag(flag.to_string()));
                }
            }
        }

        flags.insert(name.to_string(), param);
    }

    Ok(flags)
}
