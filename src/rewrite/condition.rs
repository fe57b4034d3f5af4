//! A single rewrite condition.
//!
//! Written as `[!]action[NC]@operand`. The action is a regex by default, or
//! one of the tests below:
//!
//! | action        | meaning                                 |
//! |---------------|-----------------------------------------|
//! | `-d`          | operand is a directory                  |
//! | `-f`          | operand is a regular file               |
//! | `-l`          | operand is a symbolic link              |
//! | `-x`          | operand is an executable file           |
//! | `-s`          | operand is a file with size > 0         |
//! | `<value`      | operand sorts before `value`            |
//! | `>value`      | operand sorts after `value`             |
//! | `=value`      | operand equals `value`                  |
//! | `-lt` .. `-ne`| integer comparison against `value`      |

use std::path::{Path, PathBuf};

use regex::{Regex, RegexBuilder};

use crate::error::ConfigError;
use crate::rewrite::backreference::Backreferences;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Regex,
    IsDirectory,
    IsFile,
    IsSymlink,
    IsExecutable,
    IsNonEmptyFile,
    LessThan,
    GreaterThan,
    Equal,
    IntLessThan,
    IntLessOrEqual,
    IntGreaterThan,
    IntGreaterOrEqual,
    IntEqual,
    IntNotEqual,
}

impl Action {
    fn is_filesystem(&self) -> bool {
        matches!(
            self,
            Action::IsDirectory
                | Action::IsFile
                | Action::IsSymlink
                | Action::IsExecutable
                | Action::IsNonEmptyFile
        )
    }

    /// Splits an action token into the action and the text it compares against.
    fn parse(token: &str) -> (Action, &str) {
        match token {
            "-d" => return (Action::IsDirectory, ""),
            "-f" => return (Action::IsFile, ""),
            "-l" => return (Action::IsSymlink, ""),
            "-x" => return (Action::IsExecutable, ""),
            "-s" => return (Action::IsNonEmptyFile, ""),
            _ => {}
        }

        for (prefix, action) in [
            ("-lt ", Action::IntLessThan),
            ("-le ", Action::IntLessOrEqual),
            ("-gt ", Action::IntGreaterThan),
            ("-ge ", Action::IntGreaterOrEqual),
            ("-eq ", Action::IntEqual),
            ("-ne ", Action::IntNotEqual),
        ] {
            if let Some(rest) = token.strip_prefix(prefix) {
                return (action, rest.trim());
            }
        }

        if let Some(rest) = token.strip_prefix('<') {
            (Action::LessThan, rest)
        } else if let Some(rest) = token.strip_prefix('>') {
            (Action::GreaterThan, rest)
        } else if let Some(rest) = token.strip_prefix('=') {
            (Action::Equal, rest)
        } else {
            (Action::Regex, token)
        }
    }
}

#[derive(Debug, Clone)]
pub struct Condition {
    raw_operand: String,
    raw_additional_operand: String,
    operand: String,
    additional_operand: String,
    action: Action,
    case_insensitive: bool,
    negated: bool,
    regex: Option<Regex>,
    backreferences: Backreferences,
}

impl Condition {
    /// Parses an action token such as `!-f`, `^/old/(.*)$` or `=on[NC]`
    /// and binds it to `operand`.
    pub fn parse(token: &str, operand: &str) -> Result<Self, ConfigError> {
        if token.is_empty() {
            return Err(ConfigError::InvalidCondition(format!("{token}@{operand}")));
        }

        let (negated, token) = match token.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, token),
        };

        let (case_insensitive, token) = match token.len().checked_sub(4) {
            Some(at) if token.is_char_boundary(at)
                && token[at..].eq_ignore_ascii_case("[NC]") =>
            {
                (true, &token[..at])
            }
            _ => (false, token),
        };

        let (action, additional) = Action::parse(token);
        if action == Action::Regex && additional.is_empty() {
            return Err(ConfigError::InvalidCondition(format!("{token}@{operand}")));
        }

        let mut condition = Self {
            raw_operand: operand.to_string(),
            raw_additional_operand: additional.to_string(),
            operand: operand.to_string(),
            additional_operand: additional.to_string(),
            action,
            case_insensitive,
            negated,
            regex: None,
            backreferences: Backreferences::new(),
        };

        if action == Action::Regex {
            condition.regex = Some(condition.compile(additional)?);
        }

        Ok(condition)
    }

    fn compile(&self, pattern: &str) -> Result<Regex, ConfigError> {
        RegexBuilder::new(pattern)
            .case_insensitive(self.case_insensitive)
            .build()
            .map_err(|source| ConfigError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn operand(&self) -> &str {
        &self.operand
    }

    pub fn additional_operand(&self) -> &str {
        &self.additional_operand
    }

    /// Captures of the last successful regex match, keyed `1`..`9`.
    pub fn backreferences(&self) -> &Backreferences {
        &self.backreferences
    }

    /// Substitutes placeholders in both operands, always starting from the
    /// configured text.
    pub fn resolve(&mut self, backreferences: &Backreferences) {
        self.operand = backreferences.resolve(&self.raw_operand);
        let additional = backreferences.resolve(&self.raw_additional_operand);

        if self.action == Action::Regex && additional != self.additional_operand {
            self.regex = match self.compile(&additional) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    tracing::warn!(error = %e, "Resolved condition pattern does not compile");
                    None
                }
            };
        }
        self.additional_operand = additional;
    }

    /// Evaluates the condition against the resolved operands.
    ///
    /// Filesystem tests look at the operand as given first and fall back to
    /// `document_root` joined with it.
    pub fn matches(&mut self, document_root: &Path) -> bool {
        self.backreferences.clear();

        let result = match self.action {
            Action::Regex => self.match_regex(),
            action if action.is_filesystem() => {
                let path = self.locate(document_root);
                check_path(action, &path)
            }
            Action::LessThan => self.compare_str(|a, b| a < b),
            Action::GreaterThan => self.compare_str(|a, b| a > b),
            Action::Equal => self.compare_str(|a, b| a == b),
            Action::IntLessThan => self.compare_int(|a, b| a < b),
            Action::IntLessOrEqual => self.compare_int(|a, b| a <= b),
            Action::IntGreaterThan => self.compare_int(|a, b| a > b),
            Action::IntGreaterOrEqual => self.compare_int(|a, b| a >= b),
            Action::IntEqual => self.compare_int(|a, b| a == b),
            Action::IntNotEqual => self.compare_int(|a, b| a != b),
            _ => false,
        };

        if self.negated {
            self.backreferences.clear();
        }
        result ^ self.negated
    }

    fn match_regex(&mut self) -> bool {
        let Some(regex) = &self.regex else {
            return false;
        };
        let Some(captures) = regex.captures(&self.operand) else {
            return false;
        };
        for i in 1..=9 {
            if i >= captures.len() {
                break;
            }
            let value = captures.get(i).map(|m| m.as_str()).unwrap_or("");
            self.backreferences.insert(i.to_string(), value);
        }
        true
    }

    fn compare_str(&self, cmp: impl Fn(&str, &str) -> bool) -> bool {
        if self.case_insensitive {
            cmp(
                &self.operand.to_lowercase(),
                &self.additional_operand.to_lowercase(),
            )
        } else {
            cmp(&self.operand, &self.additional_operand)
        }
    }

    fn compare_int(&self, cmp: impl Fn(i64, i64) -> bool) -> bool {
        match (
            self.operand.trim().parse::<i64>(),
            self.additional_operand.trim().parse::<i64>(),
        ) {
            (Ok(a), Ok(b)) => cmp(a, b),
            _ => false,
        }
    }

    fn locate(&self, document_root: &Path) -> PathBuf {
        let direct = PathBuf::from(&self.operand);
        if direct.symlink_metadata().is_ok() {
            return direct;
        }
        document_root.join(self.operand.trim_start_matches('/'))
    }
}

fn check_path(action: Action, path: &Path) -> bool {
    match action {
        Action::IsDirectory => path.is_dir(),
        Action::IsFile => path.is_file(),
        Action::IsSymlink => path
            .symlink_metadata()
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false),
        Action::IsExecutable => is_executable(path),
        Action::IsNonEmptyFile => path
            .metadata()
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false),
        _ => false,
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
