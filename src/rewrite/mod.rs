//! URL rewriting
//!
//! Declarative rules made of conditions, a target and flags, evaluated in
//! order against each request by the rewrite module.

pub mod backreference;
pub mod condition;
pub mod engine;
pub mod rule;

pub use backreference::Backreferences;
pub use condition::{Action, Condition};
pub use engine::RewriteEngine;
pub use rule::{Rule, RuleOutcome, TargetKind};
