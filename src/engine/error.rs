//! Recoverable engine errors.
//!
//! Only genuinely recoverable conditions surface as `MetaError`; invariant
//! violations (pop on an empty stack, chaining past the cycle ceiling,
//! a cached replay against the wrong parent) panic instead: they indicate
//! a bug in the cache or a caller precondition violation and must not be
//! silently tolerated.

use std::fmt;

/// Error type for rule ingestion and key registration.
#[derive(Debug, Clone)]
pub enum MetaError {
    /// A rule set failed to load. The partially-added set has been disabled;
    /// the rest of the rule base is intact.
    RuleLoad {
        /// Source identifier passed to `begin_rule_set`
        source: String,
        reason: String,
    },

    /// The dense key-id space (64 keys, one bit each) is exhausted.
    KeyLimit { key: String },

    /// A selector list that cannot be normalized into a matchable rule.
    InvalidSelector(String),
}

impl fmt::Display for MetaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaError::RuleLoad { source, reason } => {
                write!(f, "rule load failed for '{}': {}", source, reason)
            }
            MetaError::KeyLimit { key } => {
                write!(f, "context key limit (64) exceeded registering '{}'", key)
            }
            MetaError::InvalidSelector(msg) => write!(f, "invalid selector: {}", msg),
        }
    }
}

impl std::error::Error for MetaError {}
