//! Routing-key pattern matching.
//!
//! A registered routing key may contain whole-segment `*` wildcards. Each
//! wildcard matches exactly one dot-delimited segment and the pattern must
//! match the entire key.

use regex::Regex;
use std::fmt;

use crate::protocol::error::{AmrpcError, Result};

const DELIMITER: char = '.';
const WILDCARD: &str = "*";

/// A compiled routing-key pattern.
///
/// Partial-segment wildcards (`get_*`) and the multi-segment `#` are
/// rejected: the broker binds queues with AMQP word semantics, and a
/// pattern the broker would route differently than the local matcher is a
/// registration error.
///
/// # Example
///
/// ```
/// use amrpc_common::TopicPattern;
///
/// let pattern = TopicPattern::compile("am.math.*").unwrap();
/// assert!(pattern.matches("am.math.divide"));
/// assert!(!pattern.matches("am.math.divide.fast"));
/// assert!(!pattern.matches("xam.math.divide"));
///
/// assert!(TopicPattern::compile("am.math.get_*").is_err());
/// assert!(TopicPattern::compile("am.#").is_err());
/// ```
#[derive(Clone)]
pub struct TopicPattern {
    source: String,
    regex: Regex,
    wildcard: bool,
}

impl TopicPattern {
    pub fn compile(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(AmrpcError::InvalidPattern("empty routing key".to_string()));
        }

        let mut wildcard = false;
        let mut parts = Vec::new();
        for segment in pattern.split(DELIMITER) {
            if segment.contains('#') {
                return Err(AmrpcError::InvalidPattern(format!(
                    "'{}': multi-segment wildcard '#' is not supported",
                    pattern
                )));
            }
            if segment == WILDCARD {
                wildcard = true;
                parts.push("[^.]*".to_string());
            } else if segment.contains(WILDCARD) {
                return Err(AmrpcError::InvalidPattern(format!(
                    "'{}': '*' must be a whole segment",
                    pattern
                )));
            } else {
                parts.push(regex::escape(segment));
            }
        }

        let expression = format!("^{}$", parts.join(r"\."));
        let regex = Regex::new(&expression)
            .map_err(|e| AmrpcError::InvalidPattern(format!("'{}': {}", pattern, e)))?;

        Ok(Self {
            source: pattern.to_string(),
            regex,
            wildcard,
        })
    }

    pub fn matches(&self, routing_key: &str) -> bool {
        self.regex.is_match(routing_key)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns true if the pattern contains at least one wildcard segment.
    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }
}

impl fmt::Debug for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TopicPattern").field(&self.source).finish()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PartialEq for TopicPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for TopicPattern {}
