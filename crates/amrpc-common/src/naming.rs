//! Exchange, queue and routing key derivation.
//!
//! Servers and clients of the same service must agree on every broker name,
//! so both derive them from the same `(prefix, service)` pair through
//! [`Naming`].

use crate::transport::ExchangeKind;

const SEPARATOR: char = '_';

/// Broker names for one service namespace.
///
/// The prefix gets a trailing `_` when it lacks one, and so does a
/// non-empty service name. An empty service leaves the namespace as just
/// the prefix.
///
/// # Example
///
/// ```
/// use amrpc_common::Naming;
/// use amrpc_common::transport::ExchangeKind;
///
/// let naming = Naming::new("am", "math");
/// assert_eq!(naming.exchange_name(ExchangeKind::Topic), "am_exchange_topic");
/// assert_eq!(naming.queue_name(ExchangeKind::Topic), "am_math_queue_topic");
/// assert_eq!(naming.routing_key("divide"), "am.math.divide");
///
/// let bare = Naming::new("am_", "");
/// assert_eq!(bare.routing_key("ping"), "am.ping");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Naming {
    prefix: String,
    service: String,
}

impl Naming {
    pub fn new(prefix: impl Into<String>, service: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.ends_with(SEPARATOR) {
            prefix.push(SEPARATOR);
        }
        let mut service = service.into();
        if !service.is_empty() && !service.ends_with(SEPARATOR) {
            service.push(SEPARATOR);
        }
        Self { prefix, service }
    }

    /// Normalized prefix, always ending in `_`.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Normalized service name, empty or ending in `_`.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// `<prefix>_exchange_<kind>`
    pub fn exchange_name(&self, kind: ExchangeKind) -> String {
        format!("{}exchange_{}", self.prefix, kind)
    }

    /// `<prefix>_<service>_queue_<kind>`
    ///
    /// Only topic exchanges use a named queue; fanout servers declare an
    /// anonymous one and let the broker pick its name.
    pub fn queue_name(&self, kind: ExchangeKind) -> String {
        format!("{}{}queue_{}", self.prefix, self.service, kind)
    }

    /// Full routing key for a method key, namespace separators turned into dots.
    pub fn routing_key(&self, key: &str) -> String {
        let namespace = format!("{}{}", self.prefix, self.service).replace(SEPARATOR, ".");
        format!("{}{}", namespace, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_separator_appended_once() {
        let a = Naming::new("am", "math");
        let b = Naming::new("am_", "math_");
        assert_eq!(a, b);
        assert_eq!(a.prefix(), "am_");
        assert_eq!(a.service(), "math_");
    }

    #[test]
    fn test_empty_service() {
        let naming = Naming::new("am", "");
        assert_eq!(naming.service(), "");
        assert_eq!(naming.queue_name(ExchangeKind::Topic), "am_queue_topic");
        assert_eq!(naming.routing_key("ping"), "am.ping");
    }

    #[test]
    fn test_fanout_names() {
        let naming = Naming::new("am", "math");
        assert_eq!(naming.exchange_name(ExchangeKind::Fanout), "am_exchange_fanout");
        assert_eq!(naming.queue_name(ExchangeKind::Fanout), "am_math_queue_fanout");
    }

    #[test]
    fn test_internal_separators_become_dots() {
        let naming = Naming::new("my_app", "user_store");
        assert_eq!(naming.routing_key("get"), "my.app.user.store.get");
        // Method keys are taken verbatim
        assert_eq!(naming.routing_key("get_all"), "my.app.user.store.get_all");
    }

    #[test]
    fn test_wildcard_key() {
        let naming = Naming::new("am", "math");
        assert_eq!(naming.routing_key("*"), "am.math.*");
    }
}
