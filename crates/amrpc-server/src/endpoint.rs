//! Endpoint registry.
//!
//! Endpoints are kept in registration order. When several patterns match a
//! routing key the first registered endpoint handles the message and the
//! rest are ignored, so every message is handled, acknowledged and
//! answered at most once.

use amrpc_common::{Result, TopicPattern};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::handler::Handler;

/// A registered endpoint: routing key, compiled matcher and handler.
#[derive(Clone)]
pub struct Endpoint {
    key: String,
    pattern: TopicPattern,
    handler: Arc<dyn Handler>,
}

impl Endpoint {
    /// The method key as given at registration.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The full routing key the service queue is bound with.
    pub fn routing_key(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn pattern(&self) -> &TopicPattern {
        &self.pattern
    }

    pub fn handler(&self) -> Arc<dyn Handler> {
        self.handler.clone()
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("key", &self.key)
            .field("routing_key", &self.pattern.as_str())
            .finish()
    }
}

/// Ordered endpoint registry.
#[derive(Clone, Default, Debug)]
pub struct EndpointRegistry {
    endpoints: Vec<Endpoint>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles `routing_key` and appends the endpoint.
    pub fn register(
        &mut self,
        key: impl Into<String>,
        routing_key: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<()> {
        let key = key.into();
        let pattern = TopicPattern::compile(routing_key)?;
        if let Some(existing) = self.endpoints.iter().find(|e| e.routing_key() == routing_key) {
            tracing::warn!(
                "Endpoint '{}' is already registered as '{}'; the earlier registration wins",
                routing_key,
                existing.key
            );
        }
        tracing::debug!("Registered endpoint '{}' as {}", key, routing_key);
        self.endpoints.push(Endpoint {
            key,
            pattern,
            handler,
        });
        Ok(())
    }

    /// The first registered endpoint matching `routing_key`.
    pub fn resolve(&self, routing_key: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.pattern.matches(routing_key))
    }

    /// Every endpoint matching `routing_key`, in registration order.
    pub fn matching(&self, routing_key: &str) -> Vec<&Endpoint> {
        self.endpoints
            .iter()
            .filter(|e| e.pattern.matches(routing_key))
            .collect()
    }

    /// Distinct routing keys to bind the service queue with.
    pub fn binding_keys(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.endpoints
            .iter()
            .map(|e| e.routing_key())
            .filter(|key| seen.insert(*key))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Call, HandlerError};

    fn handler(reply: &'static str) -> Arc<dyn Handler> {
        Arc::new(move |_call: Call| async move { Ok::<_, HandlerError>(reply) })
    }

    fn registry(keys: &[&str]) -> EndpointRegistry {
        let mut registry = EndpointRegistry::new();
        for key in keys {
            registry.register(*key, key, handler("x")).unwrap();
        }
        registry
    }

    #[test]
    fn test_first_registered_match_wins() {
        let registry = registry(&["am.*.get", "am.users.get", "am.users.*"]);
        let endpoint = registry.resolve("am.users.get").unwrap();
        assert_eq!(endpoint.routing_key(), "am.*.get");

        let all: Vec<&str> = registry
            .matching("am.users.get")
            .iter()
            .map(|e| e.routing_key())
            .collect();
        assert_eq!(all, vec!["am.*.get", "am.users.get", "am.users.*"]);
    }

    #[test]
    fn test_no_match() {
        let registry = registry(&["am.ping"]);
        assert!(registry.resolve("am.pong").is_none());
        assert!(registry.matching("am.ping.x").is_empty());
    }

    #[test]
    fn test_binding_keys_are_distinct_and_ordered() {
        let registry = registry(&["am.b", "am.a", "am.b"]);
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.binding_keys(), vec!["am.b", "am.a"]);
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let mut registry = EndpointRegistry::new();
        assert!(registry.register("bad", "am.get_*", handler("x")).is_err());
        assert!(registry.is_empty());
    }
}
