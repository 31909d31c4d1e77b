// Copyright 2025 AMRPC Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! In-process broker.
//!
//! [`MemoryBroker`] implements the transport traits without a network. It
//! keeps the parts of AMQP 0-9-1 behaviour amrpc relies on: topic and
//! fanout routing, exclusive queues tied to their connection, manual
//! acknowledgment with a per-channel prefetch limit, and requeueing of
//! unacknowledged deliveries when a channel or connection goes away.

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    AckMode, Channel, Connection, Connector, Delivery, DeliveryStream, ExchangeKind,
    MessageProperties, QueueOptions, DEFAULT_EXCHANGE,
};
use crate::config::BrokerConfig;
use crate::protocol::error::{AmrpcError, Result};

/// A shared in-memory broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

/// [`Connector`] handing out connections to a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<Binding>,
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, CancellationToken>,
    channels: HashMap<u64, ChannelState>,
    unacked: HashMap<u64, Unacked>,
    next_id: u64,
    next_tag: u64,
    connect_attempts: usize,
    refuse: usize,
    acknowledged: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

struct QueueState {
    messages: VecDeque<StoredMessage>,
    exclusive_owner: Option<u64>,
    auto_delete: bool,
    /// Channels with a consumer on this queue
    consumers: Vec<u64>,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    body: Vec<u8>,
}

struct ChannelState {
    connection: u64,
    prefetch: u16,
    unacked: usize,
    token: CancellationToken,
}

struct Unacked {
    queue: String,
    channel: u64,
    message: StoredMessage,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            shared: self.shared.clone(),
        }
    }

    /// Fails every live connection, as if the network dropped.
    ///
    /// Consumers see an error on their delivery streams, unacknowledged
    /// deliveries go back to their queues and exclusive queues are deleted.
    pub fn sever_connections(&self) {
        let mut state = self.shared.state.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.close_connection(id);
        }
        drop(state);
        self.shared.notify.notify_waiters();
    }

    /// Makes the next `count` connection attempts fail.
    pub fn refuse_connections(&self, count: usize) {
        self.shared.state.lock().refuse = count;
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.shared.state.lock().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.shared.state.lock().queues.contains_key(name)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Messages ready for delivery in `queue`.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    /// Deliveries from `queue` awaiting acknowledgment.
    pub fn unacked_len(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .unacked
            .values()
            .filter(|u| u.queue == queue)
            .count()
    }

    /// Total number of manual acknowledgments received.
    pub fn acknowledged(&self) -> usize {
        self.shared.state.lock().acknowledged
    }

    pub fn connect_attempts(&self) -> usize {
        self.shared.state.lock().connect_attempts
    }

    pub fn connection_count(&self) -> usize {
        self.shared.state.lock().connections.len()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _config: &BrokerConfig) -> Result<Arc<dyn Connection>> {
        let mut state = self.shared.state.lock();
        state.connect_attempts += 1;
        if state.refuse > 0 {
            state.refuse -= 1;
            return Err(AmrpcError::Connection("connection refused".to_string()));
        }
        let id = state.next_id();
        let token = CancellationToken::new();
        state.connections.insert(id, token.clone());
        tracing::trace!(connection = id, "memory broker: connection opened");
        Ok(Arc::new(MemoryConnection {
            shared: self.shared.clone(),
            id,
            token,
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    id: u64,
    token: CancellationToken,
}

impl MemoryConnection {
    fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if state.connections.contains_key(&self.id) {
            state.close_connection(self.id);
            drop(state);
            self.shared.notify.notify_waiters();
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>> {
        if self.token.is_cancelled() {
            return Err(AmrpcError::Connection("connection is closed".to_string()));
        }
        let mut state = self.shared.state.lock();
        let id = state.next_id();
        let token = self.token.child_token();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                prefetch: 0,
                unacked: 0,
                token: token.clone(),
            },
        );
        Ok(Arc::new(MemoryChannel {
            shared: self.shared.clone(),
            id,
            connection: self.id,
            token,
        }))
    }

    fn is_open(&self) -> bool {
        !self.token.is_cancelled()
    }

    async fn close(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct MemoryChannel {
    shared: Arc<Shared>,
    id: u64,
    connection: u64,
    token: CancellationToken,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(AmrpcError::Transport("channel is closed".to_string()))
        } else {
            Ok(())
        }
    }

    fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if state.channels.contains_key(&self.id) {
            state.close_channel(self.id);
            drop(state);
            self.shared.notify.notify_waiters();
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(AmrpcError::Transport(format!(
                "PRECONDITION_FAILED - exchange '{}' already declared as {}",
                name, existing
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = count;
        }
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn declare_queue(&self, options: QueueOptions) -> Result<String> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        let name = if options.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            options.name
        };
        if let Some(queue) = state.queues.get(&name) {
            return match queue.exclusive_owner {
                Some(owner) if owner != self.connection => Err(AmrpcError::Transport(format!(
                    "RESOURCE_LOCKED - queue '{}' is exclusive to another connection",
                    name
                ))),
                _ => Ok(name),
            };
        }
        state.queues.insert(
            name.clone(),
            QueueState {
                messages: VecDeque::new(),
                exclusive_owner: options.exclusive.then_some(self.connection),
                auto_delete: options.auto_delete,
                consumers: Vec::new(),
            },
        );
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        if !state.queues.contains_key(queue) {
            return Err(AmrpcError::Transport(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(AmrpcError::Transport(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }
        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, mode: AckMode) -> Result<DeliveryStream> {
        self.ensure_open()?;
        {
            let mut state = self.shared.state.lock();
            match state.queues.get_mut(queue) {
                None => {
                    return Err(AmrpcError::Transport(format!("NOT_FOUND - no queue '{}'", queue)))
                }
                Some(q) if q.exclusive_owner.is_some_and(|o| o != self.connection) => {
                    return Err(AmrpcError::Transport(format!(
                        "RESOURCE_LOCKED - queue '{}' is exclusive to another connection",
                        queue
                    )))
                }
                Some(q) => q.consumers.push(self.id),
            }
        }

        let consumer = Consumer {
            shared: self.shared.clone(),
            queue: queue.to_string(),
            channel: self.id,
            mode,
            token: self.token.clone(),
            done: false,
        };

        Ok(Box::pin(stream::unfold(consumer, |mut consumer| async move {
            if consumer.done {
                return None;
            }
            match consumer.next_delivery().await {
                Ok(delivery) => Some((Ok(delivery), consumer)),
                Err(err) => {
                    consumer.done = true;
                    Some((Err(err), consumer))
                }
            }
        })))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties,
            body,
        };

        let targets: BTreeSet<String> = if exchange == DEFAULT_EXCHANGE {
            std::iter::once(routing_key.to_string()).collect()
        } else {
            let kind = *state.exchanges.get(exchange).ok_or_else(|| {
                AmrpcError::Transport(format!("NOT_FOUND - no exchange '{}'", exchange))
            })?;
            state
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange)
                .filter(|b| kind == ExchangeKind::Fanout || topic_matches(&b.routing_key, routing_key))
                .map(|b| b.queue.clone())
                .collect()
        };

        let mut routed = 0;
        for name in &targets {
            if let Some(queue) = state.queues.get_mut(name) {
                queue.messages.push_back(message.clone());
                routed += 1;
            }
        }
        drop(state);

        if routed == 0 {
            tracing::trace!(exchange, routing_key, "memory broker: unroutable message dropped");
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        match state.unacked.get(&delivery_tag) {
            Some(entry) if entry.channel == self.id => {}
            _ => {
                return Err(AmrpcError::Transport(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    delivery_tag
                )))
            }
        }
        state.unacked.remove(&delivery_tag);
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.unacked = channel.unacked.saturating_sub(1);
        }
        state.acknowledged += 1;
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        state.delete_queue(queue);
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.token.is_cancelled()
    }

    async fn close(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Consumer {
    shared: Arc<Shared>,
    queue: String,
    channel: u64,
    mode: AckMode,
    token: CancellationToken,
    done: bool,
}

impl Consumer {
    async fn next_delivery(&self) -> Result<Delivery> {
        loop {
            // Registered before checking so a publish in between is not missed
            let notified = self.shared.notify.notified();
            if let Some(delivery) = self.try_take()? {
                return Ok(delivery);
            }
            tokio::select! {
                _ = notified => {}
                _ = self.token.cancelled() => {
                    return Err(AmrpcError::Transport("channel is closed".to_string()));
                }
            }
        }
    }

    fn try_take(&self) -> Result<Option<Delivery>> {
        if self.token.is_cancelled() {
            return Err(AmrpcError::Transport("channel is closed".to_string()));
        }
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;

        let channel = state
            .channels
            .get_mut(&self.channel)
            .ok_or_else(|| AmrpcError::Transport("channel is closed".to_string()))?;
        if self.mode == AckMode::Manual
            && channel.prefetch > 0
            && channel.unacked >= channel.prefetch as usize
        {
            return Ok(None);
        }

        let queue = state.queues.get_mut(&self.queue).ok_or_else(|| {
            AmrpcError::Transport(format!("queue '{}' was deleted", self.queue))
        })?;
        let message = match queue.messages.pop_front() {
            Some(message) => message,
            None => return Ok(None),
        };

        state.next_tag += 1;
        let delivery_tag = state.next_tag;
        let delivery = Delivery {
            delivery_tag,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            properties: message.properties.clone(),
            body: message.body.clone(),
        };
        if self.mode == AckMode::Manual {
            channel.unacked += 1;
            state.unacked.insert(
                delivery_tag,
                Unacked {
                    queue: self.queue.clone(),
                    channel: self.channel,
                    message,
                },
            );
        }
        Ok(Some(delivery))
    }
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn close_channel(&mut self, id: u64) {
        let Some(channel) = self.channels.remove(&id) else {
            return;
        };
        channel.token.cancel();

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == id)
            .map(|(tag, _)| *tag)
            .collect();
        // Newest first, so pushing to the front restores delivery order
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(entry) = self.unacked.remove(&tag) {
                if let Some(queue) = self.queues.get_mut(&entry.queue) {
                    queue.messages.push_front(entry.message);
                }
            }
        }

        // Auto-delete queues go away with their last consumer
        let mut orphaned = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| *c != id);
            if queue.auto_delete && before > 0 && queue.consumers.is_empty() {
                orphaned.push(name.clone());
            }
        }
        for name in orphaned {
            self.delete_queue(&name);
        }
    }

    fn close_connection(&mut self, id: u64) {
        if let Some(token) = self.connections.remove(&id) {
            token.cancel();
        }
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == id)
            .map(|(channel, _)| *channel)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }
        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.exclusive_owner == Some(id))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in exclusive {
            self.delete_queue(&queue);
        }
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);
        self.bindings.retain(|b| b.queue != name);
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.queue == name)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some(entry) = self.unacked.remove(&tag) {
                if let Some(channel) = self.channels.get_mut(&entry.channel) {
                    channel.unacked = channel.unacked.saturating_sub(1);
                }
            }
        }
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` zero or more words.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn words_match(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && words_match(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && words_match(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

#[cfg(test)]
mod tests {
    use super::topic_matches;

    #[test]
    fn test_topic_word_semantics() {
        assert!(topic_matches("am.ping", "am.ping"));
        assert!(!topic_matches("am.ping", "am.pong"));
        assert!(topic_matches("am.*", "am.ping"));
        assert!(!topic_matches("am.*", "am.math.ping"));
        assert!(topic_matches("am.#", "am"));
        assert!(topic_matches("am.#", "am.math.ping"));
        assert!(topic_matches("#.ping", "am.math.ping"));
        assert!(!topic_matches("am.*.ping", "am.ping"));
    }
}
