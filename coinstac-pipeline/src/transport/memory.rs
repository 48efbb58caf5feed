//! In-process broker
//!
//! Connects managers living in one process, e.g. a simulated federation or
//! tests. Topics are `<run>/remote` for the aggregator and
//! `<run>/local/<username>` for each participant. A topic without a
//! subscriber keeps its messages until somebody subscribes.

use async_trait::async_trait;
use coinstac_core::domain::run::RunMode;
use coinstac_core::dto::transport::TransportMessage;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Subscription, Transport};
use crate::error::{PipelineError, Result};

const MAX_BACKLOG: usize = 1024;

#[derive(Default)]
struct Topic {
    subscriber: Option<mpsc::Sender<TransportMessage>>,
    backlog: VecDeque<TransportMessage>,
}

impl Topic {
    fn buffer(&mut self, topic: &str, message: TransportMessage) {
        if self.backlog.len() >= MAX_BACKLOG {
            warn!("Backlog of topic {} is full, dropping its oldest message", topic);
            self.backlog.pop_front();
        }
        debug!("Buffering message for topic {} until it has a subscriber", topic);
        self.backlog.push_back(message);
    }
}

/// Shared hub every [`MemoryTransport`] of a federation talks through
#[derive(Clone, Default)]
pub struct MemoryBroker {
    topics: Arc<Mutex<HashMap<String, Topic>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport for the node `node_id` playing `mode`
    pub fn transport(&self, node_id: impl Into<String>, mode: RunMode) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
            node_id: node_id.into(),
            mode,
            subscribed: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Hands `message` to the topic's subscriber, waiting while its queue is
    /// full, or keeps it until somebody subscribes
    async fn deliver(&self, topic: &str, message: TransportMessage) {
        let subscriber = {
            let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
            let entry = topics.entry(topic.to_string()).or_default();
            match &entry.subscriber {
                Some(tx) => tx.clone(),
                None => {
                    entry.buffer(topic, message);
                    return;
                }
            }
        };

        if let Err(mpsc::error::SendError(message)) = subscriber.send(message).await {
            let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
            let entry = topics.entry(topic.to_string()).or_default();
            if entry
                .subscriber
                .as_ref()
                .is_some_and(|tx| tx.same_channel(&subscriber))
            {
                entry.subscriber = None;
            }
            entry.buffer(topic, message);
        }
    }

    fn attach(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(MAX_BACKLOG);
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        let entry = topics.entry(topic.to_string()).or_default();

        for message in entry.backlog.drain(..) {
            // The backlog never outgrows the channel
            if tx.try_send(message).is_err() {
                warn!("Dropping backlog message for topic {}", topic);
            }
        }
        entry.subscriber = Some(tx);
        rx
    }

    fn detach(&self, topic: &str) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics.remove(topic);
    }
}

fn aggregator_topic(run_id: &str) -> String {
    format!("{}/remote", run_id)
}

fn participant_topic(run_id: &str, username: &str) -> String {
    format!("{}/local/{}", run_id, username)
}

/// One node's connection to a [`MemoryBroker`]
pub struct MemoryTransport {
    broker: MemoryBroker,
    node_id: String,
    mode: RunMode,
    subscribed: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    fn own_topic(&self, run_id: &str) -> String {
        match self.mode {
            RunMode::Remote => aggregator_topic(run_id),
            RunMode::Local => participant_topic(run_id, &self.node_id),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::Transport(format!(
                "transport of {} is closed",
                self.node_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, run_id: &str, message: TransportMessage) -> Result<()> {
        self.ensure_open()?;

        match &message {
            TransportMessage::Local(_) => {
                self.broker.deliver(&aggregator_topic(run_id), message).await;
            }
            TransportMessage::Remote(remote) => {
                for username in &remote.usernames {
                    self.broker
                        .deliver(&participant_topic(run_id, username), message.clone())
                        .await;
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&self, run_id: &str) -> Result<Subscription> {
        self.ensure_open()?;

        let topic = self.own_topic(run_id);
        debug!("{} subscribing to {}", self.node_id, topic);
        let subscription = self.broker.attach(&topic);
        self.subscribed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(topic);
        Ok(subscription)
    }

    async fn unsubscribe(&self, run_id: &str) -> Result<()> {
        let topic = self.own_topic(run_id);
        self.broker.detach(&topic);
        self.subscribed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&topic);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let topics: Vec<String> = self
            .subscribed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for topic in topics {
            self.broker.detach(&topic);
        }
        debug!("Transport of {} closed", self.node_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coinstac_core::dto::transport::{LocalResult, PluginState, RemoteResult};
    use serde_json::json;
    use std::time::Duration;

    fn local(username: &str, iteration: u32) -> TransportMessage {
        TransportMessage::Local(LocalResult {
            username: username.to_string(),
            run_id: "run-1".to_string(),
            step: 0,
            iteration,
            data: json!({ "n": iteration }),
            plugin_state: PluginState::default(),
            error: None,
            files: vec![],
        })
    }

    fn remote(usernames: &[&str]) -> TransportMessage {
        TransportMessage::Remote(RemoteResult {
            run_id: "run-1".to_string(),
            step: 0,
            iteration: 1,
            usernames: usernames.iter().map(|u| u.to_string()).collect(),
            user_results: vec![],
            data: json!({}),
            plugin_state: PluginState::default(),
            complete: false,
            error: None,
            files: vec![],
        })
    }

    #[tokio::test]
    async fn test_early_messages_are_buffered() {
        let broker = MemoryBroker::new();
        let alice = broker.transport("alice", RunMode::Local);
        let server = broker.transport("server", RunMode::Remote);

        alice.publish("run-1", local("alice", 1)).await.unwrap();
        alice.publish("run-1", local("alice", 2)).await.unwrap();

        let mut rx = server.subscribe("run-1").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().iteration(), 1);
        assert_eq!(rx.recv().await.unwrap().iteration(), 2);
    }

    #[tokio::test]
    async fn test_remote_result_fans_out() {
        let broker = MemoryBroker::new();
        let alice = broker.transport("alice", RunMode::Local);
        let bob = broker.transport("bob", RunMode::Local);
        let server = broker.transport("server", RunMode::Remote);

        let mut alice_rx = alice.subscribe("run-1").await.unwrap();
        let mut bob_rx = bob.subscribe("run-1").await.unwrap();

        server.publish("run-1", remote(&["alice", "bob"])).await.unwrap();

        assert!(matches!(alice_rx.recv().await, Some(TransportMessage::Remote(_))));
        assert!(matches!(bob_rx.recv().await, Some(TransportMessage::Remote(_))));
    }

    #[tokio::test]
    async fn test_runs_are_isolated() {
        let broker = MemoryBroker::new();
        let alice = broker.transport("alice", RunMode::Local);
        let server = broker.transport("server", RunMode::Remote);

        let mut rx = server.subscribe("run-2").await.unwrap();
        alice.publish("run-1", local("alice", 1)).await.unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publisher_waits_for_a_full_subscriber() {
        let broker = MemoryBroker::new();
        let alice = broker.transport("alice", RunMode::Local);
        let server = broker.transport("server", RunMode::Remote);
        let mut rx = server.subscribe("run-1").await.unwrap();

        for iteration in 0..MAX_BACKLOG as u32 {
            alice.publish("run-1", local("alice", iteration)).await.unwrap();
        }
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            alice.publish("run-1", local("alice", 9999)),
        )
        .await;
        assert!(blocked.is_err());

        assert_eq!(rx.recv().await.unwrap().iteration(), 0);
        alice.publish("run-1", local("alice", 10_000)).await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_calls() {
        let broker = MemoryBroker::new();
        let server = broker.transport("server", RunMode::Remote);
        let mut rx = server.subscribe("run-1").await.unwrap();

        server.close().await.unwrap();

        assert!(matches!(
            server.publish("run-1", remote(&["alice"])).await,
            Err(PipelineError::Transport(_))
        ));
        assert!(server.subscribe("run-1").await.is_err());
        // Subscriptions end when the transport closes
        assert!(rx.recv().await.is_none());
    }
}
