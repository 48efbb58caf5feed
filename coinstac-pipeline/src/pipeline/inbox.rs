use coinstac_core::dto::transport::TransportMessage;
use std::collections::VecDeque;
use tracing::debug;

use crate::transport::Subscription;

/// A run's incoming messages, sorted by step
///
/// Messages for a step that already finished are dropped; messages for a
/// step that has not started yet are held until it does.
pub struct Inbox {
    subscription: Subscription,
    deferred: VecDeque<TransportMessage>,
}

impl Inbox {
    pub fn new(subscription: Subscription) -> Self {
        Self {
            subscription,
            deferred: VecDeque::new(),
        }
    }

    /// Next message for `step`, `None` once the subscription is gone
    ///
    /// Cancel safe: a message is either returned or kept.
    pub async fn next(&mut self, step: usize) -> Option<TransportMessage> {
        self.deferred.retain(|m| m.step() >= step);
        if let Some(pos) = self.deferred.iter().position(|m| m.step() == step) {
            return self.deferred.remove(pos);
        }

        loop {
            let message = self.subscription.recv().await?;
            match message.step().cmp(&step) {
                std::cmp::Ordering::Equal => return Some(message),
                std::cmp::Ordering::Less => {
                    debug!(
                        "Dropping message for finished step {} (iteration {})",
                        message.step(),
                        message.iteration()
                    );
                }
                std::cmp::Ordering::Greater => self.deferred.push_back(message),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coinstac_core::dto::transport::{LocalResult, PluginState};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn message(step: usize, iteration: u32) -> TransportMessage {
        TransportMessage::Local(LocalResult {
            username: "alice".to_string(),
            run_id: "run-1".to_string(),
            step,
            iteration,
            data: json!(null),
            plugin_state: PluginState::default(),
            error: None,
            files: vec![],
        })
    }

    #[tokio::test]
    async fn test_sorts_messages_by_step() {
        let (tx, rx) = mpsc::channel(8);
        let mut inbox = Inbox::new(rx);

        tx.send(message(0, 1)).await.unwrap();
        tx.send(message(2, 1)).await.unwrap();
        tx.send(message(1, 4)).await.unwrap();

        assert_eq!(inbox.next(1).await.unwrap().iteration(), 4);
        assert_eq!(inbox.next(2).await.unwrap().step(), 2);

        drop(tx);
        assert!(inbox.next(2).await.is_none());
    }
}
