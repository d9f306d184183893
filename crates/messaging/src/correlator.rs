use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::message::Message;

/// In-memory registry correlating inbound answers to waiting senders.
///
/// Each pending `send_and_await_answers` call owns the receiving half of
/// its channel, so concurrent waiters never see each other's answers.
#[derive(Debug, Default)]
pub(crate) struct AnswerCorrelator {
    waiters: Mutex<HashMap<Uuid, mpsc::UnboundedSender<Message>>>,
}

impl AnswerCorrelator {
    /// Registers a waiter for answers to `message_id`.
    pub fn register(&self, message_id: Uuid) -> mpsc::UnboundedReceiver<Message> {
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.insert(message_id, sender);
        }
        receiver
    }

    /// Removes the waiter for `message_id`; late answers are dropped.
    pub fn deregister(&self, message_id: Uuid) {
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.remove(&message_id);
        }
    }

    /// Hands an answer to its pending waiter, if any.
    ///
    /// Returns whether a waiter consumed it.
    pub fn offer(&self, answer: &Message) -> bool {
        let Some(in_answer_to) = answer.in_answer_to else {
            return false;
        };
        let Ok(waiters) = self.waiters.lock() else {
            return false;
        };
        waiters
            .get(&in_answer_to)
            .is_some_and(|sender| sender.send(answer.clone()).is_ok())
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer_to(id: Uuid) -> Message {
        let mut original = Message::new("ping");
        original.id = id;
        original.sender = "node-a".into();
        Message::answer_to(&original)
    }

    #[tokio::test]
    async fn test_offer_routes_to_matching_waiter() {
        let correlator = AnswerCorrelator::default();
        let id = Uuid::new_v4();
        let mut receiver = correlator.register(id);

        assert!(correlator.offer(&answer_to(id)));
        assert!(!correlator.offer(&answer_to(Uuid::new_v4())));

        let delivered = receiver.recv().await.unwrap();
        assert_eq!(delivered.in_answer_to, Some(id));
    }

    #[tokio::test]
    async fn test_deregistered_waiter_drops_answers() {
        let correlator = AnswerCorrelator::default();
        let id = Uuid::new_v4();
        let _receiver = correlator.register(id);

        correlator.deregister(id);
        assert!(!correlator.offer(&answer_to(id)));
    }

    #[tokio::test]
    async fn test_concurrent_waiters_are_isolated() {
        let correlator = AnswerCorrelator::default();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let mut first_rx = correlator.register(first);
        let mut second_rx = correlator.register(second);

        assert!(correlator.offer(&answer_to(second)));

        assert_eq!(
            second_rx.recv().await.unwrap().in_answer_to,
            Some(second)
        );
        assert!(first_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_non_answer_is_never_consumed() {
        let correlator = AnswerCorrelator::default();
        let id = Uuid::new_v4();
        let _receiver = correlator.register(id);

        let mut plain = Message::new("ping");
        plain.id = id;
        assert!(!correlator.offer(&plain));
    }
}
