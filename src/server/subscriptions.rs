//! # Subscription Manager
//!
//! Tracks which session receives pushes for which queue — at most one
//! subscriber per queue. Sessions are reached only through their bounded
//! delivery channel: when a session dies its receiver is dropped and the
//! manager cleans the entry up on the next failed send, so the manager
//! never holds a direct session reference.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::EntityId;
use crate::server::store::QueueMessage;

pub type SessionId = u64;

/// What gets pushed into a subscriber's delivery channel.
#[derive(Debug)]
pub enum Delivery {
    Msg {
        queue: EntityId,
        msg: QueueMessage,
    },
    /// The subscription was taken over by another session.
    End {
        queue: EntityId,
    },
}

#[derive(Clone)]
pub struct Subscriber {
    pub session: SessionId,
    tx: mpsc::Sender<Delivery>,
}

impl Subscriber {
    pub fn new(session: SessionId, tx: mpsc::Sender<Delivery>) -> Self {
        Self { session, tx }
    }
}

#[derive(Default)]
struct Inner {
    by_queue: HashMap<EntityId, Subscriber>,
    by_session: HashMap<SessionId, HashSet<EntityId>>,
}

#[derive(Default)]
pub struct SubscriptionManager {
    inner: Mutex<Inner>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `subscriber` to `queue`, evicting any previous session
    /// (which is sent `END` first).
    pub fn subscribe(&self, queue: EntityId, subscriber: Subscriber) {
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.by_queue.remove(&queue) {
            if previous.session != subscriber.session {
                debug!(session = previous.session, queue = %queue, "evicting subscriber");
                let _ = previous.tx.try_send(Delivery::End {
                    queue: queue.clone(),
                });
                if let Some(queues) = inner.by_session.get_mut(&previous.session) {
                    queues.remove(&queue);
                }
            }
        }
        inner
            .by_session
            .entry(subscriber.session)
            .or_default()
            .insert(queue.clone());
        inner.by_queue.insert(queue, subscriber);
    }

    /// Remove one subscription of one session (queue deleted).
    pub fn unsubscribe(&self, queue: &EntityId, session: SessionId) {
        let mut inner = self.inner.lock();
        if inner
            .by_queue
            .get(queue)
            .is_some_and(|s| s.session == session)
        {
            inner.by_queue.remove(queue);
        }
        if let Some(queues) = inner.by_session.get_mut(&session) {
            queues.remove(queue);
        }
    }

    /// Drop a queue's subscription entirely (queue deleted).
    pub fn remove_queue(&self, queue: &EntityId) {
        let mut inner = self.inner.lock();
        if let Some(subscriber) = inner.by_queue.remove(queue) {
            if let Some(queues) = inner.by_session.get_mut(&subscriber.session) {
                queues.remove(queue);
            }
        }
    }

    /// Drop every subscription of a terminating session.
    pub fn unsubscribe_session(&self, session: SessionId) {
        let mut inner = self.inner.lock();
        if let Some(queues) = inner.by_session.remove(&session) {
            for queue in queues {
                if inner
                    .by_queue
                    .get(&queue)
                    .is_some_and(|s| s.session == session)
                {
                    inner.by_queue.remove(&queue);
                }
            }
        }
    }

    /// Whether `session` currently holds the subscription for `queue`.
    pub fn is_subscriber(&self, queue: &EntityId, session: SessionId) -> bool {
        self.inner
            .lock()
            .by_queue
            .get(queue)
            .is_some_and(|s| s.session == session)
    }

    /// Push a message to the queue's subscriber. Returns `false` when
    /// there is no (live) subscriber; dead entries are removed here.
    pub fn deliver(&self, queue: &EntityId, msg: QueueMessage) -> bool {
        let mut inner = self.inner.lock();
        let Some(subscriber) = inner.by_queue.get(queue) else {
            return false;
        };
        let delivery = Delivery::Msg {
            queue: queue.clone(),
            msg,
        };
        if subscriber.tx.try_send(delivery).is_err() {
            let session = subscriber.session;
            inner.by_queue.remove(queue);
            if let Some(queues) = inner.by_session.get_mut(&session) {
                queues.remove(queue);
            }
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn msg(id: u64) -> QueueMessage {
        QueueMessage {
            msg_id: id,
            timestamp: Utc::now(),
            body: vec![id as u8],
        }
    }

    #[tokio::test]
    async fn delivers_to_single_subscriber() {
        let mgr = SubscriptionManager::new();
        let queue = EntityId::generate();
        let (tx, mut rx) = mpsc::channel(4);
        mgr.subscribe(queue.clone(), Subscriber::new(1, tx));

        assert!(mgr.deliver(&queue, msg(1)));
        match rx.recv().await.unwrap() {
            Delivery::Msg { msg, .. } => assert_eq!(msg.msg_id, 1),
            other => panic!("unexpected delivery: {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_subscriber_evicts_first_with_end() {
        let mgr = SubscriptionManager::new();
        let queue = EntityId::generate();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);

        mgr.subscribe(queue.clone(), Subscriber::new(1, tx_a));
        mgr.subscribe(queue.clone(), Subscriber::new(2, tx_b));

        match rx_a.recv().await.unwrap() {
            Delivery::End { queue: q } => assert_eq!(q, queue),
            other => panic!("expected END, got {other:?}"),
        }
        assert!(mgr.is_subscriber(&queue, 2));
        assert!(!mgr.is_subscriber(&queue, 1));

        assert!(mgr.deliver(&queue, msg(1)));
        assert!(matches!(rx_b.recv().await.unwrap(), Delivery::Msg { .. }));
    }

    #[tokio::test]
    async fn dead_subscriber_is_cleaned_up_on_send() {
        let mgr = SubscriptionManager::new();
        let queue = EntityId::generate();
        let (tx, rx) = mpsc::channel(4);
        mgr.subscribe(queue.clone(), Subscriber::new(1, tx));
        drop(rx);

        assert!(!mgr.deliver(&queue, msg(1)));
        assert!(!mgr.is_subscriber(&queue, 1));
    }

    #[tokio::test]
    async fn session_teardown_releases_all_queues() {
        let mgr = SubscriptionManager::new();
        let (tx, _rx) = mpsc::channel(4);
        let q1 = EntityId::generate();
        let q2 = EntityId::generate();
        mgr.subscribe(q1.clone(), Subscriber::new(1, tx.clone()));
        mgr.subscribe(q2.clone(), Subscriber::new(1, tx));

        mgr.unsubscribe_session(1);
        assert!(!mgr.is_subscriber(&q1, 1));
        assert!(!mgr.is_subscriber(&q2, 1));
    }
}
