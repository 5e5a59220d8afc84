//! # Broker Queue Store
//!
//! Queue records are persisted in SQLite so queues survive broker
//! restarts; message buffers are in-memory only and vanish with the
//! process (durability of enqueued messages is not a requirement of the
//! protocol).
//!
//! Identifier uniqueness — including the one-queue-per-sender-id rule —
//! is enforced by insert-or-fail on the primary key and unique index, not
//! by lookup-then-insert. Per-queue in-memory state sits behind a
//! per-queue mutex; the SQLite connection is serialised behind its own
//! lock and is never awaited on.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::crypto::VerifyKey;
use crate::protocol::EntityId;

const SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS queues (
    recipient_id   BLOB NOT NULL PRIMARY KEY,
    sender_id      BLOB NOT NULL UNIQUE,
    recipient_key  BLOB NOT NULL,
    sender_key     BLOB,
    status         TEXT NOT NULL,
    created_at     TEXT NOT NULL
);
";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("identifier collision")]
    Duplicate,
    #[error("queue not found")]
    NotFound,
    #[error("key mismatch")]
    Auth,
    #[error("message quota exceeded")]
    Quota,
    #[error("active queue limit reached")]
    QueueLimit,
    #[error("no message to acknowledge")]
    NoMsg,
    #[error("database failure: {0}")]
    Db(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    New,
    Secured,
    Active,
    Disabled,
}

impl QueueStatus {
    fn as_str(self) -> &'static str {
        match self {
            QueueStatus::New => "new",
            QueueStatus::Secured => "secured",
            QueueStatus::Active => "active",
            QueueStatus::Disabled => "disabled",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "new" => QueueStatus::New,
            "secured" => QueueStatus::Secured,
            "active" => QueueStatus::Active,
            "disabled" => QueueStatus::Disabled,
            _ => return None,
        })
    }
}

/// Persistent part of a queue.
#[derive(Clone)]
pub struct QueueRecord {
    pub recipient_id: EntityId,
    pub sender_id: EntityId,
    pub recipient_key: VerifyKey,
    pub sender_key: Option<VerifyKey>,
    pub status: QueueStatus,
    pub created_at: DateTime<Utc>,
}

/// One buffered message.
#[derive(Clone, Debug, PartialEq)]
pub struct QueueMessage {
    pub msg_id: u64,
    pub timestamp: DateTime<Utc>,
    pub body: Vec<u8>,
}

struct QueueState {
    record: QueueRecord,
    messages: VecDeque<QueueMessage>,
    next_msg_id: u64,
    /// A message has been pushed to the subscriber and not yet ACKed;
    /// suppresses duplicate pushes.
    delivery_pending: bool,
}

/// Authentication view of the sending side of a queue.
pub struct SenderView {
    pub recipient_id: EntityId,
    pub sender_key: Option<VerifyKey>,
    pub status: QueueStatus,
}

pub struct QueueStore {
    db: Mutex<Connection>,
    queues: RwLock<HashMap<EntityId, Arc<Mutex<QueueState>>>>,
    by_sender: RwLock<HashMap<EntityId, EntityId>>,
    quota: usize,
    max_queues: usize,
}

impl QueueStore {
    /// Open (creating if needed) the queue database and load all queue
    /// records; buffers start empty.
    pub fn open(path: &Path, quota: usize, max_queues: usize) -> Result<Self, StoreError> {
        let db = Connection::open(path)?;
        migrate(&db)?;

        let mut queues = HashMap::new();
        let mut by_sender = HashMap::new();
        {
            let mut stmt = db.prepare(
                "SELECT recipient_id, sender_id, recipient_key, sender_key, status, created_at
                 FROM queues",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, Option<Vec<u8>>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?;
            for row in rows {
                let (rid, sid, rkey, skey, status, created) = row?;
                let record = QueueRecord {
                    recipient_id: EntityId::from_bytes(rid),
                    sender_id: EntityId::from_bytes(sid),
                    recipient_key: VerifyKey::from_bytes(&rkey)
                        .map_err(|_| StoreError::NotFound)?,
                    sender_key: match skey {
                        Some(bytes) => {
                            Some(VerifyKey::from_bytes(&bytes).map_err(|_| StoreError::NotFound)?)
                        }
                        None => None,
                    },
                    status: QueueStatus::from_str(&status).ok_or(StoreError::NotFound)?,
                    created_at: DateTime::parse_from_rfc3339(&created)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                };
                by_sender.insert(record.sender_id.clone(), record.recipient_id.clone());
                queues.insert(
                    record.recipient_id.clone(),
                    Arc::new(Mutex::new(QueueState {
                        record,
                        messages: VecDeque::new(),
                        next_msg_id: 1,
                        delivery_pending: false,
                    })),
                );
            }
        }
        debug!(queues = queues.len(), "queue store loaded");

        Ok(Self {
            db: Mutex::new(db),
            queues: RwLock::new(queues),
            by_sender: RwLock::new(by_sender),
            quota,
            max_queues,
        })
    }

    /// Create a queue owned by the holder of `recipient_key`.
    pub fn create(&self, recipient_key: VerifyKey) -> Result<(EntityId, EntityId), StoreError> {
        if self.queues.read().len() >= self.max_queues {
            return Err(StoreError::QueueLimit);
        }
        let recipient_id = EntityId::generate();
        let sender_id = EntityId::generate();
        let created_at = Utc::now();

        {
            let db = self.db.lock();
            db.execute(
                "INSERT INTO queues (recipient_id, sender_id, recipient_key, sender_key, status, created_at)
                 VALUES (?1, ?2, ?3, NULL, ?4, ?5)",
                params![
                    recipient_id.as_bytes(),
                    sender_id.as_bytes(),
                    recipient_key.to_bytes().as_slice(),
                    QueueStatus::New.as_str(),
                    created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::Duplicate
                }
                other => StoreError::Db(other),
            })?;
        }

        let record = QueueRecord {
            recipient_id: recipient_id.clone(),
            sender_id: sender_id.clone(),
            recipient_key,
            sender_key: None,
            status: QueueStatus::New,
            created_at,
        };
        self.by_sender
            .write()
            .insert(sender_id.clone(), recipient_id.clone());
        self.queues.write().insert(
            recipient_id.clone(),
            Arc::new(Mutex::new(QueueState {
                record,
                messages: VecDeque::new(),
                next_msg_id: 1,
                delivery_pending: false,
            })),
        );
        Ok((recipient_id, sender_id))
    }

    fn state(&self, recipient_id: &EntityId) -> Option<Arc<Mutex<QueueState>>> {
        self.queues.read().get(recipient_id).cloned()
    }

    /// Recipient key for signature checks; `None` if the queue is unknown.
    pub fn recipient_key(&self, recipient_id: &EntityId) -> Option<VerifyKey> {
        self.state(recipient_id)
            .map(|s| s.lock().record.recipient_key.clone())
    }

    /// Resolve a sender id to its queue and sending-side credentials.
    pub fn sender_view(&self, sender_id: &EntityId) -> Option<SenderView> {
        let recipient_id = self.by_sender.read().get(sender_id).cloned()?;
        let state = self.state(&recipient_id)?;
        let state = state.lock();
        Some(SenderView {
            recipient_id,
            sender_key: state.record.sender_key.clone(),
            status: state.record.status,
        })
    }

    /// Set the sender key, securing the queue. Idempotent with the same
    /// key; any other key (or a disabled queue) fails with `Auth`.
    pub fn secure(&self, recipient_id: &EntityId, key: VerifyKey) -> Result<(), StoreError> {
        let state = self.state(recipient_id).ok_or(StoreError::NotFound)?;
        let mut state = state.lock();
        match (&state.record.sender_key, state.record.status) {
            (Some(existing), _) if *existing == key => Ok(()),
            (Some(_), _) => Err(StoreError::Auth),
            (None, QueueStatus::Disabled) => Err(StoreError::Auth),
            (None, _) => {
                self.db.lock().execute(
                    "UPDATE queues SET sender_key = ?1, status = ?2 WHERE recipient_id = ?3",
                    params![
                        key.to_bytes().as_slice(),
                        QueueStatus::Secured.as_str(),
                        recipient_id.as_bytes(),
                    ],
                )?;
                state.record.sender_key = Some(key);
                state.record.status = QueueStatus::Secured;
                Ok(())
            }
        }
    }

    /// First signed SEND on a secured queue makes it active.
    pub fn mark_active(&self, recipient_id: &EntityId) -> Result<(), StoreError> {
        let state = self.state(recipient_id).ok_or(StoreError::NotFound)?;
        let mut state = state.lock();
        if state.record.status == QueueStatus::Secured {
            self.db.lock().execute(
                "UPDATE queues SET status = ?1 WHERE recipient_id = ?2",
                params![QueueStatus::Active.as_str(), recipient_id.as_bytes()],
            )?;
            state.record.status = QueueStatus::Active;
        }
        Ok(())
    }

    /// Disable the queue: future SENDs are refused, the buffer stays.
    pub fn disable(&self, recipient_id: &EntityId) -> Result<(), StoreError> {
        let state = self.state(recipient_id).ok_or(StoreError::NotFound)?;
        let mut state = state.lock();
        if state.record.status != QueueStatus::Disabled {
            self.db.lock().execute(
                "UPDATE queues SET status = ?1 WHERE recipient_id = ?2",
                params![QueueStatus::Disabled.as_str(), recipient_id.as_bytes()],
            )?;
            state.record.status = QueueStatus::Disabled;
        }
        Ok(())
    }

    /// Remove the queue and its buffer.
    pub fn delete(&self, recipient_id: &EntityId) -> Result<(), StoreError> {
        let state = self
            .queues
            .write()
            .remove(recipient_id)
            .ok_or(StoreError::NotFound)?;
        let sender_id = state.lock().record.sender_id.clone();
        self.by_sender.write().remove(&sender_id);
        self.db.lock().execute(
            "DELETE FROM queues WHERE recipient_id = ?1",
            params![recipient_id.as_bytes()],
        )?;
        Ok(())
    }

    /// Buffer a message. Fails with `Quota` when the buffer is full.
    pub fn enqueue(&self, recipient_id: &EntityId, body: Vec<u8>) -> Result<QueueMessage, StoreError> {
        let state = self.state(recipient_id).ok_or(StoreError::NotFound)?;
        let mut state = state.lock();
        if state.messages.len() >= self.quota {
            return Err(StoreError::Quota);
        }
        let msg = QueueMessage {
            msg_id: state.next_msg_id,
            timestamp: Utc::now(),
            body,
        };
        state.next_msg_id += 1;
        state.messages.push_back(msg.clone());
        Ok(msg)
    }

    /// Head of the buffer if nothing is already pending delivery; marks it
    /// pending.
    pub fn take_deliverable(&self, recipient_id: &EntityId) -> Option<QueueMessage> {
        let state = self.state(recipient_id)?;
        let mut state = state.lock();
        if state.delivery_pending {
            return None;
        }
        let msg = state.messages.front().cloned()?;
        state.delivery_pending = true;
        Some(msg)
    }

    /// Undo a failed delivery so a later subscriber gets the message.
    pub fn clear_pending(&self, recipient_id: &EntityId) {
        if let Some(state) = self.state(recipient_id) {
            state.lock().delivery_pending = false;
        }
    }

    /// Drop the delivered head of the buffer.
    pub fn ack(&self, recipient_id: &EntityId) -> Result<(), StoreError> {
        let state = self.state(recipient_id).ok_or(StoreError::NotFound)?;
        let mut state = state.lock();
        if !state.delivery_pending {
            return Err(StoreError::NoMsg);
        }
        state.messages.pop_front();
        state.delivery_pending = false;
        Ok(())
    }
}

fn migrate(db: &Connection) -> Result<(), StoreError> {
    let version: i64 = db.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version < SCHEMA_VERSION {
        debug!(from = version, to = SCHEMA_VERSION, "migrating queue store");
        db.execute_batch(CREATE_SCHEMA_SQL)?;
        db.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SignKeyPair;

    fn store(quota: usize) -> (QueueStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::open(&dir.path().join("queues.db"), quota, 64).unwrap();
        (store, dir)
    }

    #[test]
    fn create_assigns_distinct_ids() {
        let (store, _dir) = store(8);
        let mut recipients = std::collections::HashSet::new();
        let mut senders = std::collections::HashSet::new();
        for _ in 0..32 {
            let (rid, sid) = store.create(SignKeyPair::generate().public()).unwrap();
            assert!(recipients.insert(rid.clone()));
            assert!(senders.insert(sid.clone()));
            assert_ne!(rid, sid);
        }
    }

    #[test]
    fn secure_is_idempotent_only_for_the_same_key() {
        let (store, _dir) = store(8);
        let (rid, _sid) = store.create(SignKeyPair::generate().public()).unwrap();
        let sender = SignKeyPair::generate();

        store.secure(&rid, sender.public()).unwrap();
        store.secure(&rid, sender.public()).unwrap();
        assert!(matches!(
            store.secure(&rid, SignKeyPair::generate().public()),
            Err(StoreError::Auth)
        ));
    }

    #[test]
    fn quota_rejects_and_recovers_after_ack() {
        let (store, _dir) = store(2);
        let (rid, _sid) = store.create(SignKeyPair::generate().public()).unwrap();

        store.enqueue(&rid, b"one".to_vec()).unwrap();
        store.enqueue(&rid, b"two".to_vec()).unwrap();
        assert!(matches!(
            store.enqueue(&rid, b"three".to_vec()),
            Err(StoreError::Quota)
        ));

        let head = store.take_deliverable(&rid).unwrap();
        assert_eq!(head.body, b"one");
        store.ack(&rid).unwrap();
        store.enqueue(&rid, b"three".to_vec()).unwrap();
    }

    #[test]
    fn delivery_is_fifo_with_monotonic_ids() {
        let (store, _dir) = store(8);
        let (rid, _sid) = store.create(SignKeyPair::generate().public()).unwrap();
        for body in [b"a".to_vec(), b"b".to_vec(), b"c".to_vec()] {
            store.enqueue(&rid, body).unwrap();
        }
        let mut seen = Vec::new();
        while let Some(msg) = store.take_deliverable(&rid) {
            seen.push((msg.msg_id, msg.body.clone()));
            store.ack(&rid).unwrap();
        }
        assert_eq!(
            seen,
            vec![
                (1, b"a".to_vec()),
                (2, b"b".to_vec()),
                (3, b"c".to_vec()),
            ]
        );
    }

    #[test]
    fn pending_delivery_suppresses_duplicate_pushes() {
        let (store, _dir) = store(8);
        let (rid, _sid) = store.create(SignKeyPair::generate().public()).unwrap();
        store.enqueue(&rid, b"a".to_vec()).unwrap();

        assert!(store.take_deliverable(&rid).is_some());
        assert!(store.take_deliverable(&rid).is_none());
        store.clear_pending(&rid);
        assert!(store.take_deliverable(&rid).is_some());
    }

    #[test]
    fn ack_without_pending_delivery_is_no_msg() {
        let (store, _dir) = store(8);
        let (rid, _sid) = store.create(SignKeyPair::generate().public()).unwrap();
        assert!(matches!(store.ack(&rid), Err(StoreError::NoMsg)));
    }

    #[test]
    fn records_survive_reopen_but_buffers_do_not() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queues.db");
        let recipient = SignKeyPair::generate();
        let sender = SignKeyPair::generate();

        let (rid, sid) = {
            let store = QueueStore::open(&path, 8, 64).unwrap();
            let (rid, sid) = store.create(recipient.public()).unwrap();
            store.secure(&rid, sender.public()).unwrap();
            store.enqueue(&rid, b"volatile".to_vec()).unwrap();
            (rid, sid)
        };

        let store = QueueStore::open(&path, 8, 64).unwrap();
        let view = store.sender_view(&sid).unwrap();
        assert_eq!(view.recipient_id, rid);
        assert_eq!(view.sender_key, Some(sender.public()));
        assert_eq!(view.status, QueueStatus::Secured);
        assert!(store.take_deliverable(&rid).is_none());
    }

    #[test]
    fn delete_removes_both_indexes() {
        let (store, _dir) = store(8);
        let (rid, sid) = store.create(SignKeyPair::generate().public()).unwrap();
        store.delete(&rid).unwrap();
        assert!(store.recipient_key(&rid).is_none());
        assert!(store.sender_view(&sid).is_none());
        assert!(matches!(store.delete(&rid), Err(StoreError::NotFound)));
    }

    #[test]
    fn queue_limit_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::open(&dir.path().join("queues.db"), 8, 2).unwrap();
        store.create(SignKeyPair::generate().public()).unwrap();
        store.create(SignKeyPair::generate().public()).unwrap();
        assert!(matches!(
            store.create(SignKeyPair::generate().public()),
            Err(StoreError::QueueLimit)
        ));
    }
}
