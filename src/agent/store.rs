//! # Agent Store
//!
//! SQLite persistence for connections, their queue credentials and the
//! per-direction delivery state. Multi-row writes (connection creation,
//! chain advancement with its message row) run inside transactions so a
//! crash never leaves a connection half-recorded.
//!
//! Key material is stored raw (seed/secret bytes); the database file is
//! the agent's trust root and lives wherever the operator points it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use tracing::debug;

use crate::crypto::{EncKey, EncKeyPair, SignKeyPair, VerifyKey};
use crate::protocol::address::SmpServer;
use crate::protocol::agent::AgentError;
use crate::protocol::EntityId;

const SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS connections (
    conn_alias        TEXT NOT NULL PRIMARY KEY,
    status            TEXT NOT NULL,
    last_delivered_id INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS rcv_queues (
    conn_alias   TEXT NOT NULL PRIMARY KEY REFERENCES connections(conn_alias) ON DELETE CASCADE,
    server       TEXT NOT NULL,
    rcpt_id      BLOB NOT NULL,
    sender_id    BLOB NOT NULL,
    sign_key     BLOB NOT NULL,
    enc_key      BLOB NOT NULL,
    peer_key     BLOB,
    secured      INTEGER NOT NULL DEFAULT 0,
    last_wire_id INTEGER NOT NULL DEFAULT 0,
    prev_hash    BLOB NOT NULL DEFAULT x''
);

CREATE TABLE IF NOT EXISTS snd_queues (
    conn_alias   TEXT NOT NULL PRIMARY KEY REFERENCES connections(conn_alias) ON DELETE CASCADE,
    server       TEXT NOT NULL,
    sender_id    BLOB NOT NULL,
    sign_key     BLOB NOT NULL,
    enc_key      BLOB NOT NULL,
    hello_sent   INTEGER NOT NULL DEFAULT 0,
    last_wire_id INTEGER NOT NULL DEFAULT 0,
    prev_hash    BLOB NOT NULL DEFAULT x''
);

CREATE TABLE IF NOT EXISTS messages (
    conn_alias  TEXT NOT NULL,
    direction   TEXT NOT NULL,
    msg_id      INTEGER NOT NULL,
    wire_msg_id INTEGER NOT NULL,
    ts          TEXT NOT NULL,
    body        BLOB NOT NULL,
    status      TEXT NOT NULL,
    acked       INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (conn_alias, direction, msg_id)
);
";

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    New,
    Joined,
    Confirmed,
    Active,
    Disabled,
}

impl ConnStatus {
    fn as_str(self) -> &'static str {
        match self {
            ConnStatus::New => "new",
            ConnStatus::Joined => "joined",
            ConnStatus::Confirmed => "confirmed",
            ConnStatus::Active => "active",
            ConnStatus::Disabled => "disabled",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "new" => ConnStatus::New,
            "joined" => ConnStatus::Joined,
            "confirmed" => ConnStatus::Confirmed,
            "active" => ConnStatus::Active,
            "disabled" => ConnStatus::Disabled,
            _ => return None,
        })
    }
}

/// Receiving direction of a connection.
#[derive(Clone)]
pub struct RcvQueueRecord {
    pub server: SmpServer,
    pub recipient_id: EntityId,
    /// Sender id handed out in the invitation.
    pub sender_id: EntityId,
    pub sign_keys: SignKeyPair,
    pub enc_keys: EncKeyPair,
    pub peer_key: Option<VerifyKey>,
    /// The queue has been KEYed with the peer's sender key.
    pub secured: bool,
    pub last_wire_id: u64,
    pub prev_hash: Vec<u8>,
}

/// Sending direction of a connection.
#[derive(Clone)]
pub struct SndQueueRecord {
    pub server: SmpServer,
    pub sender_id: EntityId,
    pub sign_keys: SignKeyPair,
    pub enc_key: EncKey,
    pub hello_sent: bool,
    pub last_wire_id: u64,
    pub prev_hash: Vec<u8>,
}

/// One duplex connection.
#[derive(Clone)]
pub struct ConnRecord {
    pub alias: String,
    pub status: ConnStatus,
    pub rcv: Option<RcvQueueRecord>,
    pub snd: Option<SndQueueRecord>,
    /// Local id of the last payload message handed to the client.
    pub last_delivered_id: u64,
}

/// Direction tag for message rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rcv,
    Snd,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Rcv => "rcv",
            Direction::Snd => "snd",
        }
    }
}

pub struct AgentStore {
    db: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> AgentError {
    AgentError::Store(e.to_string())
}

impl AgentStore {
    pub fn open(path: &Path) -> Result<Self, AgentError> {
        let db = Connection::open(path).map_err(db_err)?;
        db.execute_batch("PRAGMA foreign_keys = ON;").map_err(db_err)?;
        let version: i64 = db
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(db_err)?;
        if version < SCHEMA_VERSION {
            debug!(from = version, to = SCHEMA_VERSION, "migrating agent store");
            db.execute_batch(CREATE_SCHEMA_SQL).map_err(db_err)?;
            db.pragma_update(None, "user_version", SCHEMA_VERSION)
                .map_err(db_err)?;
        }
        Ok(Self { db: Mutex::new(db) })
    }

    /// Insert a connection together with whichever queues it already has.
    pub fn create_conn(&self, record: &ConnRecord) -> Result<(), AgentError> {
        let mut db = self.db.lock();
        let tx = db
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        tx.execute(
            "INSERT INTO connections (conn_alias, status, last_delivered_id) VALUES (?1, ?2, ?3)",
            params![
                record.alias,
                record.status.as_str(),
                record.last_delivered_id as i64
            ],
        )
        .map_err(db_err)?;
        if let Some(rcv) = &record.rcv {
            insert_rcv(&tx, &record.alias, rcv)?;
        }
        if let Some(snd) = &record.snd {
            insert_snd(&tx, &record.alias, snd)?;
        }
        tx.commit().map_err(db_err)
    }

    /// Attach the send queue learned from a REPLY message.
    pub fn attach_snd(&self, alias: &str, snd: &SndQueueRecord) -> Result<(), AgentError> {
        let mut db = self.db.lock();
        let tx = db
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        insert_snd(&tx, alias, snd)?;
        tx.commit().map_err(db_err)
    }

    pub fn set_status(&self, alias: &str, status: ConnStatus) -> Result<(), AgentError> {
        self.db
            .lock()
            .execute(
                "UPDATE connections SET status = ?1 WHERE conn_alias = ?2",
                params![status.as_str(), alias],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn set_rcv_secured(&self, alias: &str) -> Result<(), AgentError> {
        self.db
            .lock()
            .execute(
                "UPDATE rcv_queues SET secured = 1 WHERE conn_alias = ?1",
                params![alias],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn set_peer_key(&self, alias: &str, key: &VerifyKey) -> Result<(), AgentError> {
        self.db
            .lock()
            .execute(
                "UPDATE rcv_queues SET peer_key = ?1 WHERE conn_alias = ?2",
                params![key.to_bytes().as_slice(), alias],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn set_hello_sent(&self, alias: &str) -> Result<(), AgentError> {
        self.db
            .lock()
            .execute(
                "UPDATE snd_queues SET hello_sent = 1 WHERE conn_alias = ?1",
                params![alias],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Record a received message and advance the receive chain in one
    /// transaction.
    #[allow(clippy::too_many_arguments)]
    pub fn append_rcv_message(
        &self,
        alias: &str,
        local_id: u64,
        wire_id: u64,
        prev_hash: &[u8],
        ts: &DateTime<Utc>,
        body: &[u8],
        status: &str,
    ) -> Result<(), AgentError> {
        let mut db = self.db.lock();
        let tx = db
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        tx.execute(
            "UPDATE rcv_queues SET last_wire_id = ?1, prev_hash = ?2 WHERE conn_alias = ?3",
            params![wire_id as i64, prev_hash, alias],
        )
        .map_err(db_err)?;
        tx.execute(
            "UPDATE connections SET last_delivered_id = ?1 WHERE conn_alias = ?2",
            params![local_id as i64, alias],
        )
        .map_err(db_err)?;
        tx.execute(
            "INSERT INTO messages (conn_alias, direction, msg_id, wire_msg_id, ts, body, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                alias,
                Direction::Rcv.as_str(),
                local_id as i64,
                wire_id as i64,
                ts.to_rfc3339(),
                body,
                status,
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)
    }

    /// Advance the receive chain without a delivered message (handshake
    /// envelopes).
    pub fn advance_rcv_chain(
        &self,
        alias: &str,
        wire_id: u64,
        prev_hash: &[u8],
    ) -> Result<(), AgentError> {
        self.db
            .lock()
            .execute(
                "UPDATE rcv_queues SET last_wire_id = ?1, prev_hash = ?2 WHERE conn_alias = ?3",
                params![wire_id as i64, prev_hash, alias],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Record a sent message and advance the send chain in one
    /// transaction. `body` is empty for handshake envelopes.
    pub fn append_snd_message(
        &self,
        alias: &str,
        wire_id: u64,
        prev_hash: &[u8],
        ts: &DateTime<Utc>,
        body: &[u8],
    ) -> Result<(), AgentError> {
        let mut db = self.db.lock();
        let tx = db
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        tx.execute(
            "UPDATE snd_queues SET last_wire_id = ?1, prev_hash = ?2 WHERE conn_alias = ?3",
            params![wire_id as i64, prev_hash, alias],
        )
        .map_err(db_err)?;
        tx.execute(
            "INSERT INTO messages (conn_alias, direction, msg_id, wire_msg_id, ts, body, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'OK')",
            params![
                alias,
                Direction::Snd.as_str(),
                wire_id as i64,
                wire_id as i64,
                ts.to_rfc3339(),
                body,
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)
    }

    pub fn mark_acked(&self, alias: &str, local_id: u64) -> Result<(), AgentError> {
        self.db
            .lock()
            .execute(
                "UPDATE messages SET acked = 1
                 WHERE conn_alias = ?1 AND direction = ?2 AND msg_id = ?3",
                params![alias, Direction::Rcv.as_str(), local_id as i64],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Load every connection with its queues.
    pub fn load_all(&self) -> Result<Vec<ConnRecord>, AgentError> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare("SELECT conn_alias, status, last_delivered_id FROM connections")
            .map_err(db_err)?;
        let conns: Vec<(String, String, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .map_err(db_err)?
            .collect::<Result<_, _>>()
            .map_err(db_err)?;

        let mut records = Vec::with_capacity(conns.len());
        for (alias, status, last_delivered) in conns {
            let status = ConnStatus::from_str(&status)
                .ok_or_else(|| AgentError::Store(format!("bad status for {alias}")))?;
            let rcv = load_rcv(&db, &alias)?;
            let snd = load_snd(&db, &alias)?;
            records.push(ConnRecord {
                alias,
                status,
                rcv,
                snd,
                last_delivered_id: last_delivered as u64,
            });
        }
        Ok(records)
    }
}

fn insert_rcv(tx: &rusqlite::Transaction<'_>, alias: &str, rcv: &RcvQueueRecord) -> Result<(), AgentError> {
    tx.execute(
        "INSERT INTO rcv_queues
         (conn_alias, server, rcpt_id, sender_id, sign_key, enc_key, peer_key, secured, last_wire_id, prev_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            alias,
            rcv.server.to_string(),
            rcv.recipient_id.as_bytes(),
            rcv.sender_id.as_bytes(),
            rcv.sign_keys.to_bytes().as_slice(),
            rcv.enc_keys.to_bytes().as_slice(),
            rcv.peer_key.as_ref().map(|k| k.to_bytes().to_vec()),
            rcv.secured as i64,
            rcv.last_wire_id as i64,
            rcv.prev_hash,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn insert_snd(tx: &rusqlite::Transaction<'_>, alias: &str, snd: &SndQueueRecord) -> Result<(), AgentError> {
    tx.execute(
        "INSERT INTO snd_queues
         (conn_alias, server, sender_id, sign_key, enc_key, hello_sent, last_wire_id, prev_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            alias,
            snd.server.to_string(),
            snd.sender_id.as_bytes(),
            snd.sign_keys.to_bytes().as_slice(),
            snd.enc_key.to_bytes().as_slice(),
            snd.hello_sent as i64,
            snd.last_wire_id as i64,
            snd.prev_hash,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn load_rcv(db: &Connection, alias: &str) -> Result<Option<RcvQueueRecord>, AgentError> {
    let row = db
        .query_row(
            "SELECT server, rcpt_id, sender_id, sign_key, enc_key, peer_key, secured, last_wire_id, prev_hash
             FROM rcv_queues WHERE conn_alias = ?1",
            params![alias],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                    row.get::<_, Option<Vec<u8>>>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, Vec<u8>>(8)?,
                ))
            },
        )
        .optional()
        .map_err(db_err)?;

    let Some((server, rcpt_id, sender_id, sign_key, enc_key, peer_key, secured, last_wire, hash)) =
        row
    else {
        return Ok(None);
    };
    let bad = |what: &str| AgentError::Store(format!("corrupt {what} for {alias}"));
    Ok(Some(RcvQueueRecord {
        server: SmpServer::parse(&server).map_err(|_| bad("server"))?,
        recipient_id: EntityId::from_bytes(rcpt_id),
        sender_id: EntityId::from_bytes(sender_id),
        sign_keys: SignKeyPair::from_bytes(&sign_key).map_err(|_| bad("sign key"))?,
        enc_keys: EncKeyPair::from_bytes(&enc_key).map_err(|_| bad("enc key"))?,
        peer_key: match peer_key {
            Some(bytes) => Some(VerifyKey::from_bytes(&bytes).map_err(|_| bad("peer key"))?),
            None => None,
        },
        secured: secured != 0,
        last_wire_id: last_wire as u64,
        prev_hash: hash,
    }))
}

fn load_snd(db: &Connection, alias: &str) -> Result<Option<SndQueueRecord>, AgentError> {
    let row = db
        .query_row(
            "SELECT server, sender_id, sign_key, enc_key, hello_sent, last_wire_id, prev_hash
             FROM snd_queues WHERE conn_alias = ?1",
            params![alias],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, Vec<u8>>(6)?,
                ))
            },
        )
        .optional()
        .map_err(db_err)?;

    let Some((server, sender_id, sign_key, enc_key, hello_sent, last_wire, hash)) = row else {
        return Ok(None);
    };
    let bad = |what: &str| AgentError::Store(format!("corrupt {what} for {alias}"));
    Ok(Some(SndQueueRecord {
        server: SmpServer::parse(&server).map_err(|_| bad("server"))?,
        sender_id: EntityId::from_bytes(sender_id),
        sign_keys: SignKeyPair::from_bytes(&sign_key).map_err(|_| bad("sign key"))?,
        enc_key: EncKey::from_bytes(&enc_key).map_err(|_| bad("enc key"))?,
        hello_sent: hello_sent != 0,
        last_wire_id: last_wire as u64,
        prev_hash: hash,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_conn(alias: &str) -> ConnRecord {
        ConnRecord {
            alias: alias.to_string(),
            status: ConnStatus::New,
            rcv: Some(RcvQueueRecord {
                server: SmpServer::new("broker.example", Some(5223), Some(vec![1u8; 32])),
                recipient_id: EntityId::generate(),
                sender_id: EntityId::generate(),
                sign_keys: SignKeyPair::generate(),
                enc_keys: EncKeyPair::generate(),
                peer_key: None,
                secured: false,
                last_wire_id: 0,
                prev_hash: Vec::new(),
            }),
            snd: None,
            last_delivered_id: 0,
        }
    }

    fn open_store() -> (AgentStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentStore::open(&dir.path().join("agent.db")).unwrap();
        (store, dir)
    }

    #[test]
    fn connection_round_trips_through_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.db");
        let conn = sample_conn("c1");
        {
            let store = AgentStore::open(&path).unwrap();
            store.create_conn(&conn).unwrap();
            store.set_status("c1", ConnStatus::Confirmed).unwrap();
            store.set_rcv_secured("c1").unwrap();
        }
        let store = AgentStore::open(&path).unwrap();
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        let got = &loaded[0];
        assert_eq!(got.alias, "c1");
        assert_eq!(got.status, ConnStatus::Confirmed);
        let rcv = got.rcv.as_ref().unwrap();
        let expect = conn.rcv.as_ref().unwrap();
        assert_eq!(rcv.recipient_id, expect.recipient_id);
        assert_eq!(rcv.server, expect.server);
        assert!(rcv.secured);
        assert_eq!(
            rcv.sign_keys.public(),
            expect.sign_keys.public()
        );
    }

    #[test]
    fn duplicate_alias_is_rejected() {
        let (store, _dir) = open_store();
        store.create_conn(&sample_conn("c1")).unwrap();
        assert!(store.create_conn(&sample_conn("c1")).is_err());
    }

    #[test]
    fn chains_advance_atomically_with_message_rows() {
        let (store, _dir) = open_store();
        store.create_conn(&sample_conn("c1")).unwrap();

        let now = Utc::now();
        let hash = vec![9u8; 32];
        store
            .append_rcv_message("c1", 1, 3, &hash, &now, b"payload", "OK")
            .unwrap();

        let loaded = store.load_all().unwrap();
        let rcv = loaded[0].rcv.as_ref().unwrap();
        assert_eq!(rcv.last_wire_id, 3);
        assert_eq!(rcv.prev_hash, hash);
        assert_eq!(loaded[0].last_delivered_id, 1);

        store.mark_acked("c1", 1).unwrap();
    }

    #[test]
    fn snd_queue_attaches_and_survives() {
        let (store, _dir) = open_store();
        store.create_conn(&sample_conn("c1")).unwrap();
        let snd = SndQueueRecord {
            server: SmpServer::new("other.example", None, None),
            sender_id: EntityId::generate(),
            sign_keys: SignKeyPair::generate(),
            enc_key: EncKeyPair::generate().public(),
            hello_sent: false,
            last_wire_id: 0,
            prev_hash: Vec::new(),
        };
        store.attach_snd("c1", &snd).unwrap();
        store.set_hello_sent("c1").unwrap();
        store
            .append_snd_message("c1", 1, &[], &Utc::now(), &[])
            .unwrap();

        let loaded = store.load_all().unwrap();
        let got = loaded[0].snd.as_ref().unwrap();
        assert_eq!(got.sender_id, snd.sender_id);
        assert!(got.hello_sent);
        assert_eq!(got.last_wire_id, 1);
    }
}
