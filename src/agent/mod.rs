//! # SMP Agent
//!
//! Builds duplex *connections* for local clients out of pairs of one-way
//! broker queues. The agent listens on loopback TCP for client sessions
//! speaking the agent protocol, drives the per-connection handshake state
//! machine (`New → Joined → Confirmed → Active`), and keeps everything it
//! would need after a restart in a SQLite store.
//!
//! Message integrity per direction: wire ids increase strictly by one and
//! every chained message carries the SHA-256 of its predecessor. Breaks in
//! either are surfaced to the client in the delivery status rather than
//! dropped, except exact duplicates, which are dropped silently.

use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::crypto::{self, EncKeyPair, SignKeyPair};
use crate::defaults;
use crate::protocol::address::{SmpQueueInfo, SmpServer};
use crate::protocol::agent::{
    encode_agent_event, read_agent_transmission, syntax_code, AckMode, AgentCommand, AgentEnvelope,
    AgentError, AgentEvent, AgentMessage, AgentPayload, MsgStatus, ReplyMode,
};
use crate::protocol::{BrokerResponse, ClientCommand, EntityId, ErrorCode};
use crate::transport::{self, BoxedWrite, TransportError};

pub mod client;
pub mod store;

use client::{ClientPool, InboundMsg};
use store::{AgentStore, ConnRecord, ConnStatus, RcvQueueRecord, SndQueueRecord};

/// Agent configuration, loaded from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Loopback port for local client sessions.
    pub tcp_port: u16,
    pub database: PathBuf,
    /// Known broker addresses, validated at startup.
    #[serde(default)]
    pub servers: Vec<String>,
    /// "reply" (default) or "no_reply".
    #[serde(default = "default_reply_mode")]
    pub default_reply_mode: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_reply_mode() -> String {
    "reply".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AgentConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| anyhow::anyhow!("cannot open config file {}: {e}", path.display()))?;
        let config: Self = serde_json::from_reader(file)
            .map_err(|e| anyhow::anyhow!("cannot parse config file {}: {e}", path.display()))?;
        Ok(config)
    }
}

struct ConnState {
    record: ConnRecord,
    /// Local id delivered to the client and not yet acknowledged.
    unacked: Option<u64>,
}

type SharedConn = Arc<tokio::sync::Mutex<ConnState>>;

/// Agent state shared between client sessions and the inbound dispatcher.
pub struct AgentCore {
    store: AgentStore,
    pool: Arc<ClientPool>,
    conns: parking_lot::Mutex<HashMap<String, SharedConn>>,
    rcpt_index: parking_lot::Mutex<HashMap<(SmpServer, EntityId), String>>,
    /// Per-alias event channel of the client session watching it.
    listeners: parking_lot::Mutex<HashMap<String, mpsc::Sender<Vec<u8>>>>,
    default_reply_mode: ReplyMode,
}

/// A bound agent, ready to serve local clients.
pub struct Agent {
    core: Arc<AgentCore>,
    listener: TcpListener,
}

impl Agent {
    pub async fn bind(config: &AgentConfig) -> anyhow::Result<Self> {
        for server in &config.servers {
            let parsed = SmpServer::parse(server)
                .map_err(|_| anyhow::anyhow!("invalid server address in config: {server}"))?;
            info!(server = %parsed, "known broker");
        }
        let default_reply_mode = match config.default_reply_mode.as_str() {
            "no_reply" => ReplyMode::No,
            _ => ReplyMode::On,
        };

        let store = AgentStore::open(&config.database)?;
        let (pool, mut inbound_rx) = ClientPool::new(256);

        let mut conns = HashMap::new();
        let mut rcpt_index = HashMap::new();
        for record in store.load_all()? {
            if let Some(rcv) = &record.rcv {
                rcpt_index.insert(
                    (rcv.server.clone(), rcv.recipient_id.clone()),
                    record.alias.clone(),
                );
            }
            conns.insert(
                record.alias.clone(),
                Arc::new(tokio::sync::Mutex::new(ConnState {
                    record,
                    unacked: None,
                })),
            );
        }
        info!(connections = conns.len(), "agent store loaded");

        let core = Arc::new(AgentCore {
            store,
            pool,
            conns: parking_lot::Mutex::new(conns),
            rcpt_index: parking_lot::Mutex::new(rcpt_index),
            listeners: parking_lot::Mutex::new(HashMap::new()),
            default_reply_mode,
        });

        let dispatcher = core.clone();
        tokio::spawn(async move {
            while let Some(inbound) = inbound_rx.recv().await {
                dispatcher.on_inbound(inbound).await;
            }
        });

        let resubscriber = core.clone();
        tokio::spawn(async move { resubscriber.resubscribe_known().await });

        let listener = TcpListener::bind(("127.0.0.1", config.tcp_port)).await?;
        info!(port = listener.local_addr()?.port(), "agent listening");
        Ok(Self { core, listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve local client sessions until the task is cancelled.
    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            debug!(%peer, "accepted local client");
            let core = self.core.clone();
            tokio::spawn(client_session(core, stream));
        }
    }
}

impl AgentCore {
    fn conn(&self, alias: &str) -> Option<SharedConn> {
        self.conns.lock().get(alias).cloned()
    }

    fn attach_listener(&self, alias: &str, tx: mpsc::Sender<Vec<u8>>) {
        self.listeners.lock().insert(alias.to_string(), tx);
    }

    /// Push an asynchronous event (empty correlation id) to whichever
    /// session watches `alias`; dead sessions are dropped here.
    fn emit(&self, alias: &str, event: &AgentEvent) {
        let mut listeners = self.listeners.lock();
        if let Some(tx) = listeners.get(alias) {
            let bytes = encode_agent_event(&[], alias, event);
            if tx.try_send(bytes).is_err() {
                listeners.remove(alias);
            }
        }
    }

    fn reserve_alias(&self, requested: Option<String>) -> Result<String, AgentError> {
        let conns = self.conns.lock();
        match requested {
            Some(alias) => {
                if conns.contains_key(&alias) {
                    Err(AgentError::Prohibited)
                } else {
                    Ok(alias)
                }
            }
            None => loop {
                let alias = EntityId::generate().encoded();
                if !conns.contains_key(&alias) {
                    return Ok(alias);
                }
            },
        }
    }

    fn register_conn(&self, record: ConnRecord) -> SharedConn {
        if let Some(rcv) = &record.rcv {
            self.rcpt_index.lock().insert(
                (rcv.server.clone(), rcv.recipient_id.clone()),
                record.alias.clone(),
            );
        }
        let shared = Arc::new(tokio::sync::Mutex::new(ConnState {
            record: record.clone(),
            unacked: None,
        }));
        self.conns.lock().insert(record.alias.clone(), shared.clone());
        shared
    }

    /// Create a receive queue on `server`: NEW, then SUB, registered for
    /// re-subscription on reconnect.
    async fn provision_rcv_queue(&self, server: SmpServer) -> Result<RcvQueueRecord, AgentError> {
        let sign_keys = SignKeyPair::generate();
        let enc_keys = EncKeyPair::generate();
        let client = self.pool.client(&server).await?;

        let response = client
            .command(
                Some(&sign_keys),
                &EntityId::empty(),
                ClientCommand::New(sign_keys.public()),
            )
            .await?;
        let (recipient_id, sender_id) = match response {
            BrokerResponse::Ids {
                recipient_id,
                sender_id,
            } => (recipient_id, sender_id),
            _ => return Err(AgentError::Broker("unexpected response".into())),
        };

        client.register_subscription(recipient_id.clone(), sign_keys.clone());
        match client
            .command(Some(&sign_keys), &recipient_id, ClientCommand::Sub)
            .await?
        {
            BrokerResponse::Ok => {}
            _ => return Err(AgentError::Broker("unexpected response".into())),
        }

        Ok(RcvQueueRecord {
            server,
            recipient_id,
            sender_id,
            sign_keys,
            enc_keys,
            peer_key: None,
            secured: false,
            last_wire_id: 0,
            prev_hash: Vec::new(),
        })
    }

    /// `NEW`: provision the receive queue and hand back the invitation.
    pub async fn new_connection(
        self: &Arc<Self>,
        requested_alias: Option<String>,
        server: SmpServer,
    ) -> Result<(String, SmpQueueInfo), AgentError> {
        let alias = self.reserve_alias(requested_alias)?;
        let rcv = self.provision_rcv_queue(server.clone()).await?;
        let info = SmpQueueInfo {
            server,
            sender_id: rcv.sender_id.clone(),
            enc_key: rcv.enc_keys.public(),
        };

        let record = ConnRecord {
            alias: alias.clone(),
            status: ConnStatus::New,
            rcv: Some(rcv),
            snd: None,
            last_delivered_id: 0,
        };
        self.store.create_conn(&record)?;
        self.register_conn(record);
        info!(alias = %alias, "connection created");
        Ok((alias, info))
    }

    /// `JOIN`: accept an invitation, send the confirmation and start the
    /// handshake in the background.
    pub async fn join_connection(
        self: &Arc<Self>,
        requested_alias: Option<String>,
        info: SmpQueueInfo,
        mode: ReplyMode,
    ) -> Result<String, AgentError> {
        let alias = self.reserve_alias(requested_alias)?;
        // a bare JOIN uses the configured default
        let mode = match mode {
            ReplyMode::On => self.default_reply_mode.clone(),
            other => other,
        };

        let snd_keys = SignKeyPair::generate();
        let snd = SndQueueRecord {
            server: info.server.clone(),
            sender_id: info.sender_id.clone(),
            sign_keys: snd_keys.clone(),
            enc_key: info.enc_key,
            hello_sent: false,
            last_wire_id: 0,
            prev_hash: Vec::new(),
        };

        let rcv = match mode {
            ReplyMode::No => None,
            ReplyMode::On => Some(self.provision_rcv_queue(info.server.clone()).await?),
            ReplyMode::Via(reply_server) => {
                Some(self.provision_rcv_queue(reply_server).await?)
            }
        };
        let send_reply = rcv.is_some();

        let record = ConnRecord {
            alias: alias.clone(),
            status: ConnStatus::Joined,
            rcv,
            snd: Some(snd),
            last_delivered_id: 0,
        };
        self.store.create_conn(&record)?;
        self.register_conn(record);

        // confirmation: unsigned SEND of our sender key, sealed to the
        // invitation's encryption key
        self.send_confirmation(&alias).await?;

        let core = self.clone();
        let task_alias = alias.clone();
        tokio::spawn(async move {
            core.run_handshake(&task_alias, send_reply).await;
        });

        info!(alias = %alias, "connection joined");
        Ok(alias)
    }

    /// Send the unsigned `SMPConfirmation` on the connection's send queue.
    async fn send_confirmation(&self, alias: &str) -> Result<(), AgentError> {
        let conn = self.conn(alias).ok_or(AgentError::Unknown)?;
        let state = conn.lock().await;
        let snd = state.record.snd.as_ref().ok_or(AgentError::Prohibited)?;

        let envelope = AgentEnvelope::Confirmation {
            sender_key: snd.sign_keys.public(),
        };
        let sealed = crypto::seal(&snd.enc_key, &envelope.serialize())
            .map_err(|_| AgentError::Internal)?;
        let server = snd.server.clone();
        let sender_id = snd.sender_id.clone();
        drop(state);

        let client = self.pool.client(&server).await?;
        match client
            .command(None, &sender_id, ClientCommand::Send(sealed))
            .await?
        {
            BrokerResponse::Ok => Ok(()),
            _ => Err(AgentError::Broker("unexpected response".into())),
        }
    }

    /// HELLO (with retries while the peer has not yet secured the queue),
    /// optionally followed by REPLY, then the activation check.
    async fn run_handshake(self: &Arc<Self>, alias: &str, send_reply: bool) {
        if let Err(e) = self.try_handshake(alias, send_reply).await {
            warn!(alias = %alias, "handshake failed: {e}");
            if let Some(conn) = self.conn(alias) {
                let mut state = conn.lock().await;
                state.record.status = ConnStatus::Disabled;
                let _ = self.store.set_status(alias, ConnStatus::Disabled);
            }
            self.emit(alias, &AgentEvent::Err(e));
        }
    }

    async fn try_handshake(self: &Arc<Self>, alias: &str, send_reply: bool) -> Result<(), AgentError> {
        let hello_key = {
            let conn = self.conn(alias).ok_or(AgentError::Unknown)?;
            let state = conn.lock().await;
            state
                .record
                .snd
                .as_ref()
                .ok_or(AgentError::Prohibited)?
                .sign_keys
                .public()
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let payload = AgentPayload::Hello {
                key: hello_key.clone(),
                ack_mode: AckMode::On,
            };
            match self.send_chained(alias, payload).await {
                Ok(()) => break,
                // AUTH (or a signature refused on a still-unsecured queue)
                // means the peer has not KEYed the queue yet
                Err(AgentError::Smp(ErrorCode::Auth | ErrorCode::CmdHasAuth))
                    if attempt < defaults::HELLO_RETRIES =>
                {
                    tokio::time::sleep(defaults::HELLO_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }

        {
            let conn = self.conn(alias).ok_or(AgentError::Unknown)?;
            let mut state = conn.lock().await;
            if let Some(snd) = state.record.snd.as_mut() {
                snd.hello_sent = true;
            }
            if state.record.status == ConnStatus::Joined {
                state.record.status = ConnStatus::Confirmed;
                self.store.set_status(alias, ConnStatus::Confirmed)?;
            }
        }
        self.store.set_hello_sent(alias)?;

        if send_reply {
            let reply_info = {
                let conn = self.conn(alias).ok_or(AgentError::Unknown)?;
                let state = conn.lock().await;
                let rcv = state.record.rcv.as_ref().ok_or(AgentError::Prohibited)?;
                SmpQueueInfo {
                    server: rcv.server.clone(),
                    sender_id: rcv.sender_id.clone(),
                    enc_key: rcv.enc_keys.public(),
                }
            };
            self.send_chained(alias, AgentPayload::Reply(reply_info)).await?;
        }

        self.maybe_activate(alias).await
    }

    /// Both directions ready → `Active`, announced with `CON` exactly once.
    async fn maybe_activate(&self, alias: &str) -> Result<(), AgentError> {
        let activated = {
            let conn = self.conn(alias).ok_or(AgentError::Unknown)?;
            let mut state = conn.lock().await;
            let hello_sent = state
                .record
                .snd
                .as_ref()
                .map(|s| s.hello_sent)
                .unwrap_or(false);
            let peer_ready = state
                .record
                .rcv
                .as_ref()
                .map(|r| r.peer_key.is_some())
                .unwrap_or(true);
            if hello_sent && peer_ready && state.record.status != ConnStatus::Active {
                state.record.status = ConnStatus::Active;
                self.store.set_status(alias, ConnStatus::Active)?;
                true
            } else {
                false
            }
        };
        if activated {
            info!(alias = %alias, "connection active");
            self.emit(alias, &AgentEvent::Con);
        }
        Ok(())
    }

    /// Send one chained message on the connection's send queue, advancing
    /// wire id and hash chain only after the broker accepted it.
    async fn send_chained(&self, alias: &str, payload: AgentPayload) -> Result<(), AgentError> {
        let conn = self.conn(alias).ok_or(AgentError::Unknown)?;
        let mut state = conn.lock().await;
        let snd = state.record.snd.as_mut().ok_or(AgentError::Prohibited)?;

        let wire_id = snd.last_wire_id + 1;
        let timestamp = chrono::Utc::now();
        let stored_body = match &payload {
            AgentPayload::Body(body) => body.clone(),
            _ => Vec::new(),
        };
        let envelope = AgentEnvelope::Message(AgentMessage {
            wire_id,
            timestamp,
            prev_hash: snd.prev_hash.clone(),
            payload,
        });
        let plaintext = envelope.serialize();
        let sealed = crypto::seal(&snd.enc_key, &plaintext).map_err(|_| AgentError::Internal)?;

        let server = snd.server.clone();
        let sender_id = snd.sender_id.clone();
        let sign_keys = snd.sign_keys.clone();

        let client = self.pool.client(&server).await?;
        match client
            .command(Some(&sign_keys), &sender_id, ClientCommand::Send(sealed))
            .await?
        {
            BrokerResponse::Ok => {
                let hash = crypto::sha256(&plaintext).to_vec();
                let snd = state.record.snd.as_mut().ok_or(AgentError::Internal)?;
                snd.last_wire_id = wire_id;
                snd.prev_hash = hash.clone();
                self.store
                    .append_snd_message(alias, wire_id, &hash, &timestamp, &stored_body)?;
                Ok(())
            }
            _ => Err(AgentError::Broker("unexpected response".into())),
        }
    }

    /// `SEND`: payload message on an active connection, with quota backoff
    /// and the fatal-AUTH rule.
    pub async fn send_message(&self, alias: &str, body: Vec<u8>) -> Result<(), AgentError> {
        if body.len() > defaults::AGENT_MAX_BODY {
            return Err(AgentError::Size);
        }
        {
            let conn = self.conn(alias).ok_or(AgentError::Unknown)?;
            let state = conn.lock().await;
            if state.record.status != ConnStatus::Active {
                return Err(AgentError::Prohibited);
            }
        }

        let mut attempt = 0;
        loop {
            match self
                .send_chained(alias, AgentPayload::Body(body.clone()))
                .await
            {
                Err(AgentError::Smp(ErrorCode::Quota)) if attempt < defaults::QUOTA_RETRIES => {
                    attempt += 1;
                    debug!(alias = %alias, attempt, "peer queue over quota, backing off");
                    tokio::time::sleep(defaults::QUOTA_RETRY_DELAY).await;
                }
                Err(AgentError::Smp(ErrorCode::Auth)) => {
                    // fatal for the connection
                    if let Some(conn) = self.conn(alias) {
                        let mut state = conn.lock().await;
                        state.record.status = ConnStatus::Disabled;
                        let _ = self.store.set_status(alias, ConnStatus::Disabled);
                    }
                    return Err(AgentError::Smp(ErrorCode::Auth));
                }
                other => return other,
            }
        }
    }

    /// `SUB`: (re-)subscribe the connection's receive queue.
    pub async fn subscribe(&self, alias: &str) -> Result<(), AgentError> {
        let (server, recipient_id, sign_keys) = {
            let conn = self.conn(alias).ok_or(AgentError::Unknown)?;
            let state = conn.lock().await;
            let rcv = state.record.rcv.as_ref().ok_or(AgentError::Prohibited)?;
            (
                rcv.server.clone(),
                rcv.recipient_id.clone(),
                rcv.sign_keys.clone(),
            )
        };
        let client = self.pool.client(&server).await?;
        client.register_subscription(recipient_id.clone(), sign_keys.clone());
        match client
            .command(Some(&sign_keys), &recipient_id, ClientCommand::Sub)
            .await?
        {
            BrokerResponse::Ok => Ok(()),
            _ => Err(AgentError::Broker("unexpected response".into())),
        }
    }

    /// `ACK`: local client acknowledged a delivery; only now the broker's
    /// copy is acknowledged and the next message can flow.
    pub async fn ack(&self, alias: &str, local_id: u64) -> Result<(), AgentError> {
        let conn = self.conn(alias).ok_or(AgentError::Unknown)?;
        let mut state = conn.lock().await;
        if state.unacked != Some(local_id) {
            return Err(AgentError::Prohibited);
        }
        state.unacked = None;
        let rcv = state.record.rcv.as_ref().ok_or(AgentError::Prohibited)?;
        let server = rcv.server.clone();
        let recipient_id = rcv.recipient_id.clone();
        let sign_keys = rcv.sign_keys.clone();
        drop(state);

        let client = self.pool.client(&server).await?;
        match client
            .command(Some(&sign_keys), &recipient_id, ClientCommand::Ack)
            .await
        {
            Ok(BrokerResponse::Ok) | Err(AgentError::Smp(ErrorCode::NoMsg)) => {}
            Ok(_) => return Err(AgentError::Broker("unexpected response".into())),
            Err(e) => return Err(e),
        }
        self.store.mark_acked(alias, local_id)?;
        Ok(())
    }

    /// Acknowledge a handshake envelope upstream without client involvement.
    async fn ack_upstream(&self, alias: &str) {
        let creds = {
            let Some(conn) = self.conn(alias) else { return };
            let state = conn.lock().await;
            state.record.rcv.as_ref().map(|rcv| {
                (
                    rcv.server.clone(),
                    rcv.recipient_id.clone(),
                    rcv.sign_keys.clone(),
                )
            })
        };
        let Some((server, recipient_id, sign_keys)) = creds else {
            return;
        };
        let result = match self.pool.client(&server).await {
            Ok(client) => {
                client
                    .command(Some(&sign_keys), &recipient_id, ClientCommand::Ack)
                    .await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(_) | Err(AgentError::Smp(ErrorCode::NoMsg)) => {}
            Err(e) => debug!(alias = %alias, "upstream ack failed: {e}"),
        }
    }

    /// Re-subscribe every stored connection after startup; brokers that
    /// are down now are retried when next used.
    async fn resubscribe_known(self: Arc<Self>) {
        let aliases: Vec<String> = self.conns.lock().keys().cloned().collect();
        for alias in aliases {
            let has_rcv = match self.conn(&alias) {
                Some(conn) => conn.lock().await.record.rcv.is_some(),
                None => false,
            };
            if !has_rcv {
                continue;
            }
            if let Err(e) = self.subscribe(&alias).await {
                debug!(alias = %alias, "startup subscription failed: {e}");
            }
        }
    }

    /// Route one broker push through the connection state machine.
    async fn on_inbound(self: &Arc<Self>, inbound: InboundMsg) {
        let alias = {
            let index = self.rcpt_index.lock();
            index
                .get(&(inbound.server.clone(), inbound.recipient_id.clone()))
                .cloned()
        };
        let Some(alias) = alias else {
            warn!(queue = %inbound.recipient_id, "message for unknown queue");
            return;
        };
        let Some(conn) = self.conn(&alias) else { return };

        let mut followups: Vec<Followup> = Vec::new();

        {
            let mut state = conn.lock().await;
            let Some(rcv) = state.record.rcv.as_mut() else {
                return;
            };

            let plaintext = match crypto::open(&rcv.enc_keys, &inbound.body) {
                Ok(plaintext) => plaintext,
                Err(_) => {
                    warn!(alias = %alias, "undecryptable message dropped");
                    followups.push(Followup::Ack);
                    drop(state);
                    self.run_followups(&alias, followups).await;
                    return;
                }
            };

            match AgentEnvelope::parse(&plaintext) {
                Err(_) => {
                    warn!(alias = %alias, "malformed envelope dropped");
                    followups.push(Followup::Ack);
                }
                Ok(AgentEnvelope::Confirmation { sender_key }) => {
                    if !rcv.secured {
                        followups.push(Followup::SecureWith(sender_key));
                    } else {
                        debug!(alias = %alias, "duplicate confirmation ignored");
                    }
                    followups.push(Followup::Ack);
                }
                Ok(AgentEnvelope::Message(msg)) => {
                    let expected = rcv.last_wire_id + 1;
                    if msg.wire_id <= rcv.last_wire_id {
                        debug!(alias = %alias, wire_id = msg.wire_id, "duplicate dropped");
                        followups.push(Followup::Ack);
                    } else {
                        let status = if msg.prev_hash != rcv.prev_hash {
                            MsgStatus::BadHash
                        } else if msg.wire_id > expected {
                            MsgStatus::Skipped {
                                from: expected,
                                to: msg.wire_id - 1,
                            }
                        } else {
                            MsgStatus::Ok
                        };
                        // the chain advances even past a bad link so one
                        // corrupt message cannot poison the rest
                        let new_hash = crypto::sha256(&plaintext).to_vec();
                        rcv.last_wire_id = msg.wire_id;
                        rcv.prev_hash = new_hash.clone();

                        match msg.payload {
                            AgentPayload::Hello { key, .. } => {
                                rcv.peer_key = Some(key.clone());
                                let _ = self.store.set_peer_key(&alias, &key);
                                let _ = self.store.advance_rcv_chain(
                                    &alias,
                                    msg.wire_id,
                                    &new_hash,
                                );
                                followups.push(Followup::Ack);
                                followups.push(Followup::Activate);
                            }
                            AgentPayload::Reply(info) => {
                                let _ = self.store.advance_rcv_chain(
                                    &alias,
                                    msg.wire_id,
                                    &new_hash,
                                );
                                followups.push(Followup::Ack);
                                followups.push(Followup::AttachSnd(info));
                            }
                            AgentPayload::Body(body) => {
                                let local_id = state.record.last_delivered_id + 1;
                                state.record.last_delivered_id = local_id;
                                state.unacked = Some(local_id);
                                if let Err(e) = self.store.append_rcv_message(
                                    &alias,
                                    local_id,
                                    msg.wire_id,
                                    &new_hash,
                                    &msg.timestamp,
                                    &body,
                                    &status.to_string(),
                                ) {
                                    warn!(alias = %alias, "message not persisted: {e}");
                                }
                                followups.push(Followup::Emit(AgentEvent::Msg {
                                    id: local_id,
                                    broker_ts: inbound.timestamp,
                                    agent_ts: msg.timestamp,
                                    status,
                                    body,
                                }));
                                // no upstream ack until the client ACKs
                            }
                        }
                    }
                }
            }
        }

        self.run_followups(&alias, followups).await;
    }

    /// Actions decided under the connection lock, executed after its
    /// release (they take the lock themselves or talk to brokers).
    async fn run_followups(self: &Arc<Self>, alias: &str, followups: Vec<Followup>) {
        for followup in followups {
            match followup {
                Followup::Ack => self.ack_upstream(alias).await,
                Followup::Activate => {
                    if let Err(e) = self.maybe_activate(alias).await {
                        warn!(alias = %alias, "activation failed: {e}");
                    }
                }
                Followup::SecureWith(sender_key) => {
                    if let Err(e) = self.secure_rcv_queue(alias, sender_key).await {
                        warn!(alias = %alias, "securing queue failed: {e}");
                    }
                }
                Followup::AttachSnd(info) => {
                    let core = self.clone();
                    let alias = alias.to_string();
                    tokio::spawn(async move {
                        if let Err(e) = core.attach_send_queue(&alias, info).await {
                            warn!(alias = %alias, "attaching send queue failed: {e}");
                            core.emit(&alias, &AgentEvent::Err(e));
                        }
                    });
                }
                Followup::Emit(event) => self.emit(alias, &event),
            }
        }
    }

    /// First confirmation received: KEY the receive queue with the peer's
    /// sender key and move the connection toward `Confirmed`.
    async fn secure_rcv_queue(
        &self,
        alias: &str,
        sender_key: crypto::VerifyKey,
    ) -> Result<(), AgentError> {
        let (server, recipient_id, sign_keys) = {
            let conn = self.conn(alias).ok_or(AgentError::Unknown)?;
            let state = conn.lock().await;
            let rcv = state.record.rcv.as_ref().ok_or(AgentError::Prohibited)?;
            (
                rcv.server.clone(),
                rcv.recipient_id.clone(),
                rcv.sign_keys.clone(),
            )
        };

        let client = self.pool.client(&server).await?;
        match client
            .command(
                Some(&sign_keys),
                &recipient_id,
                ClientCommand::Key(sender_key),
            )
            .await?
        {
            BrokerResponse::Ok => {}
            _ => return Err(AgentError::Broker("unexpected response".into())),
        }

        let conn = self.conn(alias).ok_or(AgentError::Unknown)?;
        let mut state = conn.lock().await;
        if let Some(rcv) = state.record.rcv.as_mut() {
            rcv.secured = true;
        }
        self.store.set_rcv_secured(alias)?;
        if state.record.status == ConnStatus::New {
            state.record.status = ConnStatus::Confirmed;
            self.store.set_status(alias, ConnStatus::Confirmed)?;
        }
        info!(alias = %alias, "receive queue secured");
        Ok(())
    }

    /// REPLY received: provision the reverse direction and run the same
    /// confirmation + HELLO handshake toward the peer's reply queue.
    async fn attach_send_queue(
        self: &Arc<Self>,
        alias: &str,
        info: SmpQueueInfo,
    ) -> Result<(), AgentError> {
        {
            let conn = self.conn(alias).ok_or(AgentError::Unknown)?;
            let mut state = conn.lock().await;
            if state.record.snd.is_some() {
                debug!(alias = %alias, "duplicate REPLY ignored");
                return Ok(());
            }
            let snd = SndQueueRecord {
                server: info.server.clone(),
                sender_id: info.sender_id.clone(),
                sign_keys: SignKeyPair::generate(),
                enc_key: info.enc_key,
                hello_sent: false,
                last_wire_id: 0,
                prev_hash: Vec::new(),
            };
            self.store.attach_snd(alias, &snd)?;
            state.record.snd = Some(snd);
        }

        self.send_confirmation(alias).await?;
        self.run_handshake(alias, false).await;
        Ok(())
    }
}

/// Deferred action decided while the connection lock was held.
enum Followup {
    Ack,
    Activate,
    SecureWith(crypto::VerifyKey),
    AttachSnd(SmpQueueInfo),
    Emit(AgentEvent),
}

async fn session_writer(mut write: BoxedWrite, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = write.put_bytes(&bytes).await {
            debug!("client session write failed: {e}");
            break;
        }
    }
    let _ = write.close().await;
}

/// One local client session: sequential command loop plus a writer task
/// shared with the event side.
async fn client_session(core: Arc<AgentCore>, stream: TcpStream) {
    let (mut read, write) = transport::plain(stream);
    let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(64);
    let writer = tokio::spawn(session_writer(write, out_rx));

    loop {
        let t = match read_agent_transmission(read.as_mut()).await {
            Ok(t) => t,
            Err(TransportError::ConnClosed) => break,
            Err(e) => {
                debug!("client session transport failure: {e}");
                break;
            }
        };

        let (alias, event) = match t.command {
            Err(e) => (t.alias, AgentEvent::Err(e)),
            Ok(command) => handle_client_command(&core, &out_tx, t.alias, command).await,
        };
        let bytes = crate::protocol::agent::encode_agent_event(&t.corr_id, &alias, &event);
        if out_tx.send(bytes).await.is_err() {
            break;
        }
    }

    drop(out_tx);
    let _ = writer.await;
    debug!("client session closed");
}

/// Dispatch one client command; returns the alias to echo and the reply
/// event.
async fn handle_client_command(
    core: &Arc<AgentCore>,
    out_tx: &mpsc::Sender<Vec<u8>>,
    alias: String,
    command: AgentCommand,
) -> (String, AgentEvent) {
    let requested = if alias.is_empty() {
        None
    } else {
        Some(alias.clone())
    };

    match command {
        AgentCommand::New(server) => match core.new_connection(requested, server).await {
            Ok((alias, info)) => {
                core.attach_listener(&alias, out_tx.clone());
                (alias, AgentEvent::Inv(info))
            }
            Err(e) => (alias, AgentEvent::Err(e)),
        },
        AgentCommand::Join(info, mode) => {
            match core.join_connection(requested, info, mode).await {
                Ok(alias) => {
                    core.attach_listener(&alias, out_tx.clone());
                    (alias, AgentEvent::Ok)
                }
                Err(e) => (alias, AgentEvent::Err(e)),
            }
        }
        // an empty alias is only meaningful for NEW and JOIN
        _ if alias.is_empty() => (
            alias,
            AgentEvent::Err(AgentError::Syntax(syntax_code::NO_CONN_ALIAS)),
        ),
        AgentCommand::Sub => match core.subscribe(&alias).await {
            Ok(()) => {
                core.attach_listener(&alias, out_tx.clone());
                (alias, AgentEvent::Ok)
            }
            Err(e) => (alias, AgentEvent::Err(e)),
        },
        AgentCommand::Send(body) => match core.send_message(&alias, body).await {
            Ok(()) => (alias, AgentEvent::Ok),
            Err(e) => (alias, AgentEvent::Err(e)),
        },
        AgentCommand::Ack(id) => match core.ack(&alias, id).await {
            Ok(()) => (alias, AgentEvent::Ok),
            Err(e) => (alias, AgentEvent::Err(e)),
        },
    }
}
