//! # SMP Broker
//!
//! Accepts client sessions over TLS (and optionally WebSocket), parses
//! signed transmissions and dispatches them against the queue store. Each
//! session is three tasks: the command loop (sequential, owns the read
//! half), a writer task draining pre-encoded transmissions, and a delivery
//! pump turning subscription pushes into `MSG`/`END` transmissions.
//!
//! Authorization model: every command names a queue id (or none, for NEW
//! and PING) and carries a signature over the transmission bytes. The
//! signature is checked against the key the queue stores for the claimed
//! role; unknown queues and bad signatures are both answered with
//! `ERR AUTH` so probing cannot distinguish them.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::defaults;
use crate::encoding;
use crate::protocol::{
    encode_broker_transmission, read_client_transmission, BrokerResponse, ClientCommand,
    ClientTransmission, EntityId, ErrorCode,
};
use crate::transport::{self, tls, BoxedRead, BoxedWrite, TransportError};
use crate::SmpServer;

pub mod store;
pub mod subscriptions;

use store::{QueueStatus, QueueStore, StoreError};
use subscriptions::{Delivery, SessionId, Subscriber, SubscriptionManager};

/// Broker configuration, loaded from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub tcp_port: u16,
    /// Optional second listener speaking WebSocket instead of TLS.
    #[serde(default)]
    pub ws_port: Option<u16>,
    pub tls_certificate_file: PathBuf,
    pub tls_private_key_file: PathBuf,
    pub sqlite_database: PathBuf,
    #[serde(default = "default_quota")]
    pub message_quota_per_queue: usize,
    #[serde(default = "default_max_queues")]
    pub max_active_queues: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_quota() -> usize {
    defaults::MSG_QUEUE_QUOTA
}

fn default_max_queues() -> usize {
    defaults::MAX_ACTIVE_QUEUES
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ServerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| anyhow::anyhow!("cannot open config file {}: {e}", path.display()))?;
        let config: Self = serde_json::from_reader(file)
            .map_err(|e| anyhow::anyhow!("cannot parse config file {}: {e}", path.display()))?;
        Ok(config)
    }
}

/// A bound broker, ready to serve.
pub struct Server {
    store: Arc<QueueStore>,
    subscriptions: Arc<SubscriptionManager>,
    tcp_listener: TcpListener,
    ws_listener: Option<TcpListener>,
    acceptor: TlsAcceptor,
    key_hash: [u8; 32],
}

impl Server {
    /// Open the store, load the TLS identity and bind the listeners.
    pub async fn bind(config: &ServerConfig) -> anyhow::Result<Self> {
        let (acceptor, key_hash) =
            tls::tls_acceptor(&config.tls_certificate_file, &config.tls_private_key_file)?;
        let store = Arc::new(QueueStore::open(
            &config.sqlite_database,
            config.message_quota_per_queue,
            config.max_active_queues,
        )?);
        let tcp_listener = TcpListener::bind(("0.0.0.0", config.tcp_port)).await?;
        let ws_listener = match config.ws_port {
            Some(port) => Some(TcpListener::bind(("0.0.0.0", port)).await?),
            None => None,
        };
        info!(
            port = tcp_listener.local_addr()?.port(),
            key_hash = %encoding::b64url_encode(&key_hash),
            "broker listening"
        );
        Ok(Self {
            store,
            subscriptions: Arc::new(SubscriptionManager::new()),
            tcp_listener,
            ws_listener,
            acceptor,
            key_hash,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp_listener.local_addr()
    }

    /// Bound WebSocket listener address, when one is configured.
    pub fn ws_local_addr(&self) -> Option<SocketAddr> {
        self.ws_listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    /// SPKI fingerprint of the served certificate (what clients pin).
    pub fn key_hash(&self) -> [u8; 32] {
        self.key_hash
    }

    /// Loopback address of this broker, for in-process clients.
    pub fn smp_address(&self) -> SmpServer {
        let port = self
            .tcp_listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(defaults::SMP_PORT);
        SmpServer::new("127.0.0.1", Some(port), Some(self.key_hash.to_vec()))
    }

    /// Serve sessions until the task is cancelled.
    pub async fn run(self) -> anyhow::Result<()> {
        let next_session = Arc::new(AtomicU64::new(1));

        if let Some(ws_listener) = self.ws_listener {
            let store = self.store.clone();
            let subscriptions = self.subscriptions.clone();
            let next = next_session.clone();
            tokio::spawn(async move {
                loop {
                    match ws_listener.accept().await {
                        Ok((stream, peer)) => {
                            let id = next.fetch_add(1, Ordering::Relaxed);
                            debug!(session = id, %peer, "accepted WebSocket connection");
                            let store = store.clone();
                            let subscriptions = subscriptions.clone();
                            tokio::spawn(async move {
                                match transport::ws::accept(stream).await {
                                    Ok((read, write)) => {
                                        run_session(id, store, subscriptions, read, write).await
                                    }
                                    Err(e) => warn!(session = id, "WebSocket accept failed: {e}"),
                                }
                            });
                        }
                        Err(e) => {
                            warn!("WebSocket listener failure: {e}");
                            break;
                        }
                    }
                }
            });
        }

        loop {
            let (stream, peer) = self.tcp_listener.accept().await?;
            let id = next_session.fetch_add(1, Ordering::Relaxed);
            debug!(session = id, %peer, "accepted TCP connection");
            let store = self.store.clone();
            let subscriptions = self.subscriptions.clone();
            let acceptor = self.acceptor.clone();
            tokio::spawn(async move {
                match tls::accept(&acceptor, stream).await {
                    Ok((read, write)) => run_session(id, store, subscriptions, read, write).await,
                    Err(e) => warn!(session = id, "TLS accept failed: {e}"),
                }
            });
        }
    }
}

struct SessionCtx {
    id: SessionId,
    store: Arc<QueueStore>,
    subscriptions: Arc<SubscriptionManager>,
    out_tx: mpsc::Sender<Vec<u8>>,
    delivery_tx: mpsc::Sender<Delivery>,
}

async fn run_session(
    id: SessionId,
    store: Arc<QueueStore>,
    subscriptions: Arc<SubscriptionManager>,
    mut read: BoxedRead,
    write: BoxedWrite,
) {
    let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(64);
    let writer = tokio::spawn(writer_loop(write, out_rx));

    let (delivery_tx, delivery_rx) = mpsc::channel::<Delivery>(defaults::MSG_QUEUE_QUOTA);
    let pump = tokio::spawn(delivery_pump(delivery_rx, out_tx.clone()));

    let ctx = SessionCtx {
        id,
        store,
        subscriptions,
        out_tx,
        delivery_tx,
    };

    loop {
        let transmission =
            match timeout(defaults::READ_IDLE_TIMEOUT, read_client_transmission(read.as_mut()))
                .await
            {
                Err(_) => {
                    debug!(session = id, "idle timeout, closing session");
                    break;
                }
                Ok(Err(TransportError::ConnClosed)) => break,
                Ok(Err(e)) => {
                    debug!(session = id, "transport failure: {e}");
                    break;
                }
                Ok(Ok(t)) => t,
            };
        if process_transmission(&ctx, transmission).await {
            break;
        }
    }

    ctx.subscriptions.unsubscribe_session(id);
    pump.abort();
    drop(ctx);
    let _ = writer.await;
    debug!(session = id, "session closed");
}

async fn writer_loop(mut write: BoxedWrite, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = write.put_bytes(&bytes).await {
            debug!("session write failed: {e}");
            break;
        }
    }
    let _ = write.close().await;
}

/// Turn subscription pushes into wire transmissions.
async fn delivery_pump(mut rx: mpsc::Receiver<Delivery>, out_tx: mpsc::Sender<Vec<u8>>) {
    while let Some(delivery) = rx.recv().await {
        let bytes = match delivery {
            Delivery::Msg { queue, msg } => encode_broker_transmission(
                &[],
                &queue,
                &BrokerResponse::Msg {
                    msg_id: msg.msg_id,
                    timestamp: msg.timestamp,
                    body: msg.body,
                },
            ),
            Delivery::End { queue } => encode_broker_transmission(&[], &queue, &BrokerResponse::End),
        };
        if out_tx.send(bytes).await.is_err() {
            break;
        }
    }
}

async fn respond(ctx: &SessionCtx, corr_id: &[u8], queue_id: &EntityId, response: BrokerResponse) {
    let bytes = encode_broker_transmission(corr_id, queue_id, &response);
    let _ = ctx.out_tx.send(bytes).await;
}

fn store_error_code(e: &StoreError) -> ErrorCode {
    match e {
        StoreError::Duplicate => ErrorCode::Internal,
        StoreError::NotFound => ErrorCode::Auth,
        StoreError::Auth => ErrorCode::Auth,
        StoreError::Quota | StoreError::QueueLimit => ErrorCode::Quota,
        StoreError::NoMsg => ErrorCode::NoMsg,
        StoreError::Db(_) => ErrorCode::Internal,
    }
}

/// Push the queue head to its subscriber, if any and nothing is pending.
fn push_head(ctx: &SessionCtx, queue: &EntityId) {
    if let Some(msg) = ctx.store.take_deliverable(queue) {
        if !ctx.subscriptions.deliver(queue, msg) {
            ctx.store.clear_pending(queue);
        }
    }
}

/// Signature material of one transmission.
struct Auth {
    signature: Vec<u8>,
    signed: Vec<u8>,
}

/// Process one transmission; returns `true` when the session must close
/// (framing violation).
async fn process_transmission(ctx: &SessionCtx, t: ClientTransmission) -> bool {
    let ClientTransmission {
        signature,
        signed,
        corr_id,
        queue_id,
        command,
    } = t;
    let auth = Auth { signature, signed };

    let command = match command {
        Ok(command) => command,
        Err(code) => {
            respond(ctx, &corr_id, &queue_id, BrokerResponse::Err(code)).await;
            return code == ErrorCode::Block;
        }
    };

    match command {
        ClientCommand::Ping => {
            respond(ctx, &corr_id, &queue_id, BrokerResponse::Pong).await;
        }
        ClientCommand::New(recipient_key) => {
            let response = if !queue_id.is_empty() {
                BrokerResponse::Err(ErrorCode::CmdProhibited)
            } else if auth.signature.is_empty() {
                BrokerResponse::Err(ErrorCode::CmdNoAuth)
            } else if recipient_key.verify(&auth.signed, &auth.signature).is_err() {
                BrokerResponse::Err(ErrorCode::Auth)
            } else {
                match ctx.store.create(recipient_key) {
                    Ok((recipient_id, sender_id)) => {
                        debug!(session = ctx.id, queue = %recipient_id, "queue created");
                        BrokerResponse::Ids {
                            recipient_id,
                            sender_id,
                        }
                    }
                    Err(e) => BrokerResponse::Err(store_error_code(&e)),
                }
            };
            respond(ctx, &corr_id, &queue_id, response).await;
        }
        ClientCommand::Send(body) => {
            handle_send(ctx, &auth, &corr_id, &queue_id, body).await;
        }
        recipient_command => {
            handle_recipient_command(ctx, &auth, &corr_id, &queue_id, recipient_command).await;
        }
    }
    false
}

/// SEND is authenticated against the sending side of the queue: unsigned
/// only while the queue is new (the handshake confirmation), signed by the
/// sender key once secured.
async fn handle_send(
    ctx: &SessionCtx,
    auth: &Auth,
    corr_id: &[u8],
    sender_id: &EntityId,
    body: Vec<u8>,
) {
    if sender_id.is_empty() {
        respond(ctx, corr_id, sender_id, BrokerResponse::Err(ErrorCode::CmdNoQueue)).await;
        return;
    }

    let view = match ctx.store.sender_view(sender_id) {
        Some(view) => view,
        None => {
            respond(ctx, corr_id, sender_id, BrokerResponse::Err(ErrorCode::Auth)).await;
            return;
        }
    };

    let authorized: Result<bool, ErrorCode> = match (&view.sender_key, view.status) {
        (_, QueueStatus::Disabled) => Err(ErrorCode::Auth),
        (None, _) if auth.signature.is_empty() => Ok(false),
        // a signature where none is expected yet is refused outright
        (None, _) => Err(ErrorCode::CmdHasAuth),
        (Some(_), _) if auth.signature.is_empty() => Err(ErrorCode::CmdNoAuth),
        (Some(key), _) => match key.verify(&auth.signed, &auth.signature) {
            Ok(()) => Ok(true),
            Err(_) => Err(ErrorCode::Auth),
        },
    };

    let response = match authorized {
        Err(code) => BrokerResponse::Err(code),
        Ok(signed) => match ctx.store.enqueue(&view.recipient_id, body) {
            Ok(msg) => {
                debug!(
                    session = ctx.id,
                    queue = %view.recipient_id,
                    msg_id = msg.msg_id,
                    "message enqueued"
                );
                if signed {
                    if let Err(e) = ctx.store.mark_active(&view.recipient_id) {
                        warn!(queue = %view.recipient_id, "activation failed: {e}");
                    }
                }
                push_head(ctx, &view.recipient_id);
                BrokerResponse::Ok
            }
            Err(e) => BrokerResponse::Err(store_error_code(&e)),
        },
    };
    respond(ctx, corr_id, sender_id, response).await;
}

/// SUB, KEY, ACK, OFF and DEL all require a queue id and a valid
/// recipient signature.
async fn handle_recipient_command(
    ctx: &SessionCtx,
    auth: &Auth,
    corr_id: &[u8],
    queue_id: &EntityId,
    command: ClientCommand,
) {
    if queue_id.is_empty() {
        respond(ctx, corr_id, queue_id, BrokerResponse::Err(ErrorCode::CmdNoQueue)).await;
        return;
    }
    if auth.signature.is_empty() {
        respond(ctx, corr_id, queue_id, BrokerResponse::Err(ErrorCode::CmdNoAuth)).await;
        return;
    }
    let authorized = ctx
        .store
        .recipient_key(queue_id)
        .map(|key| key.verify(&auth.signed, &auth.signature).is_ok())
        .unwrap_or(false);
    if !authorized {
        respond(ctx, corr_id, queue_id, BrokerResponse::Err(ErrorCode::Auth)).await;
        return;
    }

    let response = match command {
        ClientCommand::Key(sender_key) => match ctx.store.secure(queue_id, sender_key) {
            Ok(()) => BrokerResponse::Ok,
            Err(e) => BrokerResponse::Err(store_error_code(&e)),
        },
        ClientCommand::Sub => {
            ctx.subscriptions.subscribe(
                queue_id.clone(),
                Subscriber::new(ctx.id, ctx.delivery_tx.clone()),
            );
            BrokerResponse::Ok
        }
        ClientCommand::Ack => match ctx.store.ack(queue_id) {
            Ok(()) => BrokerResponse::Ok,
            Err(e) => BrokerResponse::Err(store_error_code(&e)),
        },
        ClientCommand::Off => match ctx.store.disable(queue_id) {
            Ok(()) => BrokerResponse::Ok,
            Err(e) => BrokerResponse::Err(store_error_code(&e)),
        },
        ClientCommand::Del => match ctx.store.delete(queue_id) {
            Ok(()) => {
                ctx.subscriptions.remove_queue(queue_id);
                BrokerResponse::Ok
            }
            Err(e) => BrokerResponse::Err(store_error_code(&e)),
        },
        // NEW, SEND and PING are routed before dispatch
        _ => BrokerResponse::Err(ErrorCode::CmdProhibited),
    };

    let succeeded = response == BrokerResponse::Ok;
    respond(ctx, corr_id, queue_id, response).await;

    // after a successful SUB or ACK this session holds the subscription
    // and the next deliverable message (if any) is pushed behind the OK
    if succeeded && ctx.subscriptions.is_subscriber(queue_id, ctx.id) {
        push_head(ctx, queue_id);
    }
}
