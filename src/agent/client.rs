//! # Broker Client Pool
//!
//! One long-lived client per broker address. Each client is an actor task
//! that owns the transport: commands are submitted through a channel and
//! matched to broker responses by correlation id; unsolicited `MSG`
//! transmissions are routed to the agent's inbound channel by queue id.
//!
//! On transport loss the actor fails every outstanding waiter, then
//! reconnects with exponential backoff and reissues `SUB` for every
//! receive queue registered with it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::crypto::SignKeyPair;
use crate::defaults;
use crate::protocol::address::SmpServer;
use crate::protocol::agent::AgentError;
use crate::protocol::{
    encode_client_transmission, read_broker_transmission, BrokerResponse, ClientCommand, EntityId,
};
use crate::transport::{tls, BoxedRead, BoxedWrite};

/// An unsolicited message pushed by a broker.
#[derive(Debug)]
pub struct InboundMsg {
    pub server: SmpServer,
    pub recipient_id: EntityId,
    pub msg_id: u64,
    pub timestamp: DateTime<Utc>,
    pub body: Vec<u8>,
}

/// Clients keyed by broker address, sharing one inbound channel.
pub struct ClientPool {
    clients: tokio::sync::Mutex<HashMap<SmpServer, Arc<ServerClient>>>,
    inbound_tx: mpsc::Sender<InboundMsg>,
}

impl ClientPool {
    pub fn new(inbound_capacity: usize) -> (Arc<Self>, mpsc::Receiver<InboundMsg>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity);
        (
            Arc::new(Self {
                clients: tokio::sync::Mutex::new(HashMap::new()),
                inbound_tx,
            }),
            inbound_rx,
        )
    }

    /// Existing client for `server`, or a freshly connected one.
    pub async fn client(&self, server: &SmpServer) -> Result<Arc<ServerClient>, AgentError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(server) {
            return Ok(client.clone());
        }
        let client = ServerClient::start(server.clone(), self.inbound_tx.clone()).await?;
        clients.insert(server.clone(), client.clone());
        Ok(client)
    }
}

enum Op {
    Command {
        signer: Option<SignKeyPair>,
        queue: EntityId,
        command: ClientCommand,
        reply: oneshot::Sender<Result<BrokerResponse, AgentError>>,
    },
}

/// Client actor handle for one broker.
pub struct ServerClient {
    server: SmpServer,
    op_tx: mpsc::Sender<Op>,
    /// Receive queues to re-SUB after a reconnect, with their keys.
    subscriptions: Mutex<HashMap<EntityId, SignKeyPair>>,
}

impl ServerClient {
    async fn start(
        server: SmpServer,
        inbound_tx: mpsc::Sender<InboundMsg>,
    ) -> Result<Arc<Self>, AgentError> {
        // connect eagerly so an unreachable broker fails the triggering
        // command instead of a background task
        let transport = tls::connect(&server)
            .await
            .map_err(|e| AgentError::Broker(format!("tcp_connection {e}")))?;
        info!(server = %server, "broker client connected");

        let (op_tx, op_rx) = mpsc::channel(64);
        let client = Arc::new(Self {
            server,
            op_tx,
            subscriptions: Mutex::new(HashMap::new()),
        });
        tokio::spawn(client_task(
            client.clone(),
            inbound_tx,
            op_rx,
            Some(transport),
        ));
        Ok(client)
    }

    /// Submit one command and wait for the correlated response.
    ///
    /// Broker `ERR` responses come back as [`AgentError::Smp`]; transport
    /// trouble as [`AgentError::Broker`].
    pub async fn command(
        &self,
        signer: Option<&SignKeyPair>,
        queue: &EntityId,
        command: ClientCommand,
    ) -> Result<BrokerResponse, AgentError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.op_tx
            .send(Op::Command {
                signer: signer.cloned(),
                queue: queue.clone(),
                command,
                reply: reply_tx,
            })
            .await
            .map_err(|_| AgentError::Broker("tcp_connection".into()))?;
        match timeout(defaults::COMMAND_TIMEOUT, reply_rx).await {
            Err(_) => Err(AgentError::Broker("tcp_connection".into())),
            Ok(Err(_)) => Err(AgentError::Broker("tcp_connection".into())),
            Ok(Ok(result)) => result,
        }
    }

    /// Remember a receive queue for automatic re-subscription.
    pub fn register_subscription(&self, recipient_id: EntityId, keys: SignKeyPair) {
        self.subscriptions.lock().insert(recipient_id, keys);
    }

    pub fn drop_subscription(&self, recipient_id: &EntityId) {
        self.subscriptions.lock().remove(recipient_id);
    }
}

/// Exponential backoff with a ceiling, starting at the base delay.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let base = defaults::RECONNECT_BASE_DELAY;
    let max = defaults::RECONNECT_MAX_DELAY;
    let exp = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp).min(max)
}

enum ReadEvent {
    Transmission {
        corr_id: Vec<u8>,
        queue_id: EntityId,
        response: Option<BrokerResponse>,
    },
}

async fn read_loop(mut read: BoxedRead, event_tx: mpsc::Sender<ReadEvent>) {
    loop {
        match read_broker_transmission(read.as_mut()).await {
            Ok(t) => {
                let event = ReadEvent::Transmission {
                    corr_id: t.corr_id,
                    queue_id: t.queue_id,
                    response: t.response,
                };
                if event_tx.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("broker read loop ended: {e}");
                break;
            }
        }
    }
}

async fn client_task(
    client: Arc<ServerClient>,
    inbound_tx: mpsc::Sender<InboundMsg>,
    mut op_rx: mpsc::Receiver<Op>,
    mut initial: Option<(BoxedRead, BoxedWrite)>,
) {
    let mut attempt: u32 = 0;
    loop {
        let (read, mut write) = match initial.take() {
            Some(transport) => transport,
            None => match tls::connect(&client.server).await {
                Ok(transport) => transport,
                Err(e) => {
                    attempt += 1;
                    warn!(server = %client.server, attempt, "reconnect failed: {e}");
                    if attempt >= defaults::RECONNECT_NOTIFY_AFTER {
                        // enough failed attempts: stop queueing commands
                        // silently and fail them out
                        while let Ok(Op::Command { reply, .. }) = op_rx.try_recv() {
                            let _ = reply.send(Err(AgentError::Broker("tcp_connection".into())));
                        }
                    }
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    continue;
                }
            },
        };
        if attempt > 0 {
            info!(server = %client.server, "broker client reconnected");
        }
        attempt = 0;

        let (event_tx, mut event_rx) = mpsc::channel(128);
        let reader = tokio::spawn(read_loop(read, event_tx));
        let mut pending: HashMap<Vec<u8>, oneshot::Sender<Result<BrokerResponse, AgentError>>> =
            HashMap::new();

        // reissue SUB for every known receive queue; responses are matched
        // and dropped like any other correlated reply
        let subs: Vec<(EntityId, SignKeyPair)> = client
            .subscriptions
            .lock()
            .iter()
            .map(|(id, keys)| (id.clone(), keys.clone()))
            .collect();
        let mut resubscribe_failed = false;
        for (recipient_id, keys) in subs {
            let corr = EntityId::generate();
            let bytes = encode_client_transmission(
                Some(&keys),
                corr.as_bytes(),
                &recipient_id,
                &ClientCommand::Sub,
            );
            if write.put_bytes(&bytes).await.is_err() {
                resubscribe_failed = true;
                break;
            }
        }
        if resubscribe_failed {
            reader.abort();
            continue;
        }

        let mut keepalive = interval(defaults::PING_INTERVAL);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keepalive.reset();

        loop {
            tokio::select! {
                op = op_rx.recv() => match op {
                    // agent dropped the client: shut down for good
                    None => {
                        reader.abort();
                        return;
                    }
                    Some(Op::Command { signer, queue, command, reply }) => {
                        let corr = EntityId::generate();
                        let bytes = encode_client_transmission(
                            signer.as_ref(),
                            corr.as_bytes(),
                            &queue,
                            &command,
                        );
                        match write.put_bytes(&bytes).await {
                            Ok(()) => {
                                pending.insert(corr.as_bytes().to_vec(), reply);
                                keepalive.reset();
                            }
                            Err(e) => {
                                debug!(server = %client.server, "send failed: {e}");
                                let _ = reply.send(Err(AgentError::Broker(
                                    "tcp_connection".into(),
                                )));
                                break;
                            }
                        }
                    }
                },
                event = event_rx.recv() => match event {
                    None => break,
                    Some(ReadEvent::Transmission { corr_id, queue_id, response }) => {
                        match response {
                            Some(BrokerResponse::Msg { msg_id, timestamp, body }) => {
                                let inbound = InboundMsg {
                                    server: client.server.clone(),
                                    recipient_id: queue_id,
                                    msg_id,
                                    timestamp,
                                    body,
                                };
                                if inbound_tx.send(inbound).await.is_err() {
                                    reader.abort();
                                    return;
                                }
                            }
                            Some(BrokerResponse::End) => {
                                warn!(server = %client.server, queue = %queue_id,
                                      "subscription taken over by another session");
                            }
                            Some(response) => {
                                if let Some(reply) = pending.remove(&corr_id) {
                                    let result = match response {
                                        BrokerResponse::Err(code) =>
                                            Err(AgentError::Smp(code)),
                                        other => Ok(other),
                                    };
                                    let _ = reply.send(result);
                                }
                                // unmatched responses (e.g. keep-alive PONG)
                                // are dropped
                            }
                            None => {
                                debug!(server = %client.server, "unparseable broker response");
                            }
                        }
                    }
                },
                _ = keepalive.tick() => {
                    let corr = EntityId::generate();
                    let bytes = encode_client_transmission(
                        None,
                        corr.as_bytes(),
                        &EntityId::empty(),
                        &ClientCommand::Ping,
                    );
                    if write.put_bytes(&bytes).await.is_err() {
                        break;
                    }
                }
            }
        }

        reader.abort();
        for (_, reply) in pending.drain() {
            let _ = reply.send(Err(AgentError::Broker("tcp_connection".into())));
        }
        warn!(server = %client.server, "broker connection lost, reconnecting");
    }
}
