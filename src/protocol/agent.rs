//! # Agent Wire Codec
//!
//! Two grammars live here:
//!
//! 1. The **local client protocol** between an application and its agent:
//!    transmissions of three LF-terminated lines (correlation id,
//!    connection alias, command) with length-prefixed bodies, mirroring the
//!    broker grammar minus the signature line.
//! 2. The **agent envelope**: what one agent seals into an SMP message body
//!    for the peer agent — the initial confirmation, the HELLO/REPLY
//!    handshake and ordinary payload messages, all carrying the
//!    per-direction wire id and hash chain.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use thiserror::Error;

use crate::crypto::VerifyKey;
use crate::defaults;
use crate::encoding;
use crate::protocol::address::{SmpQueueInfo, SmpServer};
use crate::protocol::ErrorCode;
use crate::transport::{get_block, TransportError, TransportRead};

/// Numeric reasons attached to `SYNTAX` errors.
pub mod syntax_code {
    pub const BAD_ENCODING: u16 = 10;
    pub const BAD_COMMAND: u16 = 11;
    pub const BAD_INVITATION: u16 = 12;
    pub const NO_CONN_ALIAS: u16 = 13;
    pub const BAD_MESSAGE: u16 = 14;
    pub const BAD_SERVER: u16 = 15;
}

/// Agent-surfaced error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    /// Connection alias is not known to this agent.
    #[error("UNKNOWN")]
    Unknown,
    /// Command is not allowed in the connection's current state.
    #[error("PROHIBITED")]
    Prohibited,
    #[error("SYNTAX {0}")]
    Syntax(u16),
    /// Broker unreachable or misbehaving.
    #[error("BROKER {0}")]
    Broker(String),
    /// Error response relayed from the broker.
    #[error("SMP {0}")]
    Smp(ErrorCode),
    #[error("SIZE")]
    Size,
    #[error("STORE {0}")]
    Store(String),
    #[error("INTERNAL")]
    Internal,
}

impl AgentError {
    fn parse(s: &str) -> Option<Self> {
        let (head, rest) = match s.split_once(' ') {
            Some((head, rest)) => (head, rest),
            None => (s, ""),
        };
        Some(match head {
            "UNKNOWN" => AgentError::Unknown,
            "PROHIBITED" => AgentError::Prohibited,
            "SYNTAX" => AgentError::Syntax(rest.parse().ok()?),
            "BROKER" => AgentError::Broker(rest.to_string()),
            "SMP" => AgentError::Smp(rest.parse().ok()?),
            "SIZE" => AgentError::Size,
            "STORE" => AgentError::Store(rest.to_string()),
            "INTERNAL" => AgentError::Internal,
            _ => return None,
        })
    }
}

/// How the joining side provisions the reverse direction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReplyMode {
    /// One-way connection: no reply queue is created.
    No,
    /// Create the reply queue on the same broker as the invitation.
    #[default]
    On,
    /// Create the reply queue on the given broker.
    Via(SmpServer),
}

/// Whether the sender expects per-message acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    #[default]
    On,
    Off,
}

/// Commands a local client issues to the agent.
#[derive(Clone, PartialEq, Debug)]
pub enum AgentCommand {
    /// Create a connection: provision a receive queue on the broker and
    /// hand back an invitation.
    New(SmpServer),
    /// Accept an invitation.
    Join(SmpQueueInfo, ReplyMode),
    Sub,
    Send(Vec<u8>),
    Ack(u64),
}

/// Integrity verdict attached to a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgStatus {
    Ok,
    /// Hash chain mismatch; the chain still advances past the message.
    BadHash,
    /// Wire ids were skipped between `from` and `to` inclusive.
    Skipped { from: u64, to: u64 },
}

impl fmt::Display for MsgStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MsgStatus::Ok => write!(f, "OK"),
            MsgStatus::BadHash => write!(f, "ERR HASH"),
            MsgStatus::Skipped { from, to } => write!(f, "ERR SKIP {from} {to}"),
        }
    }
}

/// Events and responses the agent sends to a local client.
#[derive(Clone, PartialEq, Debug)]
pub enum AgentEvent {
    /// Invitation for the peer, in reply to `NEW`.
    Inv(SmpQueueInfo),
    /// The connection reached the active state.
    Con,
    /// A payload message was received.
    Msg {
        id: u64,
        broker_ts: DateTime<Utc>,
        agent_ts: DateTime<Utc>,
        status: MsgStatus,
        body: Vec<u8>,
    },
    Ok,
    Err(AgentError),
}

fn push_line(out: &mut Vec<u8>, line: &str) {
    out.extend_from_slice(line.as_bytes());
    out.push(b'\n');
}

fn push_body(out: &mut Vec<u8>, body: &[u8]) {
    out.extend_from_slice(body);
    out.push(b'\n');
}

fn timestamp_encode(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn timestamp_decode(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Serialise a client command as a transmission (client side).
pub fn encode_agent_command(corr_id: &[u8], alias: &str, command: &AgentCommand) -> Vec<u8> {
    let mut out = Vec::new();
    push_line(&mut out, &encoding::b64_encode(corr_id));
    push_line(&mut out, alias);
    match command {
        AgentCommand::New(server) => push_line(&mut out, &format!("NEW {server}")),
        AgentCommand::Join(info, mode) => {
            let line = match mode {
                ReplyMode::On => format!("JOIN {info}"),
                ReplyMode::No => format!("JOIN {info} NO_REPLY"),
                ReplyMode::Via(server) => format!("JOIN {info} {server}"),
            };
            push_line(&mut out, &line);
        }
        AgentCommand::Sub => push_line(&mut out, "SUB"),
        AgentCommand::Send(body) => {
            push_line(&mut out, &format!("SEND {}", body.len()));
            push_body(&mut out, body);
        }
        AgentCommand::Ack(id) => push_line(&mut out, &format!("ACK {id}")),
    }
    out
}

/// Serialise an agent event as a transmission (agent side).
pub fn encode_agent_event(corr_id: &[u8], alias: &str, event: &AgentEvent) -> Vec<u8> {
    let mut out = Vec::new();
    push_line(&mut out, &encoding::b64_encode(corr_id));
    push_line(&mut out, alias);
    match event {
        AgentEvent::Inv(info) => push_line(&mut out, &format!("INV {info}")),
        AgentEvent::Con => push_line(&mut out, "CON"),
        AgentEvent::Msg {
            id,
            broker_ts,
            agent_ts,
            status,
            body,
        } => {
            push_line(
                &mut out,
                &format!(
                    "MSG {} {} {} {} {}",
                    id,
                    timestamp_encode(broker_ts),
                    timestamp_encode(agent_ts),
                    status,
                    body.len()
                ),
            );
            push_body(&mut out, body);
        }
        AgentEvent::Ok => push_line(&mut out, "OK"),
        AgentEvent::Err(err) => push_line(&mut out, &format!("ERR {err}")),
    }
    out
}

/// One parsed client transmission on the agent side.
pub struct AgentTransmission {
    pub corr_id: Vec<u8>,
    pub alias: String,
    pub command: Result<AgentCommand, AgentError>,
}

/// Read and parse one client transmission (agent side).
pub async fn read_agent_transmission(
    r: &mut (dyn TransportRead + '_),
) -> Result<AgentTransmission, TransportError> {
    let corr_line = r.get_line().await?;
    let alias = r.get_line().await?;
    let cmd_line = r.get_line().await?;

    let tokens: Vec<&str> = cmd_line.split(' ').collect();
    let command = match tokens.as_slice() {
        ["NEW", server] => SmpServer::parse(server)
            .map(AgentCommand::New)
            .map_err(|_| AgentError::Syntax(syntax_code::BAD_SERVER)),
        ["JOIN", info] => SmpQueueInfo::parse(info)
            .map(|i| AgentCommand::Join(i, ReplyMode::On))
            .map_err(|_| AgentError::Syntax(syntax_code::BAD_INVITATION)),
        ["JOIN", info, mode] => match SmpQueueInfo::parse(info) {
            Err(_) => Err(AgentError::Syntax(syntax_code::BAD_INVITATION)),
            Ok(info) => {
                if *mode == "NO_REPLY" {
                    Ok(AgentCommand::Join(info, ReplyMode::No))
                } else {
                    SmpServer::parse(mode)
                        .map(|s| AgentCommand::Join(info, ReplyMode::Via(s)))
                        .map_err(|_| AgentError::Syntax(syntax_code::BAD_SERVER))
                }
            }
        },
        ["SUB"] => Ok(AgentCommand::Sub),
        ["SEND", len] => match len.parse::<usize>() {
            Ok(n) if n <= defaults::AGENT_MAX_BODY => {
                let body = get_block(r, n, defaults::AGENT_MAX_BODY).await?;
                Ok(AgentCommand::Send(body))
            }
            Ok(_) => Err(AgentError::Size),
            Err(_) => Err(AgentError::Syntax(syntax_code::BAD_COMMAND)),
        },
        ["ACK", id] => id
            .parse::<u64>()
            .map(AgentCommand::Ack)
            .map_err(|_| AgentError::Syntax(syntax_code::BAD_COMMAND)),
        _ => Err(AgentError::Syntax(syntax_code::BAD_COMMAND)),
    };

    // corr decoding failures are reported only after any body was consumed
    // so the framing stays intact
    let (corr_id, command) = match encoding::b64_decode(&corr_line) {
        Ok(corr_id) => (corr_id, command),
        Err(_) => (
            Vec::new(),
            command.and(Err(AgentError::Syntax(syntax_code::BAD_ENCODING))),
        ),
    };

    Ok(AgentTransmission {
        corr_id,
        alias,
        command,
    })
}

/// One parsed agent transmission on the client side.
pub struct AgentEventTransmission {
    pub corr_id: Vec<u8>,
    pub alias: String,
    /// `None` when the event line did not parse.
    pub event: Option<AgentEvent>,
}

/// Read and parse one agent event (client side).
pub async fn read_agent_event(
    r: &mut (dyn TransportRead + '_),
) -> Result<AgentEventTransmission, TransportError> {
    let corr_line = r.get_line().await?;
    let alias = r.get_line().await?;
    let event_line = r.get_line().await?;

    let corr_id = encoding::b64_decode(&corr_line).unwrap_or_default();

    let tokens: Vec<&str> = event_line.split(' ').collect();
    let event = match tokens.as_slice() {
        ["INV", info] => SmpQueueInfo::parse(info).ok().map(AgentEvent::Inv),
        ["CON"] => Some(AgentEvent::Con),
        ["OK"] => Some(AgentEvent::Ok),
        ["ERR", rest @ ..] => AgentError::parse(&rest.join(" ")).map(AgentEvent::Err),
        ["MSG", id, broker_ts, agent_ts, rest @ ..] => {
            parse_msg_event(id, broker_ts, agent_ts, rest, r).await?
        }
        _ => None,
    };

    Ok(AgentEventTransmission {
        corr_id,
        alias,
        event,
    })
}

async fn parse_msg_event(
    id: &str,
    broker_ts: &str,
    agent_ts: &str,
    rest: &[&str],
    r: &mut (dyn TransportRead + '_),
) -> Result<Option<AgentEvent>, TransportError> {
    let (status, len) = match rest {
        ["OK", len] => (MsgStatus::Ok, len),
        ["ERR", "HASH", len] => (MsgStatus::BadHash, len),
        ["ERR", "SKIP", from, to, len] => match (from.parse(), to.parse()) {
            (Ok(from), Ok(to)) => (MsgStatus::Skipped { from, to }, len),
            _ => return Ok(None),
        },
        _ => return Ok(None),
    };
    let parsed = (
        id.parse::<u64>().ok(),
        timestamp_decode(broker_ts),
        timestamp_decode(agent_ts),
        len.parse::<usize>().ok(),
    );
    match parsed {
        (Some(id), Some(broker_ts), Some(agent_ts), Some(n))
            if n <= defaults::AGENT_MAX_BODY =>
        {
            let body = get_block(r, n, defaults::AGENT_MAX_BODY).await?;
            Ok(Some(AgentEvent::Msg {
                id,
                broker_ts,
                agent_ts,
                status,
                body,
            }))
        }
        _ => Ok(None),
    }
}

/// What one agent seals into an SMP message body for the peer agent.
#[derive(Clone, PartialEq, Debug)]
pub enum AgentEnvelope {
    /// First ever sender→recipient message: announces the sender's verify
    /// key so the recipient can secure the queue. Outside the hash chain.
    Confirmation { sender_key: VerifyKey },
    Message(AgentMessage),
}

/// A chained agent message.
#[derive(Clone, PartialEq, Debug)]
pub struct AgentMessage {
    /// Strictly monotonic per direction, starting at 1.
    pub wire_id: u64,
    pub timestamp: DateTime<Utc>,
    /// SHA-256 of the previously sent serialised message; empty for the
    /// first message of a direction.
    pub prev_hash: Vec<u8>,
    pub payload: AgentPayload,
}

#[derive(Clone, PartialEq)]
pub enum AgentPayload {
    Hello { key: VerifyKey, ack_mode: AckMode },
    Reply(SmpQueueInfo),
    Body(Vec<u8>),
}

impl fmt::Debug for AgentPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentPayload::Hello { key, ack_mode } => {
                write!(f, "HELLO {key:?} {ack_mode:?}")
            }
            AgentPayload::Reply(info) => write!(f, "REPLY {info:?}"),
            AgentPayload::Body(body) => write!(f, "MSG <{} bytes>", body.len()),
        }
    }
}

impl AgentEnvelope {
    /// Serialise to the plaintext that gets sealed (and hashed, for
    /// chained messages).
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            AgentEnvelope::Confirmation { sender_key } => {
                push_line(&mut out, &format!("CONF {}", sender_key.encoded()));
            }
            AgentEnvelope::Message(msg) => {
                let hash = if msg.prev_hash.is_empty() {
                    "-".to_string()
                } else {
                    encoding::b64url_encode(&msg.prev_hash)
                };
                push_line(
                    &mut out,
                    &format!("MSG {} {} {}", msg.wire_id, timestamp_encode(&msg.timestamp), hash),
                );
                match &msg.payload {
                    AgentPayload::Hello { key, ack_mode } => {
                        let ack = match ack_mode {
                            AckMode::On => "ACK",
                            AckMode::Off => "NO_ACK",
                        };
                        push_line(&mut out, &format!("HELLO {} {}", key.encoded(), ack));
                    }
                    AgentPayload::Reply(info) => push_line(&mut out, &format!("REPLY {info}")),
                    AgentPayload::Body(body) => {
                        push_line(&mut out, &format!("MSG {}", body.len()));
                        push_body(&mut out, body);
                    }
                }
            }
        }
        out
    }

    /// Parse a decrypted message body.
    pub fn parse(bytes: &[u8]) -> Result<Self, AgentError> {
        let bad = || AgentError::Syntax(syntax_code::BAD_MESSAGE);
        let text_end = bytes.len();
        let (header, rest) = split_line(bytes, 0).ok_or_else(bad)?;

        let tokens: Vec<&str> = header.split(' ').collect();
        match tokens.as_slice() {
            ["CONF", key] => {
                if rest != text_end {
                    return Err(bad());
                }
                let sender_key = VerifyKey::decode(key).map_err(|_| bad())?;
                Ok(AgentEnvelope::Confirmation { sender_key })
            }
            ["MSG", wire_id, ts, hash] => {
                let wire_id = wire_id.parse::<u64>().map_err(|_| bad())?;
                let timestamp = timestamp_decode(ts).ok_or_else(bad)?;
                let prev_hash = if *hash == "-" {
                    Vec::new()
                } else {
                    encoding::b64url_decode(hash).map_err(|_| bad())?
                };
                let (inner, inner_rest) = split_line(bytes, rest).ok_or_else(bad)?;
                let payload = parse_payload(&inner, &bytes[inner_rest..])?;
                Ok(AgentEnvelope::Message(AgentMessage {
                    wire_id,
                    timestamp,
                    prev_hash,
                    payload,
                }))
            }
            _ => Err(bad()),
        }
    }
}

/// Split one LF-terminated UTF-8 line out of `bytes` starting at `from`;
/// returns the line and the offset past the terminator.
fn split_line(bytes: &[u8], from: usize) -> Option<(String, usize)> {
    let rel = bytes[from..].iter().position(|&b| b == b'\n')?;
    let line = std::str::from_utf8(&bytes[from..from + rel]).ok()?;
    Some((line.to_string(), from + rel + 1))
}

fn parse_payload(line: &str, rest: &[u8]) -> Result<AgentPayload, AgentError> {
    let bad = || AgentError::Syntax(syntax_code::BAD_MESSAGE);
    let tokens: Vec<&str> = line.split(' ').collect();
    match tokens.as_slice() {
        ["HELLO", key, ack] => {
            if !rest.is_empty() {
                return Err(bad());
            }
            let key = VerifyKey::decode(key).map_err(|_| bad())?;
            let ack_mode = match *ack {
                "ACK" => AckMode::On,
                "NO_ACK" => AckMode::Off,
                _ => return Err(bad()),
            };
            Ok(AgentPayload::Hello { key, ack_mode })
        }
        ["REPLY", info] => {
            if !rest.is_empty() {
                return Err(bad());
            }
            let info = SmpQueueInfo::parse(info).map_err(|_| bad())?;
            Ok(AgentPayload::Reply(info))
        }
        ["MSG", len] => {
            let n = len.parse::<usize>().map_err(|_| bad())?;
            if rest.len() != n + 1 || rest[n] != b'\n' {
                return Err(bad());
            }
            Ok(AgentPayload::Body(rest[..n].to_vec()))
        }
        _ => Err(bad()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{EncKeyPair, SignKeyPair};
    use crate::protocol::EntityId;
    use crate::transport::{plain, TransportWrite};

    fn queue_info() -> SmpQueueInfo {
        SmpQueueInfo {
            server: SmpServer::new("broker.example", Some(5223), Some(vec![9u8; 32])),
            sender_id: EntityId::generate(),
            enc_key: EncKeyPair::generate().public(),
        }
    }

    async fn feed(bytes: Vec<u8>) -> crate::transport::BoxedRead {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (read, _w) = plain(server);
        let (_r, mut write) = plain(client);
        write.put_bytes(&bytes).await.unwrap();
        read
    }

    #[tokio::test]
    async fn agent_commands_round_trip() {
        let commands = vec![
            AgentCommand::New(SmpServer::new("localhost", Some(7001), None)),
            AgentCommand::Join(queue_info(), ReplyMode::On),
            AgentCommand::Join(queue_info(), ReplyMode::No),
            AgentCommand::Join(
                queue_info(),
                ReplyMode::Via(SmpServer::new("other.example", None, Some(vec![3u8; 32]))),
            ),
            AgentCommand::Sub,
            AgentCommand::Send(b"hello".to_vec()),
            AgentCommand::Ack(42),
        ];
        for command in commands {
            let bytes = encode_agent_command(b"corr", "alias-1", &command);
            let mut read = feed(bytes).await;
            let t = read_agent_transmission(read.as_mut()).await.unwrap();
            assert_eq!(t.corr_id, b"corr");
            assert_eq!(t.alias, "alias-1");
            assert_eq!(t.command.unwrap(), command);
        }
    }

    #[tokio::test]
    async fn agent_events_round_trip() {
        let now = timestamp_decode("2024-05-01T10:20:30.400Z").unwrap();
        let events = vec![
            AgentEvent::Inv(queue_info()),
            AgentEvent::Con,
            AgentEvent::Ok,
            AgentEvent::Err(AgentError::Smp(ErrorCode::Auth)),
            AgentEvent::Err(AgentError::Syntax(syntax_code::NO_CONN_ALIAS)),
            AgentEvent::Err(AgentError::Broker("tcp_connection".into())),
            AgentEvent::Msg {
                id: 1,
                broker_ts: now,
                agent_ts: now,
                status: MsgStatus::Ok,
                body: b"hello".to_vec(),
            },
            AgentEvent::Msg {
                id: 9,
                broker_ts: now,
                agent_ts: now,
                status: MsgStatus::Skipped { from: 4, to: 8 },
                body: b"late".to_vec(),
            },
            AgentEvent::Msg {
                id: 2,
                broker_ts: now,
                agent_ts: now,
                status: MsgStatus::BadHash,
                body: vec![],
            },
        ];
        for event in events {
            let bytes = encode_agent_event(b"corr", "alias-1", &event);
            let mut read = feed(bytes).await;
            let t = read_agent_event(read.as_mut()).await.unwrap();
            assert_eq!(t.event.unwrap(), event);
        }
    }

    #[tokio::test]
    async fn oversized_send_fails_with_size() {
        let mut bytes = Vec::new();
        for line in [
            "",
            "alias-1",
            &format!("SEND {}", defaults::AGENT_MAX_BODY + 1),
        ] {
            bytes.extend_from_slice(line.as_bytes());
            bytes.push(b'\n');
        }
        let mut read = feed(bytes).await;
        let t = read_agent_transmission(read.as_mut()).await.unwrap();
        assert_eq!(t.command.unwrap_err(), AgentError::Size);
    }

    #[test]
    fn envelopes_round_trip() {
        let keys = SignKeyPair::generate();
        let now = timestamp_decode("2024-05-01T10:20:30.400Z").unwrap();
        let envelopes = vec![
            AgentEnvelope::Confirmation {
                sender_key: keys.public(),
            },
            AgentEnvelope::Message(AgentMessage {
                wire_id: 1,
                timestamp: now,
                prev_hash: Vec::new(),
                payload: AgentPayload::Hello {
                    key: keys.public(),
                    ack_mode: AckMode::On,
                },
            }),
            AgentEnvelope::Message(AgentMessage {
                wire_id: 2,
                timestamp: now,
                prev_hash: vec![5u8; 32],
                payload: AgentPayload::Reply(queue_info()),
            }),
            AgentEnvelope::Message(AgentMessage {
                wire_id: 3,
                timestamp: now,
                prev_hash: vec![6u8; 32],
                payload: AgentPayload::Body(b"the payload\nwith a newline".to_vec()),
            }),
        ];
        for envelope in envelopes {
            let bytes = envelope.serialize();
            assert_eq!(AgentEnvelope::parse(&bytes).unwrap(), envelope);
        }
    }

    #[test]
    fn truncated_envelope_is_rejected() {
        let envelope = AgentEnvelope::Message(AgentMessage {
            wire_id: 3,
            timestamp: Utc::now(),
            prev_hash: vec![6u8; 32],
            payload: AgentPayload::Body(b"payload".to_vec()),
        });
        let mut bytes = envelope.serialize();
        bytes.pop();
        assert!(AgentEnvelope::parse(&bytes).is_err());
    }

    #[test]
    fn agent_errors_round_trip_as_text() {
        let errors = [
            AgentError::Unknown,
            AgentError::Prohibited,
            AgentError::Syntax(syntax_code::BAD_MESSAGE),
            AgentError::Broker("timeout".into()),
            AgentError::Smp(ErrorCode::Quota),
            AgentError::Size,
            AgentError::Store("busy".into()),
            AgentError::Internal,
        ];
        for err in errors {
            assert_eq!(AgentError::parse(&err.to_string()).unwrap(), err);
        }
    }
}
