//! # SMP Wire Codec
//!
//! The line-structured unit of the protocol is the *transmission*:
//!
//! ```text
//! <signature_b64url_or_empty>\n
//! <correlation_id_b64>\n
//! <queue_id_b64url_or_empty>\n
//! <command_line>\n
//! [<body bytes>\n]          (present when the command line ends in a length)
//! ```
//!
//! The signature covers everything from the correlation line through the
//! body block. Broker responses use the same shape with an empty signature
//! line. Commands and responses are kept as two separate enums — the
//! session loop always knows statically which side it speaks for.
//!
//! Serialisation and parsing are inverses: for every command `c`,
//! `parse(serialize(c)) == c`, and reparsing parsed bytes reproduces them
//! modulo base64 padding normalisation.

use chrono::{DateTime, SecondsFormat, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::str::FromStr;

use crate::crypto::{SignKeyPair, VerifyKey};
use crate::defaults;
use crate::encoding::{self, EncodingError};
use crate::transport::{get_block, TransportError, TransportRead};

pub mod address;
pub mod agent;

/// Random opaque identifier: queue ids and correlation ids.
///
/// Generated from 24 bytes of OS randomness; uniqueness is enforced by
/// insert-or-fail at the store, not by the generator.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct EntityId(Vec<u8>);

impl EntityId {
    pub const SIZE: usize = defaults::ID_SIZE;

    pub fn generate() -> Self {
        let mut bytes = vec![0u8; Self::SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// The empty id used on commands that address no queue (NEW, PING).
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn encoded(&self) -> String {
        encoding::b64url_encode(&self.0)
    }

    pub fn decode(s: &str) -> Result<Self, EncodingError> {
        if s.is_empty() {
            return Ok(Self::empty());
        }
        encoding::b64url_decode(s).map(Self)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encoded())
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.encoded())
    }
}

/// Broker-surfaced error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Framing violation; the session is closed after this is sent.
    Block,
    CmdSyntax,
    CmdProhibited,
    CmdNoAuth,
    CmdHasAuth,
    CmdNoQueue,
    /// Authorization failure; deliberately does not reveal whether the
    /// queue exists.
    Auth,
    Quota,
    NoMsg,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::Block => "BLOCK",
            ErrorCode::CmdSyntax => "CMD SYNTAX",
            ErrorCode::CmdProhibited => "CMD PROHIBITED",
            ErrorCode::CmdNoAuth => "CMD NO_AUTH",
            ErrorCode::CmdHasAuth => "CMD HAS_AUTH",
            ErrorCode::CmdNoQueue => "CMD NO_QUEUE",
            ErrorCode::Auth => "AUTH",
            ErrorCode::Quota => "QUOTA",
            ErrorCode::NoMsg => "NO_MSG",
            ErrorCode::Internal => "INTERNAL",
        };
        f.write_str(s)
    }
}

impl FromStr for ErrorCode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "BLOCK" => ErrorCode::Block,
            "CMD SYNTAX" => ErrorCode::CmdSyntax,
            "CMD PROHIBITED" => ErrorCode::CmdProhibited,
            "CMD NO_AUTH" => ErrorCode::CmdNoAuth,
            "CMD HAS_AUTH" => ErrorCode::CmdHasAuth,
            "CMD NO_QUEUE" => ErrorCode::CmdNoQueue,
            "AUTH" => ErrorCode::Auth,
            "QUOTA" => ErrorCode::Quota,
            "NO_MSG" => ErrorCode::NoMsg,
            "INTERNAL" => ErrorCode::Internal,
            _ => return Err(()),
        })
    }
}

/// Commands a client (recipient or sender) issues to the broker.
#[derive(Clone, PartialEq)]
pub enum ClientCommand {
    /// Create a queue; the key authenticates all later recipient commands.
    New(VerifyKey),
    Sub,
    /// Set the sender key, securing the queue (recipient command).
    Key(VerifyKey),
    Ack,
    Off,
    Del,
    Send(Vec<u8>),
    Ping,
}

impl fmt::Debug for ClientCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientCommand::New(k) => write!(f, "NEW {k:?}"),
            ClientCommand::Sub => write!(f, "SUB"),
            ClientCommand::Key(k) => write!(f, "KEY {k:?}"),
            ClientCommand::Ack => write!(f, "ACK"),
            ClientCommand::Off => write!(f, "OFF"),
            ClientCommand::Del => write!(f, "DEL"),
            ClientCommand::Send(body) => write!(f, "SEND <{} bytes>", body.len()),
            ClientCommand::Ping => write!(f, "PING"),
        }
    }
}

/// Responses and pushes the broker sends to a client.
#[derive(Clone, PartialEq, Debug)]
pub enum BrokerResponse {
    Ids {
        recipient_id: EntityId,
        sender_id: EntityId,
    },
    Msg {
        msg_id: u64,
        timestamp: DateTime<Utc>,
        body: Vec<u8>,
    },
    /// The subscription was taken over by another session.
    End,
    Ok,
    Err(ErrorCode),
    Pong,
}

/// One parsed inbound transmission on the broker side.
///
/// Line decoding failures are captured in `command` so the session can
/// answer with a per-transmission error instead of dropping the link.
pub struct ClientTransmission {
    /// Raw signature bytes; empty when the transmission is unsigned.
    pub signature: Vec<u8>,
    /// The bytes the signature covers (correlation line through body).
    pub signed: Vec<u8>,
    pub corr_id: Vec<u8>,
    pub queue_id: EntityId,
    pub command: Result<ClientCommand, ErrorCode>,
}

fn timestamp_encode(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn timestamp_decode(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn push_line(out: &mut Vec<u8>, line: &str) {
    out.extend_from_slice(line.as_bytes());
    out.push(b'\n');
}

fn push_body(out: &mut Vec<u8>, body: &[u8]) {
    out.extend_from_slice(body);
    out.push(b'\n');
}

/// Serialise a client command as a full signed transmission.
pub fn encode_client_transmission(
    signer: Option<&SignKeyPair>,
    corr_id: &[u8],
    queue_id: &EntityId,
    command: &ClientCommand,
) -> Vec<u8> {
    let mut inner = Vec::new();
    push_line(&mut inner, &encoding::b64_encode(corr_id));
    push_line(&mut inner, &queue_id.encoded());
    match command {
        ClientCommand::New(key) => push_line(&mut inner, &format!("NEW {}", key.encoded())),
        ClientCommand::Sub => push_line(&mut inner, "SUB"),
        ClientCommand::Key(key) => push_line(&mut inner, &format!("KEY {}", key.encoded())),
        ClientCommand::Ack => push_line(&mut inner, "ACK"),
        ClientCommand::Off => push_line(&mut inner, "OFF"),
        ClientCommand::Del => push_line(&mut inner, "DEL"),
        ClientCommand::Ping => push_line(&mut inner, "PING"),
        ClientCommand::Send(body) => {
            push_line(&mut inner, &format!("SEND {}", body.len()));
            push_body(&mut inner, body);
        }
    }

    let signature = match signer {
        Some(keys) => encoding::b64url_encode(&keys.sign(&inner)),
        None => String::new(),
    };
    let mut out = Vec::with_capacity(signature.len() + 1 + inner.len());
    push_line(&mut out, &signature);
    out.extend_from_slice(&inner);
    out
}

/// Serialise a broker response as a full transmission (empty signature).
pub fn encode_broker_transmission(
    corr_id: &[u8],
    queue_id: &EntityId,
    response: &BrokerResponse,
) -> Vec<u8> {
    let mut out = Vec::new();
    push_line(&mut out, "");
    push_line(&mut out, &encoding::b64_encode(corr_id));
    push_line(&mut out, &queue_id.encoded());
    match response {
        BrokerResponse::Ids {
            recipient_id,
            sender_id,
        } => push_line(
            &mut out,
            &format!("IDS {} {}", recipient_id.encoded(), sender_id.encoded()),
        ),
        BrokerResponse::Msg {
            msg_id,
            timestamp,
            body,
        } => {
            push_line(
                &mut out,
                &format!("MSG {} {} {}", msg_id, timestamp_encode(timestamp), body.len()),
            );
            push_body(&mut out, body);
        }
        BrokerResponse::End => push_line(&mut out, "END"),
        BrokerResponse::Ok => push_line(&mut out, "OK"),
        BrokerResponse::Err(code) => push_line(&mut out, &format!("ERR {code}")),
        BrokerResponse::Pong => push_line(&mut out, "PONG"),
    }
    out
}

/// Read and parse one client transmission from the transport.
///
/// Transport-level failures (closed connection, oversized line) abort the
/// read; everything else is reported inside the returned transmission.
pub async fn read_client_transmission(
    r: &mut (dyn TransportRead + '_),
) -> Result<ClientTransmission, TransportError> {
    let sig_line = r.get_line().await?;
    let corr_line = r.get_line().await?;
    let queue_line = r.get_line().await?;
    let cmd_line = r.get_line().await?;

    let mut signed = Vec::new();
    push_line(&mut signed, &corr_line);
    push_line(&mut signed, &queue_line);
    push_line(&mut signed, &cmd_line);

    let signature = encoding::b64url_decode(&sig_line);
    let corr_id = encoding::b64_decode(&corr_line).unwrap_or_default();
    let queue_id = EntityId::decode(&queue_line);

    let tokens: Vec<&str> = cmd_line.split(' ').collect();
    let mut command: Result<ClientCommand, ErrorCode> = match tokens.as_slice() {
        ["NEW", key] => VerifyKey::decode(key)
            .map(ClientCommand::New)
            .map_err(|_| ErrorCode::CmdSyntax),
        ["SUB"] => Ok(ClientCommand::Sub),
        ["KEY", key] => VerifyKey::decode(key)
            .map(ClientCommand::Key)
            .map_err(|_| ErrorCode::CmdSyntax),
        ["ACK"] => Ok(ClientCommand::Ack),
        ["OFF"] => Ok(ClientCommand::Off),
        ["DEL"] => Ok(ClientCommand::Del),
        ["PING"] => Ok(ClientCommand::Ping),
        ["SEND", len] => match len.parse::<usize>() {
            Ok(n) if n <= defaults::MSG_MAX_BODY => {
                let body = get_block(r, n, defaults::MSG_MAX_BODY).await?;
                push_body(&mut signed, &body);
                Ok(ClientCommand::Send(body))
            }
            // an oversized declaration cannot be skipped without breaking
            // framing; the session closes after replying
            Ok(_) => Err(ErrorCode::Block),
            Err(_) => Err(ErrorCode::CmdSyntax),
        },
        _ => Err(ErrorCode::CmdSyntax),
    };

    let queue_id = match queue_id {
        Ok(id) => id,
        Err(_) => {
            command = command.and(Err(ErrorCode::CmdSyntax));
            EntityId::empty()
        }
    };
    let signature = match signature {
        Ok(sig) => sig,
        Err(_) => {
            // malformed signature: indistinguishable from a wrong one
            command = command.and(Err(ErrorCode::Auth));
            Vec::new()
        }
    };

    Ok(ClientTransmission {
        signature,
        signed,
        corr_id,
        queue_id,
        command,
    })
}

/// One parsed broker transmission on the client side.
pub struct BrokerTransmission {
    pub corr_id: Vec<u8>,
    pub queue_id: EntityId,
    /// `None` when the response line did not parse.
    pub response: Option<BrokerResponse>,
}

/// Read and parse one broker transmission from the transport.
pub async fn read_broker_transmission(
    r: &mut (dyn TransportRead + '_),
) -> Result<BrokerTransmission, TransportError> {
    let _sig_line = r.get_line().await?;
    let corr_line = r.get_line().await?;
    let queue_line = r.get_line().await?;
    let resp_line = r.get_line().await?;

    let corr_id = encoding::b64_decode(&corr_line).unwrap_or_default();
    let queue_id = EntityId::decode(&queue_line).unwrap_or_else(|_| EntityId::empty());

    let tokens: Vec<&str> = resp_line.split(' ').collect();
    let response = match tokens.as_slice() {
        ["IDS", recipient, sender] => match (EntityId::decode(recipient), EntityId::decode(sender))
        {
            (Ok(recipient_id), Ok(sender_id)) => Some(BrokerResponse::Ids {
                recipient_id,
                sender_id,
            }),
            _ => None,
        },
        ["MSG", id, ts, len] => {
            let msg_id = id.parse::<u64>().ok();
            let timestamp = timestamp_decode(ts);
            let declared = len.parse::<usize>().ok();
            match (msg_id, timestamp, declared) {
                (Some(msg_id), Some(timestamp), Some(n)) if n <= defaults::MSG_MAX_BODY => {
                    let body = get_block(r, n, defaults::MSG_MAX_BODY).await?;
                    Some(BrokerResponse::Msg {
                        msg_id,
                        timestamp,
                        body,
                    })
                }
                _ => None,
            }
        }
        ["END"] => Some(BrokerResponse::End),
        ["OK"] => Some(BrokerResponse::Ok),
        ["PONG"] => Some(BrokerResponse::Pong),
        ["ERR", rest @ ..] => rest.join(" ").parse::<ErrorCode>().ok().map(BrokerResponse::Err),
        _ => None,
    };

    Ok(BrokerTransmission {
        corr_id,
        queue_id,
        response,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{plain, TransportWrite};

    async fn feed(bytes: Vec<u8>) -> crate::transport::BoxedRead {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (read, _w) = plain(server);
        let (_r, mut write) = plain(client);
        write.put_bytes(&bytes).await.unwrap();
        read
    }

    #[tokio::test]
    async fn client_commands_round_trip() {
        let keys = SignKeyPair::generate();
        let queue = EntityId::generate();
        let corr = EntityId::generate();

        let commands = vec![
            ClientCommand::New(keys.public()),
            ClientCommand::Sub,
            ClientCommand::Key(keys.public()),
            ClientCommand::Ack,
            ClientCommand::Off,
            ClientCommand::Del,
            ClientCommand::Ping,
            ClientCommand::Send(b"hello".to_vec()),
        ];
        for command in commands {
            let bytes =
                encode_client_transmission(Some(&keys), corr.as_bytes(), &queue, &command);
            let mut read = feed(bytes).await;
            let t = read_client_transmission(read.as_mut()).await.unwrap();
            assert_eq!(t.corr_id, corr.as_bytes());
            assert_eq!(t.queue_id, queue);
            assert_eq!(t.command.unwrap(), command);
            assert!(keys.public().verify(&t.signed, &t.signature).is_ok());
        }
    }

    #[tokio::test]
    async fn unsigned_transmission_has_empty_signature() {
        let bytes = encode_client_transmission(
            None,
            b"corr",
            &EntityId::generate(),
            &ClientCommand::Send(b"body".to_vec()),
        );
        let mut read = feed(bytes).await;
        let t = read_client_transmission(read.as_mut()).await.unwrap();
        assert!(t.signature.is_empty());
        assert_eq!(t.command.unwrap(), ClientCommand::Send(b"body".to_vec()));
    }

    #[tokio::test]
    async fn unknown_command_is_a_syntax_error() {
        let mut bytes = Vec::new();
        for line in ["", "Y29ycg==", "", "FROB 1 2"] {
            bytes.extend_from_slice(line.as_bytes());
            bytes.push(b'\n');
        }
        let mut read = feed(bytes).await;
        let t = read_client_transmission(read.as_mut()).await.unwrap();
        assert_eq!(t.command.unwrap_err(), ErrorCode::CmdSyntax);
        assert_eq!(t.corr_id, b"corr");
    }

    #[tokio::test]
    async fn oversized_send_is_a_block_error() {
        let mut bytes = Vec::new();
        for line in ["", "", "", &format!("SEND {}", defaults::MSG_MAX_BODY + 1)] {
            bytes.extend_from_slice(line.as_bytes());
            bytes.push(b'\n');
        }
        let mut read = feed(bytes).await;
        let t = read_client_transmission(read.as_mut()).await.unwrap();
        assert_eq!(t.command.unwrap_err(), ErrorCode::Block);
    }

    #[tokio::test]
    async fn broker_responses_round_trip() {
        let corr = EntityId::generate();
        let queue = EntityId::generate();
        let responses = vec![
            BrokerResponse::Ids {
                recipient_id: EntityId::generate(),
                sender_id: EntityId::generate(),
            },
            BrokerResponse::Msg {
                msg_id: 7,
                timestamp: timestamp_decode("2024-05-01T10:20:30.400Z").unwrap(),
                body: b"payload".to_vec(),
            },
            BrokerResponse::End,
            BrokerResponse::Ok,
            BrokerResponse::Err(ErrorCode::CmdNoAuth),
            BrokerResponse::Err(ErrorCode::Quota),
            BrokerResponse::Pong,
        ];
        for response in responses {
            let bytes = encode_broker_transmission(corr.as_bytes(), &queue, &response);
            let mut read = feed(bytes).await;
            let t = read_broker_transmission(read.as_mut()).await.unwrap();
            assert_eq!(t.corr_id, corr.as_bytes());
            assert_eq!(t.queue_id, queue);
            assert_eq!(t.response.unwrap(), response);
        }
    }

    #[test]
    fn error_codes_round_trip_as_text() {
        let codes = [
            ErrorCode::Block,
            ErrorCode::CmdSyntax,
            ErrorCode::CmdProhibited,
            ErrorCode::CmdNoAuth,
            ErrorCode::CmdHasAuth,
            ErrorCode::CmdNoQueue,
            ErrorCode::Auth,
            ErrorCode::Quota,
            ErrorCode::NoMsg,
            ErrorCode::Internal,
        ];
        for code in codes {
            assert_eq!(code.to_string().parse::<ErrorCode>().unwrap(), code);
        }
    }
}
