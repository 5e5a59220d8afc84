//! Server addresses and queue invitations.
//!
//! A broker address names a host, an optional port and the base64url
//! SHA-256 fingerprint of the broker's certificate SPKI. The canonical
//! rendering is the URI form `smp://<key_hash>@<host>[:<port>]`; the bare
//! `host[:port][#key_hash]` form is accepted on parse for convenience.
//!
//! A queue invitation bundles everything a joining party needs to reach a
//! receive queue as its sender: `smp::<server>::<sender_id>::<enc_key>`.

use std::fmt;
use thiserror::Error;

use crate::crypto::EncKey;
use crate::defaults;
use crate::encoding;
use crate::protocol::EntityId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid server address")]
pub struct BadServerAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid queue invitation")]
pub struct BadQueueInfo;

/// Address of an SMP broker.
///
/// `key_hash` is the SHA-256 of the broker certificate's SPKI; when absent
/// the broker is untrusted (test mode only).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SmpServer {
    pub host: String,
    pub port: Option<u16>,
    pub key_hash: Option<Vec<u8>>,
}

impl SmpServer {
    pub fn new(host: impl Into<String>, port: Option<u16>, key_hash: Option<Vec<u8>>) -> Self {
        Self {
            host: host.into(),
            port,
            key_hash,
        }
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(defaults::SMP_PORT)
    }

    /// Parse either the URI form or the bare `host[:port][#key_hash]` form.
    pub fn parse(s: &str) -> Result<Self, BadServerAddress> {
        let s = s.strip_prefix("smp://").unwrap_or(s);
        if s.is_empty() {
            return Err(BadServerAddress);
        }

        let (key_hash, host_port) = if let Some((hash, rest)) = s.split_once('@') {
            (decode_key_hash(hash)?, rest)
        } else if let Some((rest, hash)) = s.split_once('#') {
            (decode_key_hash(hash)?, rest)
        } else {
            (None, s)
        };

        let (host, port) = match host_port.split_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| BadServerAddress)?;
                (host, Some(port))
            }
            None => (host_port, None),
        };
        if host.is_empty() {
            return Err(BadServerAddress);
        }
        Ok(Self::new(host, port, key_hash))
    }
}

fn decode_key_hash(s: &str) -> Result<Option<Vec<u8>>, BadServerAddress> {
    if s.is_empty() {
        return Ok(None);
    }
    let hash = encoding::b64url_decode(s).map_err(|_| BadServerAddress)?;
    if hash.len() != 32 {
        return Err(BadServerAddress);
    }
    Ok(Some(hash))
}

impl fmt::Display for SmpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "smp://")?;
        if let Some(hash) = &self.key_hash {
            write!(f, "{}@", encoding::b64url_encode(hash))?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for SmpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SmpServer({self})")
    }
}

/// Out-of-band invitation: the credentials needed to send to a queue.
#[derive(Clone, PartialEq, Debug)]
pub struct SmpQueueInfo {
    pub server: SmpServer,
    pub sender_id: EntityId,
    pub enc_key: EncKey,
}

impl SmpQueueInfo {
    pub fn parse(s: &str) -> Result<Self, BadQueueInfo> {
        let mut parts = s.split("::");
        if parts.next() != Some("smp") {
            return Err(BadQueueInfo);
        }
        let server = parts.next().ok_or(BadQueueInfo)?;
        let sender_id = parts.next().ok_or(BadQueueInfo)?;
        let enc_key = parts.next().ok_or(BadQueueInfo)?;
        if parts.next().is_some() {
            return Err(BadQueueInfo);
        }
        Ok(Self {
            server: SmpServer::parse(server).map_err(|_| BadQueueInfo)?,
            sender_id: EntityId::decode(sender_id).map_err(|_| BadQueueInfo)?,
            enc_key: EncKey::decode(enc_key).map_err(|_| BadQueueInfo)?,
        })
    }
}

impl fmt::Display for SmpQueueInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "smp::{}::{}::{}",
            self.server,
            self.sender_id.encoded(),
            self.enc_key.encoded()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncKeyPair;

    fn hash() -> Vec<u8> {
        vec![7u8; 32]
    }

    #[test]
    fn parses_uri_form() {
        let encoded = encoding::b64url_encode(&hash());
        let addr = SmpServer::parse(&format!("smp://{encoded}@broker.example:5223")).unwrap();
        assert_eq!(addr.host, "broker.example");
        assert_eq!(addr.port, Some(5223));
        assert_eq!(addr.key_hash, Some(hash()));
    }

    #[test]
    fn parses_bare_form_with_fragment_hash() {
        let encoded = encoding::b64url_encode(&hash());
        let addr = SmpServer::parse(&format!("broker.example#{encoded}")).unwrap();
        assert_eq!(addr.host, "broker.example");
        assert_eq!(addr.port, None);
        assert_eq!(addr.key_hash, Some(hash()));
    }

    #[test]
    fn untrusted_address_has_no_hash() {
        let addr = SmpServer::parse("smp://localhost:7001").unwrap();
        assert_eq!(addr.key_hash, None);
        assert_eq!(addr.port_or_default(), 7001);
    }

    #[test]
    fn display_round_trips() {
        for input in [
            SmpServer::new("broker.example", Some(443), Some(hash())),
            SmpServer::new("localhost", None, None),
        ] {
            assert_eq!(SmpServer::parse(&input.to_string()).unwrap(), input);
        }
    }

    #[test]
    fn rejects_bad_addresses() {
        assert!(SmpServer::parse("").is_err());
        assert!(SmpServer::parse("smp://").is_err());
        assert!(SmpServer::parse("host:notaport").is_err());
        assert!(SmpServer::parse("smp://nothash@host").is_err());
    }

    #[test]
    fn queue_info_round_trips() {
        let info = SmpQueueInfo {
            server: SmpServer::new("broker.example", Some(5223), Some(hash())),
            sender_id: EntityId::generate(),
            enc_key: EncKeyPair::generate().public(),
        };
        let parsed = SmpQueueInfo::parse(&info.to_string()).unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn rejects_malformed_queue_info() {
        assert!(SmpQueueInfo::parse("smp::only::three").is_err());
        assert!(SmpQueueInfo::parse("xmp::a::b::c").is_err());
    }
}
