//! # SMQ — SMP Message Broker and Connection Agent
//!
//! This library implements the SMP (Simplex Messaging Protocol) stack:
//! a unidirectional message broker that hosts cryptographically protected
//! queues, and an agent that builds bidirectional *connections* for its
//! clients out of pairs of one-way queues on (possibly different) brokers.
//!
//! ## Architecture Overview
//!
//! The stack is layered bottom-up:
//! 1. **Transport** ([`transport`]): framed duplex byte channels — TLS 1.3
//!    over TCP with certificate pinning, or WebSocket binary frames
//! 2. **Wire codec** ([`protocol`]): line-structured transmissions carrying
//!    signed commands, broker responses and agent envelopes
//! 3. **Crypto adaptor** ([`crypto`]): Ed25519 command signatures, sealed
//!    AEAD message bodies, SHA-256 hash chains and key fingerprints
//! 4. **Broker** ([`server`]): per-session command loop over a persistent
//!    queue store with in-memory buffers and push subscriptions
//! 5. **Agent** ([`agent`]): duplex connection state machines, a pooled
//!    broker client with correlation and reconnect, and a SQLite store
//!
//! ## Concurrency Model
//!
//! Everything runs on Tokio. Each accepted session and each outbound broker
//! client is an independent task; tasks communicate only through bounded
//! channels, and per-queue state is serialised behind per-queue locks.

pub mod agent;
pub mod crypto;
pub mod encoding;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod transport;

pub use protocol::address::{SmpQueueInfo, SmpServer};
pub use protocol::{BrokerResponse, ClientCommand, EntityId, ErrorCode};
pub use server::{Server, ServerConfig};

/// The current version of the SMQ crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default protocol and runtime parameters
pub mod defaults {
    use std::time::Duration;

    /// Default TCP port for SMP brokers
    pub const SMP_PORT: u16 = 5223;

    /// Size of queue identifiers and correlation ids, in raw bytes
    pub const ID_SIZE: usize = 24;

    /// Maximum length of one protocol line, in bytes
    pub const MAX_LINE: usize = 16 * 1024;

    /// Maximum message body accepted by the broker
    pub const MSG_MAX_BODY: usize = 16 * 1024;

    /// Maximum client payload accepted by the agent; the difference to
    /// [`MSG_MAX_BODY`] is headroom for the agent envelope and AEAD overhead
    pub const AGENT_MAX_BODY: usize = MSG_MAX_BODY - 512;

    /// Maximum number of buffered messages per queue
    pub const MSG_QUEUE_QUOTA: usize = 128;

    /// Maximum number of active queues per broker
    pub const MAX_ACTIVE_QUEUES: usize = 16 * 1024;

    /// Broker-side read idle timeout; sessions quiet longer than this are
    /// closed
    pub const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

    /// Agent keep-alive interval: a PING is sent on an idle broker client
    pub const PING_INTERVAL: Duration = Duration::from_secs(15);

    /// Agent-side timeout for one correlated broker command
    pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

    /// First reconnect delay of the broker client
    pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

    /// Reconnect delay ceiling
    pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);

    /// Failed reconnect attempts before pending commands are failed with a
    /// broker error (reconnection itself keeps going)
    pub const RECONNECT_NOTIFY_AFTER: u32 = 5;

    /// Attempts to deliver HELLO while the peer has not yet secured the
    /// queue (each failing with AUTH), and the delay between them
    pub const HELLO_RETRIES: u32 = 30;
    pub const HELLO_RETRY_DELAY: Duration = Duration::from_millis(200);

    /// Send retry schedule on QUOTA responses
    pub const QUOTA_RETRIES: u32 = 3;
    pub const QUOTA_RETRY_DELAY: Duration = Duration::from_secs(2);
}
