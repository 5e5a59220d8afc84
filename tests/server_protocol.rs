//! Broker integration scenarios: the full queue lifecycle, authorization
//! refusals, quota handling and subscriber takeover, all against an
//! in-process broker on an ephemeral port with a freshly minted
//! certificate.

use std::time::Duration;

use smq::crypto::SignKeyPair;
use smq::protocol::{
    encode_client_transmission, read_broker_transmission, BrokerResponse, ClientCommand, EntityId,
    ErrorCode,
};
use smq::server::{Server, ServerConfig};
use smq::transport::{self, BoxedRead, BoxedWrite, TransportWrite};
use smq::SmpServer;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn start_broker(quota: usize, ws: bool) -> (SmpServer, Option<std::net::SocketAddr>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, cert.cert.pem()).unwrap();
    std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();

    let config = ServerConfig {
        tcp_port: 0,
        ws_port: if ws { Some(0) } else { None },
        tls_certificate_file: cert_path,
        tls_private_key_file: key_path,
        sqlite_database: dir.path().join("queues.db"),
        message_quota_per_queue: quota,
        max_active_queues: 1024,
        log_level: "info".to_string(),
        log_file: None,
    };
    let server = Server::bind(&config).await.unwrap();
    let address = server.smp_address();
    let ws_addr = server.ws_local_addr();
    tokio::spawn(server.run());
    (address, ws_addr, dir)
}

struct TestClient {
    read: BoxedRead,
    write: BoxedWrite,
}

impl TestClient {
    async fn connect(server: &SmpServer) -> Self {
        let (read, write) = transport::tls::connect(server).await.unwrap();
        Self { read, write }
    }

    /// Send one command and wait for the correlated response; pushed MSG
    /// and END transmissions arriving in between fail the test.
    async fn request(
        &mut self,
        signer: Option<&SignKeyPair>,
        queue: &EntityId,
        command: &ClientCommand,
    ) -> BrokerResponse {
        let corr = EntityId::generate();
        let bytes = encode_client_transmission(signer, corr.as_bytes(), queue, command);
        self.write.put_bytes(&bytes).await.unwrap();

        let t = timeout(WAIT, read_broker_transmission(self.read.as_mut()))
            .await
            .expect("response in time")
            .expect("transport alive");
        assert_eq!(t.corr_id, corr.as_bytes(), "correlation id echo");
        t.response.expect("parseable response")
    }

    /// Wait for a pushed transmission (empty correlation id).
    async fn push(&mut self) -> (EntityId, BrokerResponse) {
        let t = timeout(WAIT, read_broker_transmission(self.read.as_mut()))
            .await
            .expect("push in time")
            .expect("transport alive");
        assert!(t.corr_id.is_empty(), "pushes carry no correlation id");
        (t.queue_id, t.response.expect("parseable push"))
    }

    /// Assert that nothing arrives for a little while.
    async fn expect_silence(&mut self) {
        let result = timeout(
            Duration::from_millis(300),
            read_broker_transmission(self.read.as_mut()),
        )
        .await;
        assert!(result.is_err(), "expected no transmission");
    }
}

fn expect_ids(response: BrokerResponse) -> (EntityId, EntityId) {
    match response {
        BrokerResponse::Ids {
            recipient_id,
            sender_id,
        } => (recipient_id, sender_id),
        other => panic!("expected IDS, got {other:?}"),
    }
}

/// S1: NEW / KEY / SEND / SUB / MSG / ACK, then an empty queue.
#[tokio::test]
async fn full_queue_lifecycle() {
    let (address, _, _dir) = start_broker(16, false).await;
    let recipient_keys = SignKeyPair::generate();
    let sender_keys = SignKeyPair::generate();

    let mut recipient = TestClient::connect(&address).await;
    let mut sender = TestClient::connect(&address).await;

    let response = recipient
        .request(
            Some(&recipient_keys),
            &EntityId::empty(),
            &ClientCommand::New(recipient_keys.public()),
        )
        .await;
    let (rid, sid) = expect_ids(response);
    assert_eq!(rid.as_bytes().len(), EntityId::SIZE);
    assert_eq!(sid.as_bytes().len(), EntityId::SIZE);
    assert_ne!(rid, sid);

    let response = recipient
        .request(
            Some(&recipient_keys),
            &rid,
            &ClientCommand::Key(sender_keys.public()),
        )
        .await;
    assert_eq!(response, BrokerResponse::Ok);

    let response = sender
        .request(
            Some(&sender_keys),
            &sid,
            &ClientCommand::Send(b"hello".to_vec()),
        )
        .await;
    assert_eq!(response, BrokerResponse::Ok);

    let response = recipient
        .request(Some(&recipient_keys), &rid, &ClientCommand::Sub)
        .await;
    assert_eq!(response, BrokerResponse::Ok);

    let (queue, push) = recipient.push().await;
    assert_eq!(queue, rid);
    match push {
        BrokerResponse::Msg { msg_id, body, .. } => {
            assert_eq!(msg_id, 1);
            assert_eq!(body, b"hello");
        }
        other => panic!("expected MSG, got {other:?}"),
    }

    let response = recipient
        .request(Some(&recipient_keys), &rid, &ClientCommand::Ack)
        .await;
    assert_eq!(response, BrokerResponse::Ok);
    recipient.expect_silence().await;
}

/// The handshake confirmation: an unsigned SEND is accepted only while
/// the queue has no sender key.
#[tokio::test]
async fn unsigned_send_only_before_key() {
    let (address, _, _dir) = start_broker(16, false).await;
    let recipient_keys = SignKeyPair::generate();
    let sender_keys = SignKeyPair::generate();

    let mut recipient = TestClient::connect(&address).await;
    let mut sender = TestClient::connect(&address).await;

    let (rid, sid) = expect_ids(
        recipient
            .request(
                Some(&recipient_keys),
                &EntityId::empty(),
                &ClientCommand::New(recipient_keys.public()),
            )
            .await,
    );

    // unsigned confirmation goes through
    let response = sender
        .request(None, &sid, &ClientCommand::Send(b"confirmation".to_vec()))
        .await;
    assert_eq!(response, BrokerResponse::Ok);

    // once the queue is secured the unsigned path is gone
    recipient
        .request(
            Some(&recipient_keys),
            &rid,
            &ClientCommand::Key(sender_keys.public()),
        )
        .await;
    let response = sender
        .request(None, &sid, &ClientCommand::Send(b"later".to_vec()))
        .await;
    assert_eq!(response, BrokerResponse::Err(ErrorCode::CmdNoAuth));
}

/// S2: commands signed with the wrong key are answered with AUTH, for
/// existing and missing queues alike.
#[tokio::test]
async fn wrong_signature_is_auth_error() {
    let (address, _, _dir) = start_broker(16, false).await;
    let recipient_keys = SignKeyPair::generate();
    let mallory_keys = SignKeyPair::generate();

    let mut recipient = TestClient::connect(&address).await;
    let mut mallory = TestClient::connect(&address).await;

    let (rid, sid) = expect_ids(
        recipient
            .request(
                Some(&recipient_keys),
                &EntityId::empty(),
                &ClientCommand::New(recipient_keys.public()),
            )
            .await,
    );

    let response = mallory
        .request(Some(&mallory_keys), &rid, &ClientCommand::Sub)
        .await;
    assert_eq!(response, BrokerResponse::Err(ErrorCode::Auth));

    // secure the queue, then SEND with a wrong key
    recipient
        .request(
            Some(&recipient_keys),
            &rid,
            &ClientCommand::Key(SignKeyPair::generate().public()),
        )
        .await;
    let response = mallory
        .request(
            Some(&mallory_keys),
            &sid,
            &ClientCommand::Send(b"spoof".to_vec()),
        )
        .await;
    assert_eq!(response, BrokerResponse::Err(ErrorCode::Auth));

    // a queue that does not exist answers exactly the same way
    let response = mallory
        .request(Some(&mallory_keys), &EntityId::generate(), &ClientCommand::Sub)
        .await;
    assert_eq!(response, BrokerResponse::Err(ErrorCode::Auth));
}

/// S3: the third SEND bounces off a quota of two; an ACK makes room.
#[tokio::test]
async fn quota_rejects_until_ack() {
    let (address, _, _dir) = start_broker(2, false).await;
    let recipient_keys = SignKeyPair::generate();
    let sender_keys = SignKeyPair::generate();

    let mut recipient = TestClient::connect(&address).await;
    let mut sender = TestClient::connect(&address).await;

    let (rid, sid) = expect_ids(
        recipient
            .request(
                Some(&recipient_keys),
                &EntityId::empty(),
                &ClientCommand::New(recipient_keys.public()),
            )
            .await,
    );
    recipient
        .request(
            Some(&recipient_keys),
            &rid,
            &ClientCommand::Key(sender_keys.public()),
        )
        .await;

    for body in [b"one".to_vec(), b"two".to_vec()] {
        let response = sender
            .request(Some(&sender_keys), &sid, &ClientCommand::Send(body))
            .await;
        assert_eq!(response, BrokerResponse::Ok);
    }
    let response = sender
        .request(
            Some(&sender_keys),
            &sid,
            &ClientCommand::Send(b"three".to_vec()),
        )
        .await;
    assert_eq!(response, BrokerResponse::Err(ErrorCode::Quota));

    // drain one message
    let response = recipient
        .request(Some(&recipient_keys), &rid, &ClientCommand::Sub)
        .await;
    assert_eq!(response, BrokerResponse::Ok);
    let (_, push) = recipient.push().await;
    assert!(matches!(push, BrokerResponse::Msg { msg_id: 1, .. }));
    recipient
        .request(Some(&recipient_keys), &rid, &ClientCommand::Ack)
        .await;

    let response = sender
        .request(
            Some(&sender_keys),
            &sid,
            &ClientCommand::Send(b"three".to_vec()),
        )
        .await;
    assert_eq!(response, BrokerResponse::Ok);
}

/// At-most-one subscriber: the second SUB evicts the first with END, and
/// deliveries follow the new subscriber.
#[tokio::test]
async fn second_subscriber_takes_over() {
    let (address, _, _dir) = start_broker(16, false).await;
    let recipient_keys = SignKeyPair::generate();
    let sender_keys = SignKeyPair::generate();

    let mut session_a = TestClient::connect(&address).await;
    let mut session_b = TestClient::connect(&address).await;
    let mut sender = TestClient::connect(&address).await;

    let (rid, sid) = expect_ids(
        session_a
            .request(
                Some(&recipient_keys),
                &EntityId::empty(),
                &ClientCommand::New(recipient_keys.public()),
            )
            .await,
    );
    session_a
        .request(
            Some(&recipient_keys),
            &rid,
            &ClientCommand::Key(sender_keys.public()),
        )
        .await;

    assert_eq!(
        session_a
            .request(Some(&recipient_keys), &rid, &ClientCommand::Sub)
            .await,
        BrokerResponse::Ok
    );
    assert_eq!(
        session_b
            .request(Some(&recipient_keys), &rid, &ClientCommand::Sub)
            .await,
        BrokerResponse::Ok
    );

    let (queue, push) = session_a.push().await;
    assert_eq!(queue, rid);
    assert_eq!(push, BrokerResponse::End);

    sender
        .request(
            Some(&sender_keys),
            &sid,
            &ClientCommand::Send(b"for-b".to_vec()),
        )
        .await;
    let (_, push) = session_b.push().await;
    assert!(matches!(push, BrokerResponse::Msg { .. }));
    session_a.expect_silence().await;
}

/// OFF makes the queue refuse new messages; DEL removes it entirely.
#[tokio::test]
async fn disable_and_delete() {
    let (address, _, _dir) = start_broker(16, false).await;
    let recipient_keys = SignKeyPair::generate();
    let sender_keys = SignKeyPair::generate();

    let mut recipient = TestClient::connect(&address).await;
    let mut sender = TestClient::connect(&address).await;

    let (rid, sid) = expect_ids(
        recipient
            .request(
                Some(&recipient_keys),
                &EntityId::empty(),
                &ClientCommand::New(recipient_keys.public()),
            )
            .await,
    );
    recipient
        .request(
            Some(&recipient_keys),
            &rid,
            &ClientCommand::Key(sender_keys.public()),
        )
        .await;

    assert_eq!(
        recipient
            .request(Some(&recipient_keys), &rid, &ClientCommand::Off)
            .await,
        BrokerResponse::Ok
    );
    let response = sender
        .request(
            Some(&sender_keys),
            &sid,
            &ClientCommand::Send(b"too late".to_vec()),
        )
        .await;
    assert_eq!(response, BrokerResponse::Err(ErrorCode::Auth));

    assert_eq!(
        recipient
            .request(Some(&recipient_keys), &rid, &ClientCommand::Del)
            .await,
        BrokerResponse::Ok
    );
    // the queue is gone; recipient commands now fail opaquely
    let response = recipient
        .request(Some(&recipient_keys), &rid, &ClientCommand::Sub)
        .await;
    assert_eq!(response, BrokerResponse::Err(ErrorCode::Auth));
}

/// PING works unsigned and without a queue, on TLS and WebSocket alike.
#[tokio::test]
async fn ping_pong_on_both_transports() {
    let (address, ws_addr, _dir) = start_broker(16, true).await;

    let mut tls_client = TestClient::connect(&address).await;
    let response = tls_client
        .request(None, &EntityId::empty(), &ClientCommand::Ping)
        .await;
    assert_eq!(response, BrokerResponse::Pong);

    let ws_addr = ws_addr.expect("ws listener configured");
    let (read, write) = transport::ws::connect("127.0.0.1", ws_addr.port())
        .await
        .unwrap();
    let mut ws_client = TestClient { read, write };
    let response = ws_client
        .request(None, &EntityId::empty(), &ClientCommand::Ping)
        .await;
    assert_eq!(response, BrokerResponse::Pong);
}
