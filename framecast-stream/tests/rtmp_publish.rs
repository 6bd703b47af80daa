//! End-to-end RTMP publish flow against a live listener: handshake,
//! connect, createStream, publish — gated by the stream-key store.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use framecast_core::stream_key::{MemoryKeyValueStore, StreamKeyService};
use framecast_stream::rtmp::amf::{self, AmfValue};
use framecast_stream::rtmp::chunk::{self, msg_type, RtmpMessage};
use framecast_stream::rtmp::handshake;
use framecast_stream::rtmp::{RtmpServer, RtmpServerConfig, StreamKeyAuth, StreamRegistry};

struct Harness {
    addr: std::net::SocketAddr,
    registry: Arc<StreamRegistry>,
    service: Arc<StreamKeyService>,
    store: Arc<MemoryKeyValueStore>,
    token: CancellationToken,
}

async fn start_server() -> Harness {
    let store = Arc::new(MemoryKeyValueStore::new());
    let service = Arc::new(StreamKeyService::new(store.clone(), "test", Some(24)));
    let registry = Arc::new(StreamRegistry::new());
    let server = RtmpServer::new(
        RtmpServerConfig {
            address: "127.0.0.1:0".to_string(),
            app: "live".to_string(),
            max_connections: 16,
        },
        Arc::new(StreamKeyAuth::new(service.clone())),
        registry.clone(),
    );
    let bound = server.bind().await.expect("bind");
    let addr = bound.local_addr().expect("local addr");
    let token = CancellationToken::new();
    let run_token = token.clone();
    tokio::spawn(async move {
        let _ = bound.run(run_token).await;
    });
    Harness { addr, registry, service, store, token }
}

async fn send_command(stream: &mut TcpStream, values: &[AmfValue]) {
    let message = RtmpMessage {
        type_id: msg_type::COMMAND_AMF0,
        stream_id: 0,
        timestamp: 0,
        payload: amf::encode_all(values),
    };
    let wire = chunk::encode_message(3, &message, chunk::DEFAULT_CHUNK_SIZE);
    stream.write_all(&wire).await.expect("send command");
}

async fn connect_and_publish(addr: std::net::SocketAddr, segment: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    handshake::client_handshake(&mut stream).await.expect("handshake");

    send_command(
        &mut stream,
        &[
            AmfValue::String("connect".to_string()),
            AmfValue::Number(1.0),
            amf::object(&[("app", AmfValue::String("live".to_string()))]),
        ],
    )
    .await;
    send_command(
        &mut stream,
        &[
            AmfValue::String("createStream".to_string()),
            AmfValue::Number(2.0),
            AmfValue::Null,
        ],
    )
    .await;
    send_command(
        &mut stream,
        &[
            AmfValue::String("publish".to_string()),
            AmfValue::Number(3.0),
            AmfValue::Null,
            AmfValue::String(segment.to_string()),
            AmfValue::String("live".to_string()),
        ],
    )
    .await;
    stream
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn valid_key_publish_registers_active_stream() {
    let harness = start_server().await;
    let generated = harness
        .service
        .generate("user-1", "stream-1", None, None)
        .await
        .expect("generate key");

    let _stream = connect_and_publish(harness.addr, &generated.key).await;

    let registry = harness.registry.clone();
    let key_hash = generated.key_hash.clone();
    assert!(
        wait_until(move || registry.is_live(&key_hash)).await,
        "publish must register an active stream"
    );
    assert_eq!(harness.registry.active_streams().len(), 1);
    harness.token.cancel();
}

#[tokio::test]
async fn alias_publish_shares_key_identity() {
    let harness = start_server().await;
    let generated = harness
        .service
        .generate("user-1", "stream-1", Some("main-show"), None)
        .await
        .expect("generate key");

    let _stream = connect_and_publish(harness.addr, "main-show").await;

    let registry = harness.registry.clone();
    let key_hash = generated.key_hash.clone();
    assert!(
        wait_until(move || registry.is_live(&key_hash)).await,
        "alias publish must register under the key hash"
    );
    harness.token.cancel();
}

#[tokio::test]
async fn expired_key_publish_is_rejected_with_no_active_stream() {
    let harness = start_server().await;
    // A zero-hour TTL in the server's own store expires immediately.
    let expired_service = StreamKeyService::new(harness.store.clone(), "test", Some(0));
    let generated = expired_service
        .generate("user-1", "stream-1", None, None)
        .await
        .expect("generate key");

    let mut stream = connect_and_publish(harness.addr, &generated.key).await;

    // The session terminates at the protocol level: the socket closes
    // without any error payload.
    let mut buf = vec![0u8; 4096];
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }
    })
    .await
    .is_ok();
    assert!(closed, "server must close the rejected session");
    assert!(harness.registry.active_streams().is_empty());
    harness.token.cancel();
}

#[tokio::test]
async fn unknown_key_publish_is_rejected() {
    let harness = start_server().await;
    let mut stream = connect_and_publish(harness.addr, "no-such-key").await;

    let mut buf = vec![0u8; 4096];
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }
    })
    .await
    .is_ok();
    assert!(closed, "server must close the rejected session");
    assert!(harness.registry.active_streams().is_empty());
    harness.token.cancel();
}

#[tokio::test]
async fn second_publisher_for_same_key_is_rejected() {
    let harness = start_server().await;
    let generated = harness
        .service
        .generate("user-1", "stream-1", None, None)
        .await
        .expect("generate key");

    let _first = connect_and_publish(harness.addr, &generated.key).await;
    let registry = harness.registry.clone();
    let key_hash = generated.key_hash.clone();
    assert!(wait_until(move || registry.is_live(&key_hash)).await);

    let mut second = connect_and_publish(harness.addr, &generated.key).await;
    let mut buf = vec![0u8; 4096];
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match second.read(&mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }
    })
    .await
    .is_ok();
    assert!(closed, "duplicate publisher must be dropped");
    assert_eq!(harness.registry.active_streams().len(), 1);
    harness.token.cancel();
}

#[tokio::test]
async fn media_from_publisher_reaches_registry_subscribers() {
    let harness = start_server().await;
    let generated = harness
        .service
        .generate("user-1", "stream-1", None, None)
        .await
        .expect("generate key");

    let mut stream = connect_and_publish(harness.addr, &generated.key).await;
    let registry = harness.registry.clone();
    let key_hash = generated.key_hash.clone();
    assert!(wait_until({
        let registry = registry.clone();
        let key_hash = key_hash.clone();
        move || registry.is_live(&key_hash)
    })
    .await);

    let (_replay, mut live) = harness
        .registry
        .subscribe_media(&generated.key_hash)
        .expect("subscribe");

    // One video message on stream 1.
    let video = RtmpMessage {
        type_id: msg_type::VIDEO,
        stream_id: 1,
        timestamp: 40,
        payload: Bytes::from_static(&[0x27, 0x01, 0x00, 0x00, 0x00, 0xAB]),
    };
    let wire = chunk::encode_message(5, &video, chunk::DEFAULT_CHUNK_SIZE);
    stream.write_all(&wire).await.expect("send video");

    let frame = tokio::time::timeout(Duration::from_secs(5), live.recv())
        .await
        .expect("frame within deadline")
        .expect("frame");
    assert_eq!(frame.timestamp, 40);
    assert_eq!(frame.payload.len(), 6);
    harness.token.cancel();
}
