
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use harness::{exchange, local_socket_policy, Behavior, RouterHandle, TestBackend};
use snirelay_ingress::proxy::PROXY_V2_SIGNATURE;
use snirelay_ingress::{BackendPolicy, ProxyProtocol, ServerConfig};
use snirelay_networking::AllowList;
use snirelay_testing::ClientHelloBuilder;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn hello(name: &str) -> Vec<u8> {
    ClientHelloBuilder::new().server_name(name).build()
}

#[tokio::test]
async fn client_hello_replayed_then_half_close_propagates() {
    let dir = tempfile::tempdir().unwrap();
    let backend = TestBackend::spawn_unix(dir.path(), "app1", Behavior::Record)
        .await
        .unwrap();
    let router = RouterHandle::spawn(ServerConfig::default(), local_socket_policy(dir.path()))
        .await
        .unwrap();

    let mut sent = hello("app1");
    sent.extend_from_slice(b"application bytes");

    // Backend only answers after seeing EOF, so the answer proves the
    // client's half-close reached it while the other direction stayed open.
    let response = timeout(TEST_TIMEOUT, exchange(router.addr, &sent))
        .await
        .expect("timeout")
        .unwrap();
    assert_eq!(response, b"ack");
    assert_eq!(backend.first_recording().await, sent);

    router.wait_closed(1).await;
    assert_eq!(
        router.stats().bytes_to_backend.load(Ordering::Relaxed),
        sent.len() as u64
    );
    assert_eq!(router.stats().bytes_from_backend.load(Ordering::Relaxed), 3);
}

#[tokio::test]
async fn fragmented_client_hello_is_reassembled() {
    let dir = tempfile::tempdir().unwrap();
    let _backend = TestBackend::spawn_unix(dir.path(), "frag.test", Behavior::Echo)
        .await
        .unwrap();
    let router = RouterHandle::spawn(ServerConfig::default(), local_socket_policy(dir.path()))
        .await
        .unwrap();

    let sent = ClientHelloBuilder::new()
        .server_name("frag.test")
        .fragment(7)
        .build();

    let mut stream = TcpStream::connect(router.addr).await.unwrap();
    for chunk in sent.chunks(10) {
        stream.write_all(chunk).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    stream.shutdown().await.unwrap();

    let mut echoed = Vec::new();
    timeout(TEST_TIMEOUT, stream.read_to_end(&mut echoed))
        .await
        .expect("timeout")
        .unwrap();
    assert_eq!(echoed, sent);
}

#[tokio::test]
async fn proxy_v2_header_precedes_client_hello() {
    let dir = tempfile::tempdir().unwrap();
    let backend = TestBackend::spawn_unix(dir.path(), "app1", Behavior::Record)
        .await
        .unwrap();
    let config = ServerConfig {
        proxy_protocol: ProxyProtocol::V2,
        ..Default::default()
    };
    let router = RouterHandle::spawn(config, local_socket_policy(dir.path()))
        .await
        .unwrap();

    let mut stream = TcpStream::connect(router.addr).await.unwrap();
    let client_addr = stream.local_addr().unwrap();
    let sent = hello("app1");
    stream.write_all(&sent).await.unwrap();
    stream.shutdown().await.unwrap();
    let mut response = Vec::new();
    timeout(TEST_TIMEOUT, stream.read_to_end(&mut response))
        .await
        .expect("timeout")
        .unwrap();
    assert_eq!(response, b"ack");

    let recorded = backend.first_recording().await;
    assert_eq!(&recorded[..12], &PROXY_V2_SIGNATURE);
    assert_eq!(recorded[12], 0x21);
    assert_eq!(recorded[13], 0x11);
    let addr_len = u16::from_be_bytes([recorded[14], recorded[15]]) as usize;
    assert_eq!(addr_len, 12);

    let addrs = &recorded[16..16 + addr_len];
    let src = SocketAddr::new(
        std::net::Ipv4Addr::new(addrs[0], addrs[1], addrs[2], addrs[3]).into(),
        u16::from_be_bytes([addrs[8], addrs[9]]),
    );
    let dst = SocketAddr::new(
        std::net::Ipv4Addr::new(addrs[4], addrs[5], addrs[6], addrs[7]).into(),
        u16::from_be_bytes([addrs[10], addrs[11]]),
    );
    assert_eq!(src, client_addr);
    assert_eq!(dst, router.addr);
    assert_eq!(&recorded[16 + addr_len..], &sent[..]);
}

#[tokio::test]
async fn proxy_v1_header_precedes_client_hello() {
    let dir = tempfile::tempdir().unwrap();
    let backend = TestBackend::spawn_unix(dir.path(), "app1", Behavior::Record)
        .await
        .unwrap();
    let config = ServerConfig {
        proxy_protocol: ProxyProtocol::V1,
        ..Default::default()
    };
    let router = RouterHandle::spawn(config, local_socket_policy(dir.path()))
        .await
        .unwrap();

    let mut stream = TcpStream::connect(router.addr).await.unwrap();
    let client_addr = stream.local_addr().unwrap();
    let sent = hello("app1");
    stream.write_all(&sent).await.unwrap();
    stream.shutdown().await.unwrap();
    let mut response = Vec::new();
    timeout(TEST_TIMEOUT, stream.read_to_end(&mut response))
        .await
        .expect("timeout")
        .unwrap();

    let recorded = backend.first_recording().await;
    let line = format!(
        "PROXY TCP4 {} {} {} {}\r\n",
        client_addr.ip(),
        router.addr.ip(),
        client_addr.port(),
        router.addr.port()
    );
    assert_eq!(&recorded[..line.len()], line.as_bytes());
    assert_eq!(&recorded[line.len()..], &sent[..]);
}

#[tokio::test]
async fn disallowed_address_is_never_dialed() {
    let (backend, backend_addr) = TestBackend::spawn_tcp(Behavior::Record).await.unwrap();
    let policy = BackendPolicy::RestrictedDirect {
        port: backend_addr.port(),
        allow: AllowList::from_cidrs(&["10.0.0.0/8"]).unwrap(),
    };
    let router = RouterHandle::spawn(ServerConfig::default(), policy)
        .await
        .unwrap();

    let response = timeout(TEST_TIMEOUT, exchange(router.addr, &hello("127.0.0.1")))
        .await
        .expect("timeout")
        .unwrap();
    assert!(response.is_empty());

    router.wait_closed(1).await;
    assert_eq!(router.stats().backend_failed.load(Ordering::Relaxed), 1);
    assert_eq!(backend.connection_count(), 0);
}

#[tokio::test]
async fn allowed_address_is_dialed_on_fixed_port() {
    let (backend, backend_addr) = TestBackend::spawn_tcp(Behavior::Record).await.unwrap();
    let policy = BackendPolicy::RestrictedDirect {
        port: backend_addr.port(),
        allow: AllowList::from_cidrs(&["127.0.0.0/8"]).unwrap(),
    };
    let router = RouterHandle::spawn(ServerConfig::default(), policy)
        .await
        .unwrap();

    let sent = hello("127.0.0.1");
    let response = timeout(TEST_TIMEOUT, exchange(router.addr, &sent))
        .await
        .expect("timeout")
        .unwrap();
    assert_eq!(response, b"ack");
    assert_eq!(backend.first_recording().await, sent);
}

#[tokio::test]
async fn path_traversal_hostname_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let inner = dir.path().join("sockets");
    std::fs::create_dir(&inner).unwrap();
    // A socket one level up that a traversal would reach.
    let outside = TestBackend::spawn_unix(dir.path(), "escape", Behavior::Record)
        .await
        .unwrap();

    let router = RouterHandle::spawn(ServerConfig::default(), local_socket_policy(&inner))
        .await
        .unwrap();

    let response = timeout(TEST_TIMEOUT, exchange(router.addr, &hello("../escape")))
        .await
        .expect("timeout")
        .unwrap();
    assert!(response.is_empty());
    assert_eq!(outside.connection_count(), 0);
}

#[tokio::test]
async fn non_tls_client_is_closed_silently() {
    let dir = tempfile::tempdir().unwrap();
    let router = RouterHandle::spawn(ServerConfig::default(), local_socket_policy(dir.path()))
        .await
        .unwrap();

    // Exactly one record header's worth, so closing leaves nothing unread.
    let response = timeout(TEST_TIMEOUT, exchange(router.addr, b"GET /"))
        .await
        .expect("timeout")
        .unwrap();
    assert!(response.is_empty());

    router.wait_closed(1).await;
    assert_eq!(router.stats().sniff_failed.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn stalled_client_hello_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        sni: snirelay_ingress::SniConfig {
            timeout: Duration::from_millis(100),
            ..Default::default()
        },
        ..Default::default()
    };
    let router = RouterHandle::spawn(config, local_socket_policy(dir.path()))
        .await
        .unwrap();

    let sent = hello("app1");
    let mut stream = TcpStream::connect(router.addr).await.unwrap();
    // Half a ClientHello, then silence.
    stream.write_all(&sent[..sent.len() / 2]).await.unwrap();

    let mut rest = Vec::new();
    timeout(TEST_TIMEOUT, stream.read_to_end(&mut rest))
        .await
        .expect("router should close after the sniff timeout")
        .unwrap();
    assert!(rest.is_empty());

    router.wait_closed(1).await;
    assert_eq!(router.stats().sniff_failed.load(Ordering::Relaxed), 1);
}
