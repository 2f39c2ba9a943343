//! End-to-end protocol scenarios over in-memory transports.

use relaykit::common::clock::{Clock, ManualClock};
use relaykit::shadowsocks2022::{
    ClientStream as Ss2022ClientStream, Method, PacketClient, PacketService,
    Service as Ss2022Service,
};
use relaykit::vmess::{
    ClientConfig as VmessClientConfig, ClientStream as VmessClientStream, Command, MuxClient,
    MuxServer, User,
};
use relaykit::{Address, Error};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const SS2022_PSK_16: [u8; 16] = [
    0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee,
    0xff,
];
const VMESS_UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

fn test_clock() -> Arc<dyn Clock> {
    init_tracing();
    Arc::new(ManualClock::new(1_700_000_000))
}

/// Honors RUST_LOG so failing scenarios can be re-run with protocol traces.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn ss2022_tcp_echo() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let mut client = Ss2022ClientStream::new(
        client_io,
        Method::Blake3Aes128Gcm,
        vec![SS2022_PSK_16.to_vec()],
        Address::from("example.com"),
        80,
        test_clock(),
    )
    .unwrap();

    let service = Ss2022Service::new(
        Method::Blake3Aes128Gcm,
        vec![SS2022_PSK_16.to_vec()],
        test_clock(),
    )
    .unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, address, port, initial) = service.accept(server_io).await.unwrap();
        assert_eq!(address, Address::from("example.com"));
        assert_eq!(port, 80);
        assert_eq!(&initial[..], b"hello\n");
        stream.write_all(b"HI\n").await.unwrap();
        stream.flush().await.unwrap();
    });

    client.write_all(b"hello\n").await.unwrap();
    client.flush().await.unwrap();
    let mut reply = [0u8; 3];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"HI\n");
    server.await.unwrap();
}

#[tokio::test]
async fn ss2022_replayed_handshake_is_rejected() {
    let service = Ss2022Service::new(
        Method::Blake3Aes128Gcm,
        vec![SS2022_PSK_16.to_vec()],
        test_clock(),
    )
    .unwrap();

    // Record one client handshake off the wire.
    let (client_io, mut tap) = tokio::io::duplex(64 * 1024);
    let mut client = Ss2022ClientStream::new(
        client_io,
        Method::Blake3Aes128Gcm,
        vec![SS2022_PSK_16.to_vec()],
        Address::from("example.com"),
        80,
        test_clock(),
    )
    .unwrap();
    client.write_all(b"hello\n").await.unwrap();
    client.flush().await.unwrap();
    drop(client);
    let mut recorded = Vec::new();
    tap.read_to_end(&mut recorded).await.unwrap();

    let (mut feed, server_io) = tokio::io::duplex(64 * 1024);
    feed.write_all(&recorded).await.unwrap();
    service.accept(server_io).await.unwrap();

    let (mut feed, server_io) = tokio::io::duplex(64 * 1024);
    feed.write_all(&recorded).await.unwrap();
    assert!(matches!(
        service.accept(server_io).await,
        Err(Error::SaltNotUnique)
    ));
}

#[tokio::test]
async fn ss2022_udp_server_rotation_is_rate_limited() {
    let method = Method::Blake3ChaCha20Poly1305;
    let psk = vec![0xaau8; 32];
    let clock = test_clock();

    let mut client = PacketClient::new(method, vec![psk.clone()], clock.clone()).unwrap();
    let service_a = PacketService::new(method, vec![psk.clone()], clock.clone()).unwrap();
    let service_b = PacketService::new(method, vec![psk], clock.clone()).unwrap();

    let destination = Address::from("1.1.1.1");
    let mut query = bytes::BytesMut::new();
    client.encode(&destination, 53, b"dns query", &mut query).unwrap();

    // Both servers answer; each gets its own reply session id.
    let (sid_a, addr_a, port_a, payload_a) = service_a.decode(&query).unwrap();
    assert_eq!(addr_a, destination);
    assert_eq!(port_a, 53);
    assert_eq!(&payload_a[..], b"dns query");
    let (sid_b, _, _, _) = service_b.decode(&query).unwrap();

    let mut reply_a = bytes::BytesMut::new();
    service_a
        .encode(sid_a, &destination, 53, b"answer a", &mut reply_a)
        .unwrap();
    let mut reply_b = bytes::BytesMut::new();
    service_b
        .encode(sid_b, &destination, 53, b"answer b", &mut reply_b)
        .unwrap();

    let (_, _, payload) = client.decode(&reply_a).unwrap();
    assert_eq!(&payload[..], b"answer a");

    // A second server session within the rotation interval is refused.
    assert!(matches!(
        client.decode(&reply_b),
        Err(Error::TooManyServerSessions)
    ));
}

#[tokio::test]
async fn vmess_bulk_round_trip_with_padding() {
    let (client_io, server_io) = tokio::io::duplex(512 * 1024);
    let user = User::parse(VMESS_UUID, 0).unwrap();
    let config = VmessClientConfig {
        global_padding: true,
        ..VmessClientConfig::default()
    };

    let mut client = VmessClientStream::new(
        client_io,
        &user,
        &config,
        Command::Tcp,
        Some(Address::from("203.0.113.9")),
        443,
        test_clock(),
    )
    .unwrap();

    let service = relaykit::vmess::Service::new(vec![user], test_clock());
    let payload: Vec<u8> = (0..50 * 1024u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let server = tokio::spawn(async move {
        let (mut stream, request) = service.accept(server_io).await.unwrap();
        assert_eq!(request.command, Command::Tcp);
        assert_eq!(request.port, 443);
        let mut body = vec![0u8; expected.len()];
        stream.read_exact(&mut body).await.unwrap();
        assert_eq!(body, expected);
        stream.write_all(&body).await.unwrap();
        stream.flush().await.unwrap();
    });

    client.write_all(&payload).await.unwrap();
    client.flush().await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, payload);
    server.await.unwrap();
}

#[tokio::test]
async fn vmess_tampered_body_fails_authentication() {
    let user = User::parse(VMESS_UUID, 0).unwrap();
    let config = VmessClientConfig {
        authenticated_length: true,
        ..VmessClientConfig::default()
    };

    let (client_io, mut tap) = tokio::io::duplex(64 * 1024);
    let mut client = VmessClientStream::new(
        client_io,
        &user,
        &config,
        Command::Tcp,
        Some(Address::from("example.com")),
        80,
        test_clock(),
    )
    .unwrap();
    client.write_all(b"sensitive payload").await.unwrap();
    client.flush().await.unwrap();
    drop(client);
    let mut recorded = Vec::new();
    tap.read_to_end(&mut recorded).await.unwrap();

    // Flip one bit inside the body chunk; the handshake stays intact.
    let last = recorded.len() - 1;
    recorded[last] ^= 0x40;

    let service = relaykit::vmess::Service::new(vec![user], test_clock());
    let (mut feed, server_io) = tokio::io::duplex(64 * 1024);
    feed.write_all(&recorded).await.unwrap();

    let (mut stream, _) = service.accept(server_io).await.unwrap();
    let mut body = [0u8; 17];
    let err = stream.read_exact(&mut body).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}

#[tokio::test]
async fn vmess_mux_streams_interleave() {
    use async_trait::async_trait;
    use relaykit::vmess::mux::{Network, SessionIo, StreamHandler};

    struct EchoHandler;

    #[async_trait]
    impl StreamHandler for EchoHandler {
        async fn open(
            &self,
            _network: Network,
            _address: Address,
            _port: u16,
        ) -> relaykit::Result<Box<dyn SessionIo>> {
            let (near, far) = tokio::io::duplex(64 * 1024);
            tokio::spawn(async move {
                let (mut r, mut w) = tokio::io::split(far);
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
            Ok(Box::new(near))
        }
    }

    // Mini-mux frames tunneled through a full VMess record layer.
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let user = User::parse(VMESS_UUID, 0).unwrap();
    let client_stream = VmessClientStream::new(
        client_io,
        &user,
        &VmessClientConfig::default(),
        Command::Mux,
        None,
        0,
        test_clock(),
    )
    .unwrap();

    let service = relaykit::vmess::Service::new(vec![user], test_clock());
    tokio::spawn(async move {
        let (stream, request) = service.accept(server_io).await.unwrap();
        assert_eq!(request.command, Command::Mux);
        MuxServer::new(EchoHandler).serve(stream).await.unwrap();
    });

    let mux = MuxClient::new(client_stream);
    let mut first = mux
        .open(Network::Tcp, Address::from("10.0.0.1"), 80)
        .unwrap();
    let mut second = mux
        .open(Network::Tcp, Address::from("10.0.0.2"), 80)
        .unwrap();

    first.write_all(b"first stream").await.unwrap();
    second.write_all(b"second stream").await.unwrap();

    let mut buf2 = [0u8; 13];
    second.read_exact(&mut buf2).await.unwrap();
    assert_eq!(&buf2, b"second stream");
    let mut buf1 = [0u8; 12];
    first.read_exact(&mut buf1).await.unwrap();
    assert_eq!(&buf1, b"first stream");

    // Closing one stream leaves the other usable.
    first.shutdown().await.unwrap();
    drop(first);
    second.write_all(b"still here").await.unwrap();
    let mut buf3 = [0u8; 10];
    second.read_exact(&mut buf3).await.unwrap();
    assert_eq!(&buf3, b"still here");
}
