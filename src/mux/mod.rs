//! Transport-level stream multiplexing
//!
//! Carries many logical streams over one underlying connection. A
//! short handshake names the framing backend (only smux is
//! implemented) and optional padding; each stream then opens with a
//! request naming its destination. The connection is usually dialed
//! against the reserved destination [`MUX_DESTINATION`].

pub mod client;
pub mod protocol;
pub mod server;
pub mod session;

pub use client::{Client, ClientConfig, Dialer};
pub use protocol::{
    Handshake, PacketAddrConn, PacketConn, Protocol, StreamRequest, StreamResponse,
    MUX_DESTINATION, MUX_DESTINATION_PORT,
};
pub use server::{Server, StreamHandler};
pub use session::{MuxSession, MuxStream};

use tokio::io::{AsyncRead, AsyncWrite};

/// Boxable transport or backend stream
pub trait MuxIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> MuxIo for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::net::Address;
    use crate::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    struct EchoHandler;

    #[async_trait]
    impl StreamHandler for EchoHandler {
        async fn connect(&self, request: &StreamRequest) -> Result<Box<dyn MuxIo>> {
            if request.port == 1 {
                return Err(crate::Error::protocol("port unreachable"));
            }
            let (near, far) = tokio::io::duplex(64 * 1024);
            tokio::spawn(async move {
                let (mut r, mut w) = tokio::io::split(far);
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
            Ok(Box::new(near))
        }
    }

    struct ChannelDialer {
        transports: mpsc::UnboundedSender<tokio::io::DuplexStream>,
        dials: AtomicUsize,
    }

    impl ChannelDialer {
        fn new() -> (Self, mpsc::UnboundedReceiver<tokio::io::DuplexStream>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                ChannelDialer {
                    transports: tx,
                    dials: AtomicUsize::new(0),
                },
                rx,
            )
        }
    }

    #[async_trait]
    impl Dialer for ChannelDialer {
        async fn dial(&self) -> Result<Box<dyn MuxIo>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let (near, far) = tokio::io::duplex(256 * 1024);
            self.transports
                .send(far)
                .map_err(|_| crate::Error::StreamClosed)?;
            Ok(Box::new(near))
        }
    }

    fn spawn_server(mut transports: mpsc::UnboundedReceiver<tokio::io::DuplexStream>) {
        tokio::spawn(async move {
            let server = Arc::new(Server::new(EchoHandler));
            while let Some(transport) = transports.recv().await {
                let server = server.clone();
                tokio::spawn(async move {
                    let _ = server.serve(transport).await;
                });
            }
        });
    }

    #[tokio::test]
    async fn test_stream_through_pool() {
        let (dialer, transports) = ChannelDialer::new();
        spawn_server(transports);
        let client = Client::new(dialer, ClientConfig::default()).unwrap();

        let mut stream = client
            .open_stream(&StreamRequest::tcp(Address::from("example.com"), 80))
            .await
            .unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");
        assert_eq!(client.num_connections(), 1);
    }

    #[tokio::test]
    async fn test_padded_handshake() {
        let (dialer, transports) = ChannelDialer::new();
        spawn_server(transports);
        let client = Client::new(
            dialer,
            ClientConfig {
                padding: true,
                ..ClientConfig::default()
            },
        )
        .unwrap();

        let mut stream = client
            .open_stream(&StreamRequest::tcp(Address::from("example.com"), 80))
            .await
            .unwrap();
        stream.write_all(b"padded").await.unwrap();
        let mut reply = [0u8; 6];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"padded");
    }

    #[tokio::test]
    async fn test_pool_grows_past_min_streams() {
        let (dialer, transports) = ChannelDialer::new();
        spawn_server(transports);
        let client = Client::new(
            dialer,
            ClientConfig {
                min_streams: 1,
                max_connections: 2,
                ..ClientConfig::default()
            },
        )
        .unwrap();

        let first = client
            .open_stream(&StreamRequest::tcp(Address::from("example.com"), 80))
            .await
            .unwrap();
        let second = client
            .open_stream(&StreamRequest::tcp(Address::from("example.com"), 81))
            .await
            .unwrap();
        assert_eq!(client.num_connections(), 2);
        drop(first);
        drop(second);
    }

    #[tokio::test]
    async fn test_max_connections_reuses_busy_session() {
        let (dialer, transports) = ChannelDialer::new();
        spawn_server(transports);
        let client = Client::new(
            dialer,
            ClientConfig {
                min_streams: 1,
                max_connections: 1,
                ..ClientConfig::default()
            },
        )
        .unwrap();

        let _first = client
            .open_stream(&StreamRequest::tcp(Address::from("example.com"), 80))
            .await
            .unwrap();
        let _second = client
            .open_stream(&StreamRequest::tcp(Address::from("example.com"), 81))
            .await
            .unwrap();
        assert_eq!(client.num_connections(), 1);
    }

    #[tokio::test]
    async fn test_backend_failure_surfaces() {
        let (dialer, transports) = ChannelDialer::new();
        spawn_server(transports);
        let client = Client::new(dialer, ClientConfig::default()).unwrap();

        let Err(err) = client
            .open_stream(&StreamRequest::tcp(Address::from("example.com"), 1))
            .await
        else {
            panic!("dial to an unreachable port succeeded");
        };
        assert!(err.to_string().contains("port unreachable"));
    }

    #[tokio::test]
    async fn test_non_smux_protocol_rejected() {
        let (dialer, _transports) = ChannelDialer::new();
        assert!(Client::new(
            dialer,
            ClientConfig {
                protocol: Protocol::Yamux,
                ..ClientConfig::default()
            },
        )
        .is_err());
    }
}
