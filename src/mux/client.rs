//! Client-side connection pool
//!
//! The pool grows on demand: a stream request goes to an existing
//! connection while it has capacity, otherwise a new connection is
//! dialed. A failed open is retried once on a fresh connection before
//! the error surfaces.

use super::protocol::{Handshake, Protocol, StreamRequest, StreamResponse, VERSION_PADDED, VERSION_PLAIN};
use super::session::{MuxSession, MuxStream};
use super::MuxIo;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const DEFAULT_MIN_STREAMS: usize = 8;

/// Dials the underlying transport for new pool connections.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self) -> Result<Box<dyn MuxIo>>;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub protocol: Protocol,
    pub padding: bool,
    /// With `max_connections` set, a connection below this many streams
    /// keeps taking new requests even when the pool could still grow.
    pub min_streams: usize,
    /// Hard per-connection stream cap; zero disables it.
    pub max_streams: usize,
    /// Cap on pooled connections; zero means unlimited.
    pub max_connections: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            protocol: Protocol::Smux,
            padding: false,
            min_streams: DEFAULT_MIN_STREAMS,
            max_streams: 0,
            max_connections: 0,
        }
    }
}

pub struct Client<D> {
    dialer: D,
    config: ClientConfig,
    sessions: Mutex<Vec<Arc<MuxSession>>>,
}

impl<D: Dialer> Client<D> {
    pub fn new(dialer: D, config: ClientConfig) -> Result<Self> {
        if config.protocol != Protocol::Smux {
            return Err(Error::protocol(format!(
                "Unsupported mux protocol: {:?}",
                config.protocol
            )));
        }
        Ok(Client {
            dialer,
            config,
            sessions: Mutex::new(Vec::new()),
        })
    }

    /// Open a logical stream for `request`.
    pub async fn open_stream(&self, request: &StreamRequest) -> Result<MuxStream> {
        let session = self.offer().await?;
        match open_on(&session, request).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                debug!("mux open failed, retrying on a fresh connection: {}", e);
                self.remove_session(&session);
                let session = self.connect().await?;
                open_on(&session, request).await
            }
        }
    }

    pub fn num_connections(&self) -> usize {
        let mut sessions = self.sessions.lock();
        sessions.retain(|s| !s.is_closed());
        sessions.len()
    }

    /// Pick a connection for the next stream, dialing when no pooled
    /// connection should take it.
    async fn offer(&self) -> Result<Arc<MuxSession>> {
        {
            let mut sessions = self.sessions.lock();
            sessions.retain(|s| !s.is_closed());
            let candidate = sessions
                .iter()
                .filter(|s| self.can_take_new_request(s))
                .min_by_key(|s| s.num_streams())
                .cloned();
            if let Some(session) = candidate {
                let streams = session.num_streams();
                if streams == 0 {
                    return Ok(session);
                }
                if self.config.max_connections > 0 {
                    if sessions.len() >= self.config.max_connections
                        || streams < self.config.min_streams
                    {
                        return Ok(session);
                    }
                } else if self.config.max_streams > 0 && streams < self.config.max_streams {
                    return Ok(session);
                }
            }
        }
        self.connect().await
    }

    fn can_take_new_request(&self, session: &MuxSession) -> bool {
        self.config.max_streams == 0 || session.num_streams() < self.config.max_streams
    }

    async fn connect(&self) -> Result<Arc<MuxSession>> {
        let mut transport = self.dialer.dial().await?;
        let version = if self.config.padding {
            VERSION_PADDED
        } else {
            VERSION_PLAIN
        };
        let handshake = Handshake {
            version,
            protocol: self.config.protocol,
            padding: self.config.padding,
        };
        let mut buf = BytesMut::new();
        handshake.encode(&mut buf)?;
        transport.write_all(&buf).await?;
        transport.flush().await?;

        let session = MuxSession::client(transport);
        self.sessions.lock().push(session.clone());
        Ok(session)
    }

    fn remove_session(&self, session: &Arc<MuxSession>) {
        self.sessions.lock().retain(|s| !Arc::ptr_eq(s, session));
    }
}

async fn open_on(session: &MuxSession, request: &StreamRequest) -> Result<MuxStream> {
    let mut stream = session.open()?;
    let mut buf = BytesMut::new();
    request.encode(&mut buf)?;
    stream.write_all(&buf).await?;
    match StreamResponse::read(&mut stream).await? {
        StreamResponse::Success => Ok(stream),
        StreamResponse::Failure(message) => Err(Error::peer(message)),
    }
}
