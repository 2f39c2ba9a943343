//! Server side of a multiplexed connection

use super::protocol::{Handshake, Protocol, StreamRequest, StreamResponse};
use super::session::MuxSession;
use super::MuxIo;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Dials one backend per accepted stream.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    async fn connect(&self, request: &StreamRequest) -> Result<Box<dyn MuxIo>>;
}

pub struct Server<H> {
    handler: Arc<H>,
}

impl<H: StreamHandler> Server<H> {
    pub fn new(handler: H) -> Self {
        Server {
            handler: Arc::new(handler),
        }
    }

    /// Run one multiplexed connection until its transport closes.
    pub async fn serve<S>(&self, mut transport: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let handshake = Handshake::read(&mut transport).await?;
        if handshake.protocol != Protocol::Smux {
            return Err(Error::protocol(format!(
                "Unsupported mux protocol: {:?}",
                handshake.protocol
            )));
        }

        let session = MuxSession::server(transport);
        while let Some(mut stream) = session.accept().await {
            let handler = self.handler.clone();
            tokio::spawn(async move {
                let request = match StreamRequest::read(&mut stream).await {
                    Ok(request) => request,
                    Err(e) => {
                        debug!("bad mux stream request: {}", e);
                        return;
                    }
                };
                match handler.connect(&request).await {
                    Ok(mut backend) => {
                        let mut buf = BytesMut::new();
                        if StreamResponse::Success.encode(&mut buf).is_err()
                            || stream.write_all(&buf).await.is_err()
                        {
                            return;
                        }
                        let _ = tokio::io::copy_bidirectional(&mut stream, &mut backend).await;
                    }
                    Err(e) => {
                        debug!("mux backend dial failed: {}", e);
                        let mut buf = BytesMut::new();
                        if StreamResponse::Failure(e.to_string()).encode(&mut buf).is_ok() {
                            let _ = stream.write_all(&buf).await;
                        }
                        let _ = stream.shutdown().await;
                    }
                }
            });
        }
        Ok(())
    }
}
