//! TCP transport.
//!
//! A connected stream is split into two pump tasks:
//! - the reader feeds every chunk into the communicator's inbox, tagged with the
//!   generation the stream was attached under
//! - the writer drains the communicator's outgoing channel into the socket and shuts
//!   the write half down once the communicator stops routing to it

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{BytesCodec, FramedRead, FramedWrite};
use tracing::{debug, instrument, warn};

use crate::communicator::Communicator;
use crate::error::{ProtocolError, Result};
use crate::transport::{Connector, Endpoint};
use crate::utils::timeout::{self, with_timeout_error};

/// Dials a TCP endpoint
#[derive(Debug, Clone)]
pub struct TcpConnector {
    endpoint: Endpoint,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::with_timeout(Endpoint::tcp(host, port), timeout::DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(endpoint: Endpoint, connect_timeout: Duration) -> Self {
        Self {
            endpoint,
            connect_timeout,
        }
    }
}

impl Connector for TcpConnector {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn retarget(&self, target: &Endpoint) -> Result<Arc<dyn Connector>> {
        self.endpoint.ensure_port_only(target)?;
        Ok(Arc::new(Self::with_timeout(target.clone(), self.connect_timeout)))
    }

    fn connect(&self, communicator: Communicator) -> BoxFuture<'static, Result<()>> {
        let endpoint = self.endpoint.clone();
        let connect_timeout = self.connect_timeout;
        Box::pin(async move {
            let stream = with_timeout_error(
                async {
                    TcpStream::connect((endpoint.host.as_str(), endpoint.port))
                        .await
                        .map_err(ProtocolError::from)
                },
                connect_timeout,
            )
            .await?;
            debug!(%endpoint, "TCP connection established");
            bind_stream(stream, &communicator)
        })
    }
}

/// Attach a connected stream to `communicator` and start its pump tasks
#[instrument(skip(stream, communicator), fields(id = %communicator.id()))]
pub fn bind_stream(stream: TcpStream, communicator: &Communicator) -> Result<()> {
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let generation = communicator.attach_remote(tx)?;

    let reader = communicator.clone();
    tokio::spawn(async move {
        let mut frames = FramedRead::new(read_half, BytesCodec::new());
        let cause = loop {
            match frames.next().await {
                Some(Ok(chunk)) => reader.deliver(generation, &chunk),
                Some(Err(e)) => break Some(Arc::new(ProtocolError::Io(e))),
                None => break None,
            }
        };
        debug!(generation, "TCP read side closed");
        reader.link_lost(generation, cause);
    });

    tokio::spawn(async move {
        let mut sink = FramedWrite::new(write_half, BytesCodec::new());
        while let Some(chunk) = rx.recv().await {
            if let Err(e) = sink.send(chunk).await {
                warn!(error = %e, generation, "TCP write failed");
                break;
            }
        }
        // Dropping the sender means the communicator moved on; close our side.
        let _ = SinkExt::<Bytes>::close(&mut sink).await;
    });

    Ok(())
}
