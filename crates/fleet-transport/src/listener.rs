//! Inbound side of the transport: accepts peer sockets, bounded by a
//! connection limit.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{Connection, TransportError};

/// A freshly accepted socket together with its slot in the connection limit.
#[derive(Debug)]
pub struct Accepted {
    pub address: String,
    pub stream: TcpStream,
    permit: OwnedSemaphorePermit,
}

pub struct Listener {
    inner: TcpListener,
    semaphore: Arc<Semaphore>,
}

impl Listener {
    pub async fn bind(addr: &str, max_connections: usize) -> Result<Self, TransportError> {
        let inner = TcpListener::bind(addr).await?;
        tracing::info!(addr = %addr, max_connections, "Listening for fleet connections");
        Ok(Self {
            inner,
            semaphore: Arc::new(Semaphore::new(max_connections.max(1))),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.inner.local_addr()?)
    }

    /// Wait for a free slot, then for the next peer.
    pub async fn accept(&self) -> Result<Accepted, TransportError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))?;
        let (stream, peer) = self.inner.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer = %peer, error = %e, "Cannot set TCP_NODELAY");
        }
        tracing::debug!(peer = %peer, "Peer connected");
        Ok(Accepted {
            address: peer.to_string(),
            stream,
            permit,
        })
    }
}

impl Connection {
    /// Back the connection with an accepted socket. The connection slot is
    /// released when this socket closes.
    pub fn attach_accepted(self: &Arc<Self>, accepted: Accepted) -> Result<(), TransportError> {
        self.attach_with_permit(accepted.stream, accepted.permit)
    }
}
