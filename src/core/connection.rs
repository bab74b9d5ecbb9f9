/// Plain TCP connector
///
/// Verifies that an endpoint accepts connections and keeps them alive with TCP
/// keepalive. It knows no database protocol: `ping` only detects a peer that
/// closed or reset the socket. The `check` command uses it; production
/// deployments plug a driver-backed `Connector` instead.
use super::dsn::Dsn;
use super::{Connection, Connector, PoolTarget};
use crate::error::{DataError, DataResult};
use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Connector that opens raw TCP streams to the DSN's endpoint
#[derive(Debug, Clone)]
pub struct TcpConnector {
    keepalive: Option<Duration>,
}

/// A TCP stream to a database endpoint
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpConnector {
    pub fn new(keepalive: Option<Duration>) -> Self {
        Self { keepalive }
    }

    /// Configure a freshly connected stream for low latency and dead-peer detection
    fn configure_stream(&self, stream: &TcpStream) -> Result<(), io::Error> {
        stream.set_nodelay(true)?;
        if let Some(idle) = self.keepalive {
            let socket = SockRef::from(stream);
            socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
        }
        Ok(())
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Some(Duration::from_secs(60)))
    }
}

impl TcpConnection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Connection = TcpConnection;

    async fn connect(&self, target: &PoolTarget) -> DataResult<TcpConnection> {
        let endpoint = Dsn::parse(&target.dsn)?.endpoint()?;
        debug!(pool = %target.name, %endpoint, "Connecting");

        let stream = TcpStream::connect(&endpoint).await.map_err(|e| match e.kind() {
            io::ErrorKind::ConnectionRefused => {
                DataError::connection(&target.name, format!("connection refused by {}", endpoint))
            }
            _ => DataError::connection(&target.name, format!("{}: {}", endpoint, e)),
        })?;

        if let Err(e) = self.configure_stream(&stream) {
            warn!(pool = %target.name, "Failed to configure stream: {}", e);
        }

        let peer = stream
            .peer_addr()
            .map_err(|e| DataError::connection(&target.name, e.to_string()))?;

        Ok(TcpConnection { stream, peer })
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn ping(&mut self) -> DataResult<()> {
        let mut probe = [0u8; 1];
        match self.stream.try_read(&mut probe) {
            Ok(0) => Err(DataError::connection(
                self.peer.to_string(),
                "peer closed the connection",
            )),
            // Unsolicited bytes still prove the peer is alive
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(DataError::connection(self.peer.to_string(), e.to_string())),
        }
    }
}
