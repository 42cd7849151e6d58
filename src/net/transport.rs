//! WebTransport server implementation
//!
//! Each accepted session opens one bidirectional stream that carries
//! length-prefixed MessagePack frames in both directions. Connection tasks
//! never touch the world: inbound frames go to the scheduler's inbound
//! buffer, outbound frames arrive through an mpsc channel drained by a
//! writer task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::net::connection::ConnectionId;
use crate::net::framing::{read_message, write_message, FramingError};
use crate::net::inbound::InboundSender;
use crate::net::tls::TlsConfig;

/// WebTransport server
pub struct WebTransportServer {
    config: SyncConfig,
    tls_config: TlsConfig,
    inbound: InboundSender,
    next_id: Arc<AtomicU64>,
}

impl WebTransportServer {
    /// Create a new WebTransport server
    pub async fn new(
        config: SyncConfig,
        inbound: InboundSender,
    ) -> anyhow::Result<Self> {
        let tls_config = TlsConfig::load(&config).await?;

        Ok(Self {
            config,
            tls_config,
            inbound,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Get the certificate hash for client configuration
    pub fn cert_hash(&self) -> &str {
        self.tls_config.cert_hash()
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.config.bind_address, self.config.port)
    }

    /// Accept sessions until the endpoint fails
    pub async fn run(self) -> anyhow::Result<()> {
        use wtransport::Endpoint;
        use wtransport::ServerConfig;

        let addr = self.bind_addr();

        // An unspecified address binds dual-stack (IPv4 + IPv6)
        let builder = if self.config.bind_address.is_unspecified() {
            ServerConfig::builder().with_bind_default(self.config.port)
        } else {
            ServerConfig::builder().with_bind_address(addr)
        };

        let server_config = builder
            .with_identity(self.tls_config.identity)
            .keep_alive_interval(self.config.keep_alive())
            .build();

        let server = Endpoint::server(server_config)?;

        info!("WebTransport server listening on {}", addr);

        loop {
            let incoming = server.accept().await;
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let inbound = self.inbound.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(incoming, id, inbound).await {
                    warn!("Connection {} error: {}", id, e);
                }
            });
        }
    }
}

/// Handle a single WebTransport session
async fn handle_connection(
    incoming: wtransport::endpoint::IncomingSession,
    id: ConnectionId,
    inbound: InboundSender,
) -> anyhow::Result<()> {
    let session_request = incoming.await?;

    debug!(
        "New session from {:?}, path: {}, conn_id: {}",
        session_request.authority(),
        session_request.path(),
        id
    );

    let connection = session_request.accept().await?;
    let (send, recv) = connection.accept_bi().await?;

    let (tx, rx) = unbounded_channel::<Vec<u8>>();
    inbound.opened(id, Box::new(tx))?;
    debug!("Connection {} opened its sync stream", id);

    let writer = tokio::spawn(write_frames(id, send, rx));

    if let Err(e) = read_frames(id, recv, &inbound).await {
        debug!("Connection {} read ended: {}", id, e);
    }

    // The world drops its sender on Closed, which ends the writer
    if inbound.closed(id).is_err() {
        writer.abort();
    }

    drop(connection);
    debug!("Connection {} closed", id);
    Ok(())
}

/// Forward every inbound frame to the world until the stream ends
pub async fn read_frames<R: AsyncRead + Unpin>(
    id: ConnectionId,
    mut recv: R,
    inbound: &InboundSender,
) -> Result<(), FramingError> {
    loop {
        let frame = match read_message(&mut recv).await {
            Ok(frame) => frame,
            Err(FramingError::ConnectionClosed) => return Ok(()),
            Err(FramingError::MessageTooLarge(len, max)) => {
                warn!("Connection {} sent oversized frame: {} bytes (max {})", id, len, max);
                return Err(FramingError::MessageTooLarge(len, max));
            }
            Err(e) => return Err(e),
        };

        if frame.is_empty() {
            continue;
        }

        if inbound.frame(id, frame).is_err() {
            // Scheduler is gone, nothing left to deliver to
            return Ok(());
        }
    }
}

/// Write every outbound frame to the stream until the world drops the sender
pub async fn write_frames<W: AsyncWrite + Unpin>(
    id: ConnectionId,
    mut send: W,
    mut rx: UnboundedReceiver<Vec<u8>>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_message(&mut send, &frame).await {
            debug!("Connection {} write failed: {}", id, e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::inbound::{InboundBuffer, InboundEvent};
    use crate::net::protocol::{self, Envelope};
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_read_frames_forwards_to_inbound() {
        let buffer = InboundBuffer::new();
        let sender = buffer.sender();
        let (mut client, server) = duplex(4096);

        let frame = protocol::encode(&[Envelope::new("move", json!({ "dx": 1 }))]).unwrap();
        write_message(&mut client, &frame).await.unwrap();
        write_message(&mut client, &[]).await.unwrap();
        write_message(&mut client, &frame).await.unwrap();
        drop(client);

        read_frames(5, server, &sender).await.unwrap();

        let events = buffer.drain();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], InboundEvent::Frame { id: 5, bytes } if bytes == &frame));
    }

    #[tokio::test]
    async fn test_read_frames_rejects_oversized() {
        let buffer = InboundBuffer::new();
        let sender = buffer.sender();
        let (mut client, server) = duplex(64);

        let prefix = (u32::MAX).to_le_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &prefix).await.unwrap();

        let result = read_frames(5, server, &sender).await;
        assert!(matches!(result, Err(FramingError::MessageTooLarge(_, _))));
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_write_frames_until_sender_dropped() {
        let (client, mut server) = duplex(4096);
        let (tx, rx) = unbounded_channel::<Vec<u8>>();

        let writer = tokio::spawn(write_frames(1, client, rx));
        tx.send(vec![0x90]).unwrap();
        tx.send(vec![0x91, 0xc0]).unwrap();
        drop(tx);
        writer.await.unwrap();

        assert_eq!(read_message(&mut server).await.unwrap(), vec![0x90]);
        assert_eq!(read_message(&mut server).await.unwrap(), vec![0x91, 0xc0]);
        assert!(matches!(read_message(&mut server).await, Err(FramingError::ConnectionClosed)));
    }

    #[tokio::test]
    #[ignore] // Requires a PEM pair in certs/
    async fn test_run_binds_and_keeps_accepting() {
        let config = SyncConfig {
            bind_address: "127.0.0.1".parse().unwrap(),
            port: 0,
            ..SyncConfig::default()
        };
        let buffer = InboundBuffer::new();
        let server = WebTransportServer::new(config, buffer.sender()).await.unwrap();
        assert_eq!(server.bind_addr().ip().to_string(), "127.0.0.1");

        // The accept loop only returns on endpoint failure
        let running = tokio::time::timeout(Duration::from_millis(200), server.run()).await;
        assert!(running.is_err());
    }
}
