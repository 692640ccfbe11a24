//! Inbound Transport Loops
//!
//! One TCP accept loop demultiplexes stream connections by their handshake
//! kind (batched small messages vs bulk); one UDP loop receives best-effort
//! datagrams. Decoded messages go straight to the protocol dispatcher, and
//! every received message refreshes the peer node's last-heard-from stamp.

use anyhow::{Result, bail};
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, error, trace, warn};

use crate::cluster::types::NodeIdentity;
use crate::rpc::service::MeshService;
use crate::rpc::types::{WireMessage, now_ms};

use super::framing;

pub(crate) async fn run_tcp(listener: TcpListener, service: Arc<MeshService>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let service = service.clone();
                tokio::spawn(async move {
                    match serve_stream(stream, peer, service).await {
                        Err(e)
                            if e.downcast_ref::<std::io::Error>()
                                .is_some_and(|io| io.kind() == ErrorKind::UnexpectedEof) =>
                        {
                            debug!("Connection from {} closed", peer);
                        }
                        Err(e) => warn!("Connection from {} dropped: {}", peer, e),
                        Ok(()) => {}
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Read the handshake, intern the announced peer, then decode frames until
/// the connection ends.
async fn serve_stream(
    mut stream: TcpStream,
    peer: SocketAddr,
    service: Arc<MeshService>,
) -> Result<()> {
    let (kind, port) = framing::read_handshake(&mut stream).await?;
    let IpAddr::V4(peer_ip) = peer.ip() else {
        bail!("ipv6 peers are not supported");
    };
    let node = service.registry.intern(NodeIdentity::new(peer_ip, port));
    trace!(
        "Accepted {} channel from {}",
        if kind == framing::KIND_SMALL { "batched" } else { "bulk" },
        node.identity
    );
    loop {
        let payload = if kind == framing::KIND_SMALL {
            framing::read_small_frame(&mut stream).await?
        } else {
            framing::read_bulk_frame(&mut stream).await?
        };
        node.touch(now_ms());
        match bincode::deserialize::<WireMessage>(&payload) {
            Ok(msg) => service.dispatch(msg),
            Err(e) => warn!("Failed to decode message from {}: {}", node.identity, e),
        }
    }
}

pub(crate) async fn run_udp(socket: Arc<UdpSocket>, service: Arc<MeshService>) {
    let mut buf = vec![0u8; 65536];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, src)) => match bincode::deserialize::<WireMessage>(&buf[..len]) {
                Ok(msg) => service.dispatch(msg),
                Err(e) => {
                    warn!("Failed to decode datagram from {}: {}", src, e);
                }
            },
            Err(e) => {
                error!("Failed to receive UDP packet: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
