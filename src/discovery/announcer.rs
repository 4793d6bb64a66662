//! Engine-side discovery announcer
//!
//! Broadcasts the service announcement on the well-known UDP port at a
//! bounded minimum interval. The broadcast task is stoppable on teardown
//! without leaking the socket.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::constants::MIN_ANNOUNCE_INTERVAL_MS;
use crate::error::{DiscoveryError, Error};

use super::Service;

/// Periodic UDP broadcast of one service announcement
pub struct Announcer {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Announcer {
    /// Start announcing `service` every `interval` (clamped to the protocol
    /// minimum of 1.5 s to avoid flooding the segment).
    pub fn start(
        service: Service,
        discovery_port: u16,
        interval: Duration,
    ) -> Result<Self, Error> {
        let interval = clamp_interval(interval);
        let socket = broadcast_socket()?;
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let payload = service.to_announcement();
            let target = SocketAddr::from((Ipv4Addr::BROADCAST, discovery_port));
            let mut ticker = tokio::time::interval(interval);

            tracing::info!(
                service = %service.name,
                port = discovery_port,
                interval_ms = interval.as_millis() as u64,
                "discovery announcer started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = socket.send_to(payload.as_bytes(), target).await {
                            tracing::warn!("announcement broadcast failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }

            tracing::debug!("discovery announcer stopped");
        });

        Ok(Self { shutdown, handle })
    }

    /// Stop the broadcast task and wait for it to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

fn clamp_interval(interval: Duration) -> Duration {
    interval.max(Duration::from_millis(MIN_ANNOUNCE_INTERVAL_MS))
}

fn broadcast_socket() -> Result<UdpSocket, Error> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| DiscoveryError::SocketSetup(e.to_string()))?;
    socket
        .set_broadcast(true)
        .map_err(|e| DiscoveryError::SocketSetup(e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| DiscoveryError::SocketSetup(e.to_string()))?;
    socket
        .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())
        .map_err(|e| DiscoveryError::SocketSetup(e.to_string()))?;

    UdpSocket::from_std(socket.into()).map_err(Error::Io)
}
