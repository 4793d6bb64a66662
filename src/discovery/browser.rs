//! Client-side service directory
//!
//! Listens on the well-known discovery port, accumulates announcements into
//! a live directory keyed by instance id, and expires entries that stop
//! refreshing. The listen socket is opened with address reuse so several
//! local clients can browse at once where the platform allows it; when the
//! port is genuinely unavailable the error is surfaced to the caller for a
//! retry/abort decision instead of hanging.

use dashmap::DashMap;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::constants::{MIN_ANNOUNCE_INTERVAL_MS, SERVICE_EXPIRY_INTERVALS};
use crate::error::{DiscoveryError, Error};

use super::Service;

type Directory = Arc<DashMap<String, (Service, Instant)>>;

/// Live directory of announced engine instances
pub struct ServiceBrowser {
    services: Directory,
    local_port: u16,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ServiceBrowser {
    /// Bind the discovery port and start collecting announcements.
    ///
    /// Entries expire after [`SERVICE_EXPIRY_INTERVALS`] announce intervals
    /// without a refresh.
    pub fn start(discovery_port: u16, announce_interval: Duration) -> Result<Self, Error> {
        let announce_interval =
            announce_interval.max(Duration::from_millis(MIN_ANNOUNCE_INTERVAL_MS));
        let expiry = announce_interval * SERVICE_EXPIRY_INTERVALS;

        let socket = listen_socket(discovery_port)?;
        let local_port = socket.local_addr().map(|a| a.port()).unwrap_or(discovery_port);
        let services: Directory = Arc::new(DashMap::new());
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let directory = services.clone();
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let mut sweep = tokio::time::interval(announce_interval);

            loop {
                tokio::select! {
                    result = socket.recv_from(&mut buf) => {
                        match result {
                            Ok((len, src)) => {
                                if let Ok(payload) = std::str::from_utf8(&buf[..len]) {
                                    match Service::from_announcement(payload) {
                                        Ok(mut service) => {
                                            // Broadcasts from multi-homed engines may
                                            // advertise an unspecified bind address;
                                            // the datagram source is authoritative then.
                                            if service.host.is_unspecified() {
                                                service.host = src.ip();
                                            }
                                            tracing::trace!(id = %service.id, name = %service.name, "announcement refreshed");
                                            directory.insert(service.id.clone(), (service, Instant::now()));
                                        }
                                        Err(_) => {
                                            tracing::trace!(%src, "ignoring foreign datagram on discovery port");
                                        }
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::warn!("discovery receive failed: {}", e);
                            }
                        }
                    }
                    _ = sweep.tick() => {
                        sweep_expired(&directory, expiry);
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }

            tracing::debug!("service browser stopped");
        });

        Ok(Self {
            services,
            local_port,
            shutdown,
            handle,
        })
    }

    /// Port the browser is actually listening on (useful when started on an
    /// ephemeral port under test)
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Snapshot of currently known services
    pub fn services(&self) -> Vec<Service> {
        self.services
            .iter()
            .map(|entry| entry.value().0.clone())
            .collect()
    }

    /// Look up a service by its human-readable description, for reconnecting
    /// to a persisted target
    pub fn find_by_name(&self, name: &str) -> Option<Service> {
        self.services
            .iter()
            .find(|entry| entry.value().0.name == name)
            .map(|entry| entry.value().0.clone())
    }

    /// Stop listening and wait for the task to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

fn sweep_expired(directory: &DashMap<String, (Service, Instant)>, expiry: Duration) {
    directory.retain(|id, (_, last_seen)| {
        let alive = last_seen.elapsed() < expiry;
        if !alive {
            tracing::info!(%id, "service expired from directory");
        }
        alive
    });
}

fn listen_socket(port: u16) -> Result<UdpSocket, Error> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| DiscoveryError::SocketSetup(e.to_string()))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| DiscoveryError::SocketSetup(e.to_string()))?;
    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .map_err(|e| DiscoveryError::SocketSetup(e.to_string()))?;
    socket
        .set_broadcast(true)
        .map_err(|e| DiscoveryError::SocketSetup(e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| DiscoveryError::SocketSetup(e.to_string()))?;

    socket
        .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                Error::Discovery(DiscoveryError::PortInUse(port))
            } else {
                Error::Discovery(DiscoveryError::SocketSetup(e.to_string()))
            }
        })?;

    UdpSocket::from_std(socket.into()).map_err(Error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn service(id: &str) -> Service {
        Service {
            id: id.into(),
            name: format!("Engine {id}"),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 50000,
            type_uid: crate::constants::SERVICE_TYPE_UID.into(),
        }
    }

    #[test]
    fn test_sweep_expires_stale_entries() {
        let directory: DashMap<String, (Service, Instant)> = DashMap::new();
        let expiry = Duration::from_secs(6);

        directory.insert("fresh".into(), (service("fresh"), Instant::now()));
        directory.insert(
            "stale".into(),
            (service("stale"), Instant::now() - expiry * 2),
        );

        sweep_expired(&directory, expiry);

        assert!(directory.contains_key("fresh"));
        assert!(!directory.contains_key("stale"));
    }

    #[tokio::test]
    async fn test_browser_receives_announcement_on_loopback() {
        // Ephemeral port keeps this test independent of other listeners
        let browser =
            ServiceBrowser::start(0, Duration::from_secs(2)).expect("browser start failed");
        let target = SocketAddrV4::new(Ipv4Addr::LOCALHOST, browser.local_port());

        let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let announced = service("loop");
        sender
            .send_to(announced.to_announcement().as_bytes(), target)
            .await
            .unwrap();

        let mut found = None;
        for _ in 0..50 {
            if let Some(s) = browser.find_by_name("Engine loop") {
                found = Some(s);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(found, Some(announced));

        browser.stop().await;
    }
}
