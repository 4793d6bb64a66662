//! Engine-side control server
//!
//! Accepts client connections on the advertised TCP port, runs one
//! reader/writer task pair per client, and fans outgoing messages out
//! through each client's traffic subscription. Filtering happens
//! per-connection: different clients hold different subscriptions at the
//! same time, and a skipped message is simply never written to that socket.

use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::codec::Message;
use crate::error::{Error, NetworkError};

use super::frame;
use super::subscription::Subscription;

const CLIENT_QUEUE_DEPTH: usize = 256;
const EVENT_QUEUE_DEPTH: usize = 1024;

/// Something that happened on a client connection
#[derive(Debug)]
pub struct ClientEvent {
    pub client: Uuid,
    pub kind: ClientEventKind,
}

#[derive(Debug)]
pub enum ClientEventKind {
    Connected(SocketAddr),
    Disconnected,
    Message(Message),
}

struct ClientHandle {
    tx: mpsc::Sender<Bytes>,
    subscription: Subscription,
}

type ClientMap = Arc<DashMap<Uuid, ClientHandle>>;

/// TCP server owning the per-client subscription table
pub struct MatrixServer {
    clients: ClientMap,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MatrixServer {
    /// Bind the control port and start accepting clients. Inbound messages
    /// and connect/disconnect notifications arrive on the returned channel.
    pub async fn bind(port: u16) -> Result<(Self, mpsc::Receiver<ClientEvent>), Error> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        let local_addr = listener.local_addr()?;

        let clients: ClientMap = Arc::new(DashMap::new());
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let accept_clients = clients.clone();
        let handle = tokio::spawn(accept_loop(
            listener,
            accept_clients,
            events_tx,
            shutdown_rx,
        ));

        tracing::info!(%local_addr, "control server listening");

        Ok((
            Self {
                clients,
                local_addr,
                shutdown,
                handle,
            },
            events_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Replace a client's traffic subscription
    pub fn set_subscription(&self, client: Uuid, subscription: Subscription) {
        if let Some(mut handle) = self.clients.get_mut(&client) {
            tracing::debug!(%client, types = ?subscription.types(), "subscription updated");
            handle.subscription = subscription;
        }
    }

    pub fn subscription(&self, client: Uuid) -> Option<Subscription> {
        self.clients.get(&client).map(|h| h.subscription.clone())
    }

    /// Queue a message for one client if its subscription allows the type.
    /// Returns whether the message was queued.
    pub fn send_to(&self, client: Uuid, message: &Message) -> bool {
        let Some(handle) = self.clients.get(&client) else {
            return false;
        };
        if !handle.subscription.allows_message(message) {
            return false;
        }
        Self::queue(client, &handle, frame::frame_message(message))
    }

    /// Fan a message out to every subscribed client
    pub fn broadcast(&self, message: &Message) {
        self.broadcast_filtered(message, None);
    }

    /// Fan a message out to every subscribed client except the originator,
    /// which already holds this state locally (echo suppression)
    pub fn broadcast_except(&self, originator: Uuid, message: &Message) {
        self.broadcast_filtered(message, Some(originator));
    }

    fn broadcast_filtered(&self, message: &Message, skip: Option<Uuid>) {
        // Encode once; the per-client decision is only the subscription test
        let framed = frame::frame_message(message);
        for entry in self.clients.iter() {
            let client = *entry.key();
            if Some(client) == skip {
                continue;
            }
            if !entry.value().subscription.allows_message(message) {
                continue;
            }
            Self::queue(client, entry.value(), framed.clone());
        }
    }

    fn queue(client: Uuid, handle: &ClientHandle, framed: Bytes) -> bool {
        match handle.tx.try_send(framed) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(%client, "dropping message for slow client: {}", e);
                false
            }
        }
    }

    /// Stop accepting and tear down all client tasks within a bounded time
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
        self.clients.clear();
    }
}

async fn accept_loop(
    listener: TcpListener,
    clients: ClientMap,
    events: mpsc::Sender<ClientEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let client = Uuid::new_v4();
                        tracing::info!(%client, %peer, "client connected");
                        spawn_client(stream, peer, client, clients.clone(), events.clone(), shutdown.clone());
                    }
                    Err(e) => {
                        tracing::warn!("accept failed: {}", e);
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

fn spawn_client(
    stream: TcpStream,
    peer: SocketAddr,
    client: Uuid,
    clients: ClientMap,
    events: mpsc::Sender<ClientEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    let (tx, mut rx) = mpsc::channel::<Bytes>(CLIENT_QUEUE_DEPTH);
    clients.insert(
        client,
        ClientHandle {
            tx,
            // No traffic until the client declares what it wants
            subscription: Subscription::none(),
        },
    );

    // Writer: drains the fanout queue until the handle is removed
    tokio::spawn(async move {
        while let Some(framed) = rx.recv().await {
            if frame::write_frame(&mut writer, &framed).await.is_err() {
                break;
            }
        }
    });

    // Reader: decodes inbound frames until EOF, error or shutdown
    tokio::spawn(async move {
        let _ = events
            .send(ClientEvent {
                client,
                kind: ClientEventKind::Connected(peer),
            })
            .await;

        loop {
            tokio::select! {
                result = frame::read_message(&mut reader) => {
                    match result {
                        Ok(message) => {
                            let _ = events
                                .send(ClientEvent {
                                    client,
                                    kind: ClientEventKind::Message(message),
                                })
                                .await;
                        }
                        Err(Error::Network(NetworkError::Closed)) => {
                            tracing::info!(%client, "client disconnected");
                            break;
                        }
                        Err(Error::Codec(e)) => {
                            // A malformed message is discarded; the
                            // connection stays open
                            tracing::warn!(%client, "discarding undecodable message: {}", e);
                        }
                        Err(e) => {
                            tracing::warn!(%client, "read failed: {}", e);
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        clients.remove(&client);
        let _ = events
            .send(ClientEvent {
                client,
                kind: ClientEventKind::Disconnected,
            })
            .await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ControlParameters, Direction, MessageType};
    use std::time::Duration;

    async fn recv_event(rx: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_subscription_filters_broadcast() {
        let (server, mut events) = MatrixServer::bind(0).await.unwrap();
        let addr = server.local_addr();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let connected = recv_event(&mut events).await;
        let client = connected.client;
        assert!(matches!(connected.kind, ClientEventKind::Connected(_)));

        server.set_subscription(client, Subscription::remote_control());

        // AudioBuffer is not subscribed: silently skipped
        server.broadcast(&Message::AudioBuffer {
            direction: Direction::Input,
            channels: 1,
            frames: 1,
            samples: vec![0.5],
        });
        // ControlParameters is subscribed: delivered
        let control = Message::ControlParameters(ControlParameters::default());
        server.broadcast(&control);

        let received = frame::read_message(&mut stream).await.unwrap();
        assert_eq!(received, control);
        assert_eq!(received.message_type(), MessageType::ControlParameters);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_except_skips_originator() {
        let (server, mut events) = MatrixServer::bind(0).await.unwrap();
        let addr = server.local_addr();

        let mut first = TcpStream::connect(addr).await.unwrap();
        let first_id = recv_event(&mut events).await.client;
        let mut second = TcpStream::connect(addr).await.unwrap();
        let second_id = recv_event(&mut events).await.client;

        server.set_subscription(first_id, Subscription::remote_control());
        server.set_subscription(second_id, Subscription::remote_control());

        let update = Message::ControlParameters(ControlParameters::default());
        server.broadcast_except(first_id, &update);
        // A follow-up the originator does receive, proving the skip above
        // was the filter and not a write failure
        let followup = Message::ReinitIoCount {
            inputs: 8,
            outputs: 4,
        };
        server.broadcast(&followup);

        assert_eq!(frame::read_message(&mut second).await.unwrap(), update);
        assert_eq!(frame::read_message(&mut second).await.unwrap(), followup);
        assert_eq!(frame::read_message(&mut first).await.unwrap(), followup);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_inbound_messages_surface_as_events() {
        let (server, mut events) = MatrixServer::bind(0).await.unwrap();
        let addr = server.local_addr();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let client = recv_event(&mut events).await.client;

        let selection = Message::TrafficSelection(
            Subscription::remote_control().into_types(),
        );
        frame::write_message(&mut stream, &selection).await.unwrap();

        let event = recv_event(&mut events).await;
        assert_eq!(event.client, client);
        match event.kind {
            ClientEventKind::Message(m) => assert_eq!(m, selection),
            other => panic!("expected message event, got {:?}", other),
        }

        drop(stream);
        let event = recv_event(&mut events).await;
        assert!(matches!(event.kind, ClientEventKind::Disconnected));
        assert_eq!(server.client_count(), 0);

        server.stop().await;
    }
}
