//! Client-side connection state machine
//!
//! Exactly three states: `Discovering` (no target selected), `Connecting`
//! (target selected, connect attempts with a bounded timeout and an
//! independent retry timer), `Active` (framed message exchange). Connect
//! timeout (3 s) and retry interval (5 s) are distinct timers: one bounds a
//! single attempt, the other schedules the next one. "Attempt once now" is
//! the head of the connect loop; "repeat every 5 s" is the preemptible wait
//! after a failed attempt.
//!
//! The first write after every successful connect declares the client's
//! traffic subscription, so the engine knows what to deliver before
//! anything else flows. A refreshed target (same description, new
//! address/port) preempts both a stale in-flight attempt and the retry
//! wait.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::codec::{Message, MessageType};
use crate::constants::{CONNECT_TIMEOUT_MS, RETRY_INTERVAL_MS};
use crate::discovery::Service;
use crate::error::{Error, NetworkError};

use super::frame;

const COMMAND_QUEUE_DEPTH: usize = 64;
const EVENT_QUEUE_DEPTH: usize = 1024;

/// Connection lifecycle states; there are no others
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Discovering,
    Connecting,
    Active,
}

/// Events surfaced to the connection's owner
#[derive(Debug)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    Received(Message),
}

enum Command {
    SetTarget(Service),
    ClearTarget,
    SetSubscription(BTreeSet<MessageType>),
    Send(Message),
    Shutdown,
}

/// Cheap clonable outbound handle, usable from synchronous callers such as
/// matrix listeners
#[derive(Clone)]
pub struct MessageSender {
    commands: mpsc::Sender<Command>,
}

impl MessageSender {
    /// Queue a message without blocking; fails when the command queue is
    /// full or the connection task has stopped
    pub fn try_send(&self, message: Message) -> Result<(), Error> {
        self.commands
            .try_send(Command::Send(message))
            .map_err(|_| NetworkError::NotRunning.into())
    }
}

/// Handle to the connection task
pub struct RemoteConnection {
    id: Uuid,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    handle: JoinHandle<()>,
}

impl RemoteConnection {
    /// Spawn the connection task in the `Discovering` state
    pub fn start() -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Discovering);

        let task = ConnectionTask {
            target: None,
            subscription: BTreeSet::new(),
            state_tx,
            events: events_tx,
            commands: commands_rx,
        };
        let handle = tokio::spawn(task.run());

        (
            Self {
                id: Uuid::new_v4(),
                commands: commands_tx,
                state: state_rx,
                handle,
            },
            events_rx,
        )
    }

    /// Originator identity of this connection. State changes applied on its
    /// behalf carry this id, which is what makes echo suppression work.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch handle for awaiting state transitions
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Outbound handle for synchronous callers
    pub fn message_sender(&self) -> MessageSender {
        MessageSender {
            commands: self.commands.clone(),
        }
    }

    /// Select a target service; moves Discovering → Connecting, or preempts
    /// a stale attempt when the service description was refreshed
    pub async fn set_target(&self, service: Service) -> Result<(), Error> {
        self.command(Command::SetTarget(service)).await
    }

    /// Explicit disconnect: clears the target, back to Discovering
    pub async fn clear_target(&self) -> Result<(), Error> {
        self.command(Command::ClearTarget).await
    }

    /// Replace the traffic subscription. Declared immediately when active,
    /// and re-declared automatically after every reconnect.
    pub async fn set_subscription(&self, types: BTreeSet<MessageType>) -> Result<(), Error> {
        self.command(Command::SetSubscription(types)).await
    }

    /// Send a message to the engine; dropped when not active
    pub async fn send(&self, message: Message) -> Result<(), Error> {
        self.command(Command::Send(message)).await
    }

    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown).await;
        let _ = self.handle.await;
    }

    async fn command(&self, command: Command) -> Result<(), Error> {
        self.commands
            .send(command)
            .await
            .map_err(|_| NetworkError::NotRunning.into())
    }
}

struct ConnectionTask {
    target: Option<Service>,
    subscription: BTreeSet<MessageType>,
    state_tx: watch::Sender<ConnectionState>,
    events: mpsc::Sender<ConnectionEvent>,
    commands: mpsc::Receiver<Command>,
}

enum Flow {
    Reconnect,
    Shutdown,
}

/// Decode inbound frames and surface them as events. Decode failures are
/// discarded (the frame was fully consumed); transport failures signal the
/// main task to reconnect.
async fn read_loop(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    events: mpsc::Sender<ConnectionEvent>,
    lost: mpsc::Sender<()>,
) {
    loop {
        match frame::read_message(&mut reader).await {
            Ok(message) => {
                if events
                    .send(ConnectionEvent::Received(message))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(Error::Codec(e)) => {
                tracing::warn!("discarding undecodable message: {}", e);
            }
            Err(e) => {
                tracing::debug!("read ended: {}", e);
                let _ = lost.send(()).await;
                return;
            }
        }
    }
}

impl ConnectionTask {
    async fn run(mut self) {
        let connect_timeout = Duration::from_millis(CONNECT_TIMEOUT_MS);
        let retry_interval = Duration::from_millis(RETRY_INTERVAL_MS);

        'main: loop {
            // ---- Discovering: wait for a target
            if self.target.is_none() {
                self.set_state(ConnectionState::Discovering).await;
                while self.target.is_none() {
                    match self.commands.recv().await {
                        None | Some(Command::Shutdown) => return,
                        Some(Command::SetTarget(service)) => self.target = Some(service),
                        Some(Command::ClearTarget) => {}
                        Some(Command::SetSubscription(types)) => self.subscription = types,
                        // Not connected: nothing to write to
                        Some(Command::Send(_)) => {}
                    }
                }
            }

            // ---- Connecting: attempt now, then retry on the timer
            self.set_state(ConnectionState::Connecting).await;
            let stream = 'connect: loop {
                let Some(service) = self.target.clone() else {
                    continue 'main;
                };
                let addr = SocketAddr::new(service.host, service.port);

                let attempt = tokio::time::timeout(connect_timeout, TcpStream::connect(addr));
                tokio::pin!(attempt);

                // One attempt runs to completion; only a target change
                // restarts it, other commands are handled in place
                'attempt: loop {
                    tokio::select! {
                        result = &mut attempt => {
                            match result {
                                Ok(Ok(stream)) => break 'connect stream,
                                Ok(Err(e)) => {
                                    tracing::debug!(%addr, "connect failed: {}", e);
                                }
                                Err(_) => {
                                    tracing::debug!(%addr, timeout_ms = CONNECT_TIMEOUT_MS, "connect timed out");
                                }
                            }
                            break 'attempt;
                        }
                        cmd = self.commands.recv() => match cmd {
                            None | Some(Command::Shutdown) => return,
                            // A refreshed target preempts the stale attempt
                            Some(Command::SetTarget(service)) => {
                                self.target = Some(service);
                                continue 'connect;
                            }
                            Some(Command::ClearTarget) => {
                                self.target = None;
                                continue 'main;
                            }
                            Some(Command::SetSubscription(types)) => self.subscription = types,
                            // Not connected: nothing to write to
                            Some(Command::Send(_)) => {}
                        }
                    }
                }

                // Preemptible retry wait
                let retry = tokio::time::sleep(retry_interval);
                tokio::pin!(retry);
                loop {
                    tokio::select! {
                        _ = &mut retry => break,
                        cmd = self.commands.recv() => match cmd {
                            None | Some(Command::Shutdown) => return,
                            Some(Command::SetTarget(service)) => {
                                self.target = Some(service);
                                break;
                            }
                            Some(Command::ClearTarget) => {
                                self.target = None;
                                continue 'main;
                            }
                            Some(Command::SetSubscription(types)) => self.subscription = types,
                            Some(Command::Send(_)) => {}
                        }
                    }
                }
            };

            // ---- Active
            let _ = stream.set_nodelay(true);
            let (reader, mut writer) = stream.into_split();

            // Declare what traffic we want before anything else flows
            let selection = Message::TrafficSelection(self.subscription.clone());
            if frame::write_message(&mut writer, &selection).await.is_err() {
                continue 'main;
            }
            self.set_state(ConnectionState::Active).await;

            // Inbound frames are read on their own task so a mid-frame read
            // is never cancelled by command handling
            let (lost_tx, mut lost_rx) = mpsc::channel::<()>(1);
            let reader_task = tokio::spawn(read_loop(reader, self.events.clone(), lost_tx));

            let leave = loop {
                tokio::select! {
                    _ = lost_rx.recv() => {
                        tracing::info!("connection lost");
                        break Flow::Reconnect;
                    }
                    cmd = self.commands.recv() => match cmd {
                        None | Some(Command::Shutdown) => break Flow::Shutdown,
                        Some(Command::Send(message)) => {
                            if frame::write_message(&mut writer, &message).await.is_err() {
                                tracing::info!("write failed, reconnecting");
                                break Flow::Reconnect;
                            }
                        }
                        Some(Command::SetSubscription(types)) => {
                            self.subscription = types;
                            let selection = Message::TrafficSelection(self.subscription.clone());
                            if frame::write_message(&mut writer, &selection).await.is_err() {
                                break Flow::Reconnect;
                            }
                        }
                        Some(Command::SetTarget(service)) => {
                            let changed = self.target.as_ref() != Some(&service);
                            self.target = Some(service);
                            if changed {
                                // Refreshed description: drop the stale
                                // session in favor of the new endpoint
                                break Flow::Reconnect;
                            }
                        }
                        Some(Command::ClearTarget) => {
                            self.target = None;
                            break Flow::Reconnect;
                        }
                    }
                }
            };
            reader_task.abort();
            match leave {
                Flow::Reconnect => continue 'main,
                Flow::Shutdown => return,
            }
        }
    }

    async fn set_state(&self, state: ConnectionState) {
        if *self.state_tx.borrow() == state {
            return;
        }
        let _ = self.state_tx.send(state);
        let _ = self
            .events
            .send(ConnectionEvent::StateChanged(state))
            .await;
    }
}
