//! Client-side engine mirror
//!
//! `RemoteController` keeps a local `CrosspointMatrix` in step with a
//! remote engine. Inbound snapshots are applied to the mirror tagged with
//! the connection's originator id; the outbound listener skips exactly
//! those changes, so a surface mutation travels to the engine while an
//! engine update never bounces back out. Surface mutations made while the
//! connection is not active cannot reach the engine at that moment; they
//! are flagged, and once the connection is active again and the engine's
//! initial sync snapshot has been applied, the full mirror snapshot is
//! re-emitted. The merge order makes both sides converge: the engine wins
//! on entries it also holds, offline edits win on entries it never set.
//! Level snapshots and environment parameters are cached for display
//! polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::analyzer::LevelSnapshot;
use crate::codec::{Direction, EnvironmentParameters, Message, MessageType};
use crate::constants::DEFAULT_MIN_DB;
use crate::error::Error;
use crate::matrix::commander::{
    CommanderHub, CrosspointCommander, InputCommander, MatrixChange, MatrixListener,
    OriginatorId, OutputCommander,
};
use crate::matrix::CrosspointMatrix;
use crate::network::{
    ConnectionEvent, ConnectionState, MessageSender, RemoteConnection, Subscription,
};

/// Analyzer parameters as last announced by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAnalyzerInfo {
    pub sample_rate: u32,
    pub max_block_size: u32,
}

struct RemoteShared {
    environment: Mutex<EnvironmentParameters>,
    analyzer: Mutex<Option<RemoteAnalyzerInfo>>,
    input_levels: Mutex<Option<LevelSnapshot>>,
    output_levels: Mutex<Option<LevelSnapshot>>,
}

/// Mirrors the engine matrix over a [`RemoteConnection`]
pub struct RemoteController {
    hub: Arc<CommanderHub>,
    connection: RemoteConnection,
    shared: Arc<RemoteShared>,
    pump: JoinHandle<()>,
}

impl RemoteController {
    /// Spawn the controller with the given traffic subscription. The
    /// connection starts in `Discovering`; call [`set_target`] with a
    /// browsed service to connect.
    ///
    /// [`set_target`]: RemoteController::set_target
    pub async fn start(subscription: Subscription) -> Result<Self, Error> {
        let (connection, events) = RemoteConnection::start();
        let expects_sync = subscription.allows(MessageType::ControlParameters);
        connection
            .set_subscription(subscription.into_types())
            .await?;

        let hub = CommanderHub::new(CrosspointMatrix::default());
        let pending_resync = Arc::new(AtomicBool::new(false));
        hub.register_listener(Arc::new(NetworkSender {
            hub: Arc::downgrade(&hub),
            connection_id: connection.id(),
            sender: connection.message_sender(),
            state: connection.state_watch(),
            pending_resync: pending_resync.clone(),
        }));

        let shared = Arc::new(RemoteShared {
            environment: Mutex::new(EnvironmentParameters {
                palette: 0,
                min_db: DEFAULT_MIN_DB,
            }),
            analyzer: Mutex::new(None),
            input_levels: Mutex::new(None),
            output_levels: Mutex::new(None),
        });

        let pump = tokio::spawn(pump_events(
            events,
            hub.clone(),
            connection.id(),
            connection.message_sender(),
            pending_resync,
            expects_sync,
            shared.clone(),
        ));

        Ok(Self {
            hub,
            connection,
            shared,
            pump,
        })
    }

    /// The mirrored matrix hub; surfaces register their own listeners and
    /// commanders against it
    pub fn hub(&self) -> &Arc<CommanderHub> {
        &self.hub
    }

    /// Originator id the controller uses for inbound engine updates
    pub fn connection_id(&self) -> OriginatorId {
        self.connection.id()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn input_commander(&self) -> InputCommander {
        InputCommander::new(self.hub.clone())
    }

    pub fn output_commander(&self) -> OutputCommander {
        OutputCommander::new(self.hub.clone())
    }

    pub fn crosspoint_commander(&self) -> CrosspointCommander {
        CrosspointCommander::new(self.hub.clone())
    }

    pub async fn set_target(&self, service: crate::discovery::Service) -> Result<(), Error> {
        self.connection.set_target(service).await
    }

    pub async fn clear_target(&self) -> Result<(), Error> {
        self.connection.clear_target().await
    }

    /// Latest environment parameters announced by the engine
    pub fn environment(&self) -> EnvironmentParameters {
        *self.shared.environment.lock()
    }

    pub fn analyzer_info(&self) -> Option<RemoteAnalyzerInfo> {
        *self.shared.analyzer.lock()
    }

    /// Latest level snapshot for one side of the matrix, if any arrived
    pub fn levels(&self, direction: Direction) -> Option<LevelSnapshot> {
        match direction {
            Direction::Input => self.shared.input_levels.lock().clone(),
            Direction::Output => self.shared.output_levels.lock().clone(),
        }
    }

    pub async fn shutdown(self) {
        self.connection.shutdown().await;
        let _ = self.pump.await;
    }
}

/// Forwards surface-originated matrix changes to the engine. Changes
/// tagged with the connection's own id came from the engine and are never
/// re-emitted.
struct NetworkSender {
    hub: std::sync::Weak<CommanderHub>,
    connection_id: OriginatorId,
    sender: MessageSender,
    state: watch::Receiver<ConnectionState>,
    pending_resync: Arc<AtomicBool>,
}

impl MatrixListener for NetworkSender {
    fn matrix_changed(&self, change: &MatrixChange, originator: OriginatorId) {
        if originator == self.connection_id {
            return;
        }
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        // An update queued while the session is down never reaches the
        // engine; flag it so the next active transition resyncs
        if *self.state.borrow() != ConnectionState::Active {
            self.pending_resync.store(true, Ordering::Relaxed);
        }
        let message = match change {
            MatrixChange::IoCount { inputs, outputs } => Message::ReinitIoCount {
                inputs: *inputs,
                outputs: *outputs,
            },
            _ => Message::ControlParameters(hub.snapshot()),
        };
        if let Err(e) = self.sender.try_send(message) {
            self.pending_resync.store(true, Ordering::Relaxed);
            tracing::warn!("failed to queue outbound control update: {}", e);
        }
    }
}

fn send_resync(hub: &Arc<CommanderHub>, sender: &MessageSender, pending_resync: &AtomicBool) {
    let snapshot = Message::ControlParameters(hub.snapshot());
    if sender.try_send(snapshot).is_err() {
        pending_resync.store(true, Ordering::Relaxed);
        tracing::warn!("failed to queue control resync");
    }
}

async fn pump_events(
    mut events: mpsc::Receiver<ConnectionEvent>,
    hub: Arc<CommanderHub>,
    connection_id: OriginatorId,
    sender: MessageSender,
    pending_resync: Arc<AtomicBool>,
    expects_sync: bool,
    shared: Arc<RemoteShared>,
) {
    // Set while a pending resync is parked until the engine's initial
    // sync snapshot has been merged into the mirror
    let mut resync_after_sync = false;
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::StateChanged(state) => {
                tracing::info!(?state, "connection state changed");
                if state != ConnectionState::Active {
                    resync_after_sync = false;
                } else if pending_resync.load(Ordering::Relaxed) {
                    if expects_sync {
                        // The engine's sync lands first; the mirror
                        // snapshot is taken after that merge, so entries
                        // the engine holds keep its values and offline
                        // edits only fill in what it never set
                        resync_after_sync = true;
                    } else {
                        pending_resync.store(false, Ordering::Relaxed);
                        send_resync(&hub, &sender, &pending_resync);
                    }
                }
            }
            ConnectionEvent::Received(message) => match message {
                Message::ControlParameters(ref control) => {
                    if let Err(e) = hub.apply_control(control, connection_id) {
                        tracing::warn!("engine control snapshot rejected by mirror: {}", e);
                    }
                    if resync_after_sync {
                        resync_after_sync = false;
                        pending_resync.store(false, Ordering::Relaxed);
                        send_resync(&hub, &sender, &pending_resync);
                    }
                }
                Message::ReinitIoCount { inputs, outputs } => {
                    if let Err(e) = hub.reinit_io_count(inputs, outputs, connection_id) {
                        tracing::warn!("engine io count rejected by mirror: {}", e);
                    }
                }
                Message::EnvironmentParameters(env) => {
                    *shared.environment.lock() = env;
                }
                Message::AnalyzerParameters {
                    sample_rate,
                    max_block_size,
                } => {
                    *shared.analyzer.lock() = Some(RemoteAnalyzerInfo {
                        sample_rate,
                        max_block_size,
                    });
                }
                ref buffer @ Message::AudioBuffer { .. } => {
                    let min_db = shared.environment.lock().min_db;
                    match LevelSnapshot::from_message(buffer, min_db) {
                        Some((Direction::Input, snapshot)) => {
                            *shared.input_levels.lock() = Some(snapshot);
                        }
                        Some((Direction::Output, snapshot)) => {
                            *shared.output_levels.lock() = Some(snapshot);
                        }
                        None => tracing::debug!("ignoring malformed metering buffer"),
                    }
                }
                Message::TrafficSelection(_) => {
                    tracing::debug!("ignoring traffic selection from engine");
                }
            },
        }
    }
}
