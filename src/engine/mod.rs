//! Engine-side context
//!
//! `MatrixEngine` wires the whole engine together: the crosspoint matrix
//! behind a `CommanderHub`, one level analyzer per matrix side, the TCP
//! control server and the UDP announcer. It is an owned value constructed
//! from an [`AppConfig`]; nothing here is process-global, so tests and
//! embedders can run several engines side by side.
//!
//! Inbound control flows through the hub tagged with the sending client's
//! id; the client forwarder rebroadcasts the resulting snapshot to every
//! other subscribed client and never back to the originator.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::analyzer::{AudioBlock, LevelAnalyzer};
use crate::codec::{Direction, EnvironmentParameters, Message};
use crate::config::AppConfig;
use crate::constants::{DEFAULT_MAX_BLOCK_SIZE, DEFAULT_SAMPLE_RATE, SERVICE_TYPE_UID};
use crate::discovery::{Announcer, Service};
use crate::error::Result;
use crate::matrix::commander::{CommanderHub, MatrixChange, MatrixListener, OriginatorId};
use crate::matrix::CrosspointMatrix;
use crate::network::{ClientEvent, ClientEventKind, MatrixServer, Subscription};

/// Owned engine context
pub struct MatrixEngine {
    hub: Arc<CommanderHub>,
    input_analyzer: Arc<LevelAnalyzer>,
    output_analyzer: Arc<LevelAnalyzer>,
    server: Arc<MatrixServer>,
    announcer: Announcer,
    environment: EnvironmentParameters,
    shutdown: watch::Sender<bool>,
    dispatch: JoinHandle<()>,
    metering: JoinHandle<()>,
}

impl MatrixEngine {
    /// Bind the control port, start announcing on the discovery port and
    /// spawn the dispatch and metering tasks
    pub async fn start(config: AppConfig) -> Result<Self> {
        let matrix = CrosspointMatrix::new(config.engine.inputs, config.engine.outputs)?;
        let hub = CommanderHub::new(matrix);

        let environment = EnvironmentParameters {
            palette: config.engine.palette,
            min_db: config.engine.min_db,
        };

        // Analyzers come up with nominal audio parameters so metering and
        // initial sync are well-defined before the audio host attaches;
        // `initialize_audio` replaces them with the real ones.
        let input_analyzer = Arc::new(LevelAnalyzer::new(config.engine.min_db));
        let output_analyzer = Arc::new(LevelAnalyzer::new(config.engine.min_db));
        input_analyzer.initialize_parameters(
            DEFAULT_SAMPLE_RATE,
            DEFAULT_MAX_BLOCK_SIZE,
            config.engine.inputs,
        );
        output_analyzer.initialize_parameters(
            DEFAULT_SAMPLE_RATE,
            DEFAULT_MAX_BLOCK_SIZE,
            config.engine.outputs,
        );

        let (server, events) = MatrixServer::bind(config.engine.control_port).await?;
        let server = Arc::new(server);

        // Host field stays unspecified; browsers substitute the datagram
        // source address, which is the one that is actually reachable.
        let service = Service {
            id: Uuid::new_v4().to_string(),
            name: config.engine.name.clone(),
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: server.local_addr().port(),
            type_uid: SERVICE_TYPE_UID.to_string(),
        };
        let announcer = Announcer::start(
            service,
            config.discovery.port,
            Duration::from_millis(config.discovery.announce_interval_ms),
        )?;

        hub.register_listener(Arc::new(ClientForwarder {
            hub: Arc::downgrade(&hub),
            server: Arc::downgrade(&server),
        }));

        let (shutdown, _) = watch::channel(false);
        let dispatch = tokio::spawn(dispatch_loop(DispatchContext {
            events,
            hub: hub.clone(),
            server: server.clone(),
            input_analyzer: input_analyzer.clone(),
            output_analyzer: output_analyzer.clone(),
            environment,
            shutdown: shutdown.subscribe(),
        }));
        let metering = tokio::spawn(metering_loop(
            server.clone(),
            input_analyzer.clone(),
            output_analyzer.clone(),
            Duration::from_millis(config.engine.metering_interval_ms.max(1)),
            shutdown.subscribe(),
        ));

        Ok(Self {
            hub,
            input_analyzer,
            output_analyzer,
            server,
            announcer,
            environment,
            shutdown,
            dispatch,
            metering,
        })
    }

    pub fn hub(&self) -> &Arc<CommanderHub> {
        &self.hub
    }

    pub fn environment(&self) -> EnvironmentParameters {
        self.environment
    }

    /// Port the control server actually bound (useful with port 0)
    pub fn control_port(&self) -> u16 {
        self.server.local_addr().port()
    }

    pub fn client_count(&self) -> usize {
        self.server.client_count()
    }

    /// Called by the audio host once the stream format is known.
    /// Re-initializes both analyzers and announces the new parameters.
    pub fn initialize_audio(&self, sample_rate: u32, max_block_size: u32) {
        let (inputs, outputs) = self.hub.io_count();
        self.input_analyzer
            .initialize_parameters(sample_rate, max_block_size, inputs);
        self.output_analyzer
            .initialize_parameters(sample_rate, max_block_size, outputs);
        self.server.broadcast(&Message::AnalyzerParameters {
            sample_rate,
            max_block_size,
        });
    }

    /// Audio-callback entry point for the input side
    pub fn analyze_input_block(&self, block: &AudioBlock<'_>) -> Result<()> {
        Ok(self.input_analyzer.analyze_data(block)?)
    }

    /// Audio-callback entry point for the output side
    pub fn analyze_output_block(&self, block: &AudioBlock<'_>) -> Result<()> {
        Ok(self.output_analyzer.analyze_data(block)?)
    }

    pub fn skipped_blocks(&self) -> u64 {
        self.input_analyzer.skipped_blocks() + self.output_analyzer.skipped_blocks()
    }

    /// Stop announcing, dispatching and metering, then tear the server down
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.dispatch.await;
        let _ = self.metering.await;
        self.announcer.stop().await;
        if let Some(server) = Arc::into_inner(self.server) {
            server.stop().await;
        }
    }
}

/// Rebroadcasts matrix changes to every subscribed client except the one
/// that caused them
struct ClientForwarder {
    hub: Weak<CommanderHub>,
    server: Weak<MatrixServer>,
}

impl MatrixListener for ClientForwarder {
    fn matrix_changed(&self, change: &MatrixChange, originator: OriginatorId) {
        let (Some(hub), Some(server)) = (self.hub.upgrade(), self.server.upgrade()) else {
            return;
        };
        let message = match change {
            MatrixChange::IoCount { inputs, outputs } => Message::ReinitIoCount {
                inputs: *inputs,
                outputs: *outputs,
            },
            _ => Message::ControlParameters(hub.snapshot()),
        };
        server.broadcast_except(originator, &message);
    }
}

struct DispatchContext {
    events: mpsc::Receiver<ClientEvent>,
    hub: Arc<CommanderHub>,
    server: Arc<MatrixServer>,
    input_analyzer: Arc<LevelAnalyzer>,
    output_analyzer: Arc<LevelAnalyzer>,
    environment: EnvironmentParameters,
    shutdown: watch::Receiver<bool>,
}

async fn dispatch_loop(mut ctx: DispatchContext) {
    loop {
        tokio::select! {
            event = ctx.events.recv() => match event {
                Some(event) => handle_client_event(&ctx, event),
                None => break,
            },
            _ = ctx.shutdown.changed() => break,
        }
    }
}

fn handle_client_event(ctx: &DispatchContext, event: ClientEvent) {
    let client = event.client;
    match event.kind {
        ClientEventKind::Connected(addr) => {
            tracing::info!(%client, %addr, "client connected");
        }
        ClientEventKind::Disconnected => {
            tracing::info!(%client, "client disconnected");
        }
        ClientEventKind::Message(message) => handle_client_message(ctx, client, message),
    }
}

fn handle_client_message(ctx: &DispatchContext, client: Uuid, message: Message) {
    match message {
        Message::TrafficSelection(types) => {
            ctx.server.set_subscription(client, Subscription::new(types));
            initial_sync(ctx, client);
        }
        Message::ControlParameters(ref control) => {
            // All-or-nothing: a rejected snapshot leaves the matrix exactly
            // as it was, and the connection stays open
            if let Err(e) = ctx.hub.apply_control(control, client) {
                tracing::warn!(%client, "rejected control message: {}", e);
            }
        }
        Message::ReinitIoCount { inputs, outputs } => {
            match ctx.hub.reinit_io_count(inputs, outputs, client) {
                Ok(()) => {
                    let sample_rate = ctx.input_analyzer.sample_rate();
                    let max_block_size = ctx.input_analyzer.max_block_size();
                    ctx.input_analyzer
                        .initialize_parameters(sample_rate, max_block_size, inputs);
                    ctx.output_analyzer
                        .initialize_parameters(sample_rate, max_block_size, outputs);
                }
                Err(e) => tracing::warn!(%client, "rejected io count change: {}", e),
            }
        }
        // Clients do not inject audio or engine-side parameters
        other => {
            tracing::debug!(%client, kind = ?other.message_type(), "ignoring message from client");
        }
    }
}

/// Bring a freshly subscribed client up to date. Every sync message runs
/// through the client's new subscription like any other traffic.
fn initial_sync(ctx: &DispatchContext, client: Uuid) {
    let (inputs, outputs) = ctx.hub.io_count();
    ctx.server
        .send_to(client, &Message::EnvironmentParameters(ctx.environment));
    ctx.server
        .send_to(client, &Message::ReinitIoCount { inputs, outputs });
    ctx.server.send_to(
        client,
        &Message::AnalyzerParameters {
            sample_rate: ctx.input_analyzer.sample_rate(),
            max_block_size: ctx.input_analyzer.max_block_size(),
        },
    );
    ctx.server
        .send_to(client, &Message::ControlParameters(ctx.hub.snapshot()));
}

async fn metering_loop(
    server: Arc<MatrixServer>,
    input_analyzer: Arc<LevelAnalyzer>,
    output_analyzer: Arc<LevelAnalyzer>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(snapshot) = input_analyzer.take_snapshot() {
                    server.broadcast(&snapshot.into_message(Direction::Input));
                }
                if let Some(snapshot) = output_analyzer.take_snapshot() {
                    server.broadcast(&snapshot.into_message(Direction::Output));
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ControlParameters, MessageType};
    use crate::network::frame;
    use std::time::Duration;
    use tokio::net::TcpStream;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        // Ephemeral ports so tests can run in parallel
        config.engine.control_port = 0;
        config.discovery.port = 0;
        config.engine.metering_interval_ms = 20;
        config
    }

    async fn connect_and_subscribe(
        port: u16,
        types: &[MessageType],
    ) -> TcpStream {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let selection = Message::TrafficSelection(types.iter().copied().collect());
        frame::write_message(&mut stream, &selection).await.unwrap();
        stream
    }

    async fn read_with_timeout(stream: &mut TcpStream) -> Message {
        tokio::time::timeout(Duration::from_secs(5), frame::read_message(stream))
            .await
            .expect("timed out waiting for message")
            .expect("read failed")
    }

    #[tokio::test]
    async fn test_initial_sync_respects_subscription() {
        let engine = MatrixEngine::start(test_config()).await.unwrap();
        let mut stream = connect_and_subscribe(
            engine.control_port(),
            &[MessageType::ReinitIoCount, MessageType::ControlParameters],
        )
        .await;

        // Environment and analyzer parameters are filtered out by the
        // subscription; the sync starts with the io count
        let first = read_with_timeout(&mut stream).await;
        assert_eq!(first, Message::ReinitIoCount { inputs: 8, outputs: 4 });
        let second = read_with_timeout(&mut stream).await;
        assert!(matches!(second, Message::ControlParameters(_)));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_control_applied_and_forwarded_except_originator() {
        let engine = MatrixEngine::start(test_config()).await.unwrap();
        let port = engine.control_port();

        let mut originator =
            connect_and_subscribe(port, &[MessageType::ControlParameters]).await;
        let _sync = read_with_timeout(&mut originator).await;

        let mut observer =
            connect_and_subscribe(port, &[MessageType::ControlParameters]).await;
        let _sync = read_with_timeout(&mut observer).await;

        let mut control = ControlParameters::default();
        control.crosspoint_enables.insert((3, 2), true);
        control.crosspoint_gains.insert((3, 2), 0.75);
        frame::write_message(&mut originator, &Message::ControlParameters(control))
            .await
            .unwrap();

        // Observer receives the fresh snapshot
        match read_with_timeout(&mut observer).await {
            Message::ControlParameters(snapshot) => {
                assert_eq!(snapshot.crosspoint_gains.get(&(3, 2)), Some(&0.75));
            }
            other => panic!("expected control snapshot, got {:?}", other),
        }
        let state = engine.hub().with_matrix(|m| m.crosspoint(3, 2));
        assert!(state.enabled);
        assert_eq!(state.gain, 0.75);

        // The originator must not see an echo: the next thing it receives
        // is a later, unrelated change made engine-side
        engine
            .hub()
            .reinit_io_count(10, 4, Uuid::new_v4())
            .unwrap();
        // ReinitIoCount is not in the originator's subscription, so trigger
        // a control change as the distinguishable follow-up
        let marker = Uuid::new_v4();
        crate::matrix::commander::InputCommander::new(engine.hub().clone())
            .set_mute(1, true, marker)
            .unwrap();
        match read_with_timeout(&mut originator).await {
            Message::ControlParameters(snapshot) => {
                assert_eq!(snapshot.input_mutes.get(&1), Some(&true));
            }
            other => panic!("expected follow-up snapshot, got {:?}", other),
        }

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_out_of_range_control_rejected_connection_survives() {
        let engine = MatrixEngine::start(test_config()).await.unwrap();
        let mut stream =
            connect_and_subscribe(engine.control_port(), &[MessageType::ControlParameters])
                .await;
        let _sync = read_with_timeout(&mut stream).await;

        // Output 9 does not exist on an 8x4 matrix
        let mut bad = ControlParameters::default();
        bad.crosspoint_enables.insert((1, 9), true);
        bad.input_mutes.insert(1, true);
        frame::write_message(&mut stream, &Message::ControlParameters(bad))
            .await
            .unwrap();

        // All-or-nothing: the valid mute in the same snapshot was not applied
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!engine.hub().with_matrix(|m| m.input_mute(1)));

        // Connection stayed open; a valid snapshot still goes through
        let mut good = ControlParameters::default();
        good.input_mutes.insert(1, true);
        frame::write_message(&mut stream, &Message::ControlParameters(good))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !engine.hub().with_matrix(|m| m.input_mute(1)) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("valid snapshot after rejection was not applied");

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_metering_reaches_subscribed_client() {
        let engine = MatrixEngine::start(test_config()).await.unwrap();
        engine.initialize_audio(48_000, 512);

        let mut stream =
            connect_and_subscribe(engine.control_port(), &[MessageType::AudioBuffer]).await;

        // Feed the input analyzer a known block: channel 0 peaks at 0.5
        let samples: Vec<f32> = std::iter::repeat(0.5)
            .take(4)
            .chain(std::iter::repeat(0.0).take(4 * 7))
            .collect();
        let block = AudioBlock::new(&samples, 8, 4);
        engine.analyze_input_block(&block).unwrap();

        // The metering timer broadcasts snapshots until we see one that
        // contains the block (early ticks may predate analyze_data)
        let found = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let message = frame::read_message(&mut stream).await.unwrap();
                if let Some((Direction::Input, snapshot)) =
                    crate::analyzer::LevelSnapshot::from_message(&message, -100.0)
                {
                    if snapshot.peak[0] >= 0.5 {
                        break snapshot;
                    }
                }
            }
        })
        .await
        .expect("metering snapshot never arrived");
        assert_eq!(found.peak.len(), 8);
        assert!((found.peak[0] - 0.5).abs() < 1e-6);

        engine.shutdown().await;
    }
}
