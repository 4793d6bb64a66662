//! Network subsystem: stream framing, per-client traffic filtering, the
//! engine-side control server and the client-side connection state machine

pub mod connection;
pub mod frame;
pub mod server;
pub mod subscription;

pub use connection::{ConnectionEvent, ConnectionState, MessageSender, RemoteConnection};
pub use server::{ClientEvent, ClientEventKind, MatrixServer};
pub use subscription::Subscription;
