//! # LAN Matrix Remote
//!
//! Remote control and level metering for a multi-channel audio crosspoint
//! matrix over LAN.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           ENGINE HOST                            │
//! │                                                                  │
//! │  hardware audio callback                                         │
//! │        │                                                         │
//! │        ▼                                                         │
//! │  ┌───────────────┐    ┌───────────────┐    ┌──────────────────┐  │
//! │  │ LevelAnalyzer │    │ Crosspoint    │◄───│   Commanders     │  │
//! │  │ (in / out)    │    │ Matrix        │    │ (echo-suppressed)│  │
//! │  └──────┬────────┘    └──────┬────────┘    └────────▲─────────┘  │
//! │         │ snapshots          │ state changes        │ control    │
//! │         ▼                    ▼                      │            │
//! │  ┌─────────────────────────────────────────────────┴─────────┐  │
//! │  │        MatrixServer (TCP, per-client subscriptions)       │  │
//! │  └──────────────────────────────┬────────────────────────────┘  │
//! │  ┌───────────────┐              │                               │
//! │  │  Announcer    │              │ length-framed binary messages │
//! │  │  (UDP bcast)  │              │                               │
//! └──┴───────┬───────┴──────────────┼───────────────────────────────┘
//!            │ XML announcements    │
//!            ▼                      ▼
//! ┌──────────────────┐   ┌────────────────────────────────────────┐
//! │ ServiceBrowser   │──►│ RemoteConnection (Discovering →        │
//! │ (client)         │   │ Connecting → Active, 3s/5s timers)     │
//! └──────────────────┘   └──────────────┬─────────────────────────┘
//!                                       ▼
//!                        ┌────────────────────────────────────────┐
//!                        │ RemoteController (mirrored matrix,     │
//!                        │ meters, faders)                        │
//!                        └────────────────────────────────────────┘
//! ```
//!
//! The engine owns the matrix state and streams metering snapshots; clients
//! subscribe to the message types their role needs and push control changes
//! back. Every state-change notification carries the originator's identity
//! so a surface never reacts to the echo of its own change.

pub mod analyzer;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod matrix;
pub mod network;
pub mod remote;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for audio analysis
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default maximum audio block size accepted by the analyzers
    pub const DEFAULT_MAX_BLOCK_SIZE: u32 = 4096;

    /// Default matrix input channel count
    pub const DEFAULT_INPUT_COUNT: u16 = 8;

    /// Default matrix output channel count
    pub const DEFAULT_OUTPUT_COUNT: u16 = 4;

    /// Default metering floor in decibels; linear gain 0.0 maps here
    pub const DEFAULT_MIN_DB: f32 = -100.0;

    /// Default TCP port for the control/data stream
    pub const DEFAULT_CONTROL_PORT: u16 = 50000;

    /// Well-known UDP port for discovery announcements
    pub const DEFAULT_DISCOVERY_PORT: u16 = 50010;

    /// Minimum interval between discovery broadcasts
    pub const MIN_ANNOUNCE_INTERVAL_MS: u64 = 1500;

    /// Default interval between discovery broadcasts
    pub const DEFAULT_ANNOUNCE_INTERVAL_MS: u64 = 2000;

    /// A service expires after this many missed announce intervals
    pub const SERVICE_EXPIRY_INTERVALS: u32 = 3;

    /// Socket connect timeout
    pub const CONNECT_TIMEOUT_MS: u64 = 3000;

    /// Reconnect retry interval
    pub const RETRY_INTERVAL_MS: u64 = 5000;

    /// Default interval between metering snapshots
    pub const DEFAULT_METERING_INTERVAL_MS: u64 = 50;

    /// Peak-hold decay rate in dB per second
    pub const PEAK_HOLD_DECAY_DB_PER_SEC: f32 = 12.0;

    /// Upper bound on a single framed message
    pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

    /// Service type identifier carried in discovery announcements
    pub const SERVICE_TYPE_UID: &str = "crosspoint-matrix/1";
}
