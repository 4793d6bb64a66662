//! Error types for the matrix remote application

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Matrix error: {0}")]
    Matrix(#[from] MatrixError),

    #[error("Analyzer error: {0}")]
    Analyzer(#[from] AnalyzerError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Message (de)serialization errors
///
/// A decode error is always recovered locally: the offending message is
/// discarded and logged, the connection stays open.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Unknown message tag: 0x{0:02x}")]
    UnknownTag(u8),

    #[error("Truncated message: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("Declared length disagrees with buffer: declared {declared}, actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Trailing bytes after payload: {0}")]
    TrailingBytes(usize),

    #[error("Invalid field value: {0}")]
    InvalidValue(String),

    #[error("Message too large: {0} bytes")]
    TooLarge(usize),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connect timed out after {0} ms")]
    ConnectTimeout(u64),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Connection task is not running")]
    NotRunning,
}

/// Service discovery errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// The well-known discovery port is already bound by another local
    /// listener. Surfaced to the caller for a retry/abort decision rather
    /// than retried silently.
    #[error("Discovery port {0} is already in use")]
    PortInUse(u16),

    #[error("Socket setup failed: {0}")]
    SocketSetup(String),

    #[error("Malformed announcement")]
    MalformedAnnouncement,
}

/// Crosspoint matrix errors
#[derive(Error, Debug)]
pub enum MatrixError {
    #[error("Input channel {channel} out of range 1..={count}")]
    InputOutOfRange { channel: u16, count: u16 },

    #[error("Output channel {channel} out of range 1..={count}")]
    OutputOutOfRange { channel: u16, count: u16 },

    #[error("Invalid gain {0}: must be finite and within [0, 1]")]
    InvalidGain(f32),

    #[error("Invalid channel count: inputs and outputs must be non-zero")]
    InvalidIoCount,
}

/// Level analyzer errors
#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("Analyzer parameters not initialized")]
    NotInitialized,

    #[error("Block of {frames} frames exceeds declared maximum {max}")]
    BlockTooLarge { frames: usize, max: usize },

    #[error("Block has {got} channels, analyzer configured for {expected}")]
    ChannelMismatch { got: u16, expected: u16 },

    #[error("Block sample count {samples} is not channels x frames")]
    MalformedBlock { samples: usize },
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
