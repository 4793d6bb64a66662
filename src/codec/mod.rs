//! Tagged binary message format for the control/data stream
//!
//! Every message on the wire is `[tag: u8][payload]`, little-endian
//! throughout. Variable-length fields always carry an explicit count, never
//! a delimiter, so arbitrary binary audio content passes through unharmed.
//! The stream framing layer ([`crate::network::frame`]) prefixes each
//! message with its total length, so the decoder always sees exactly one
//! complete message.
//!
//! Deserialization is total: any input that does not match a known tag, or
//! whose declared counts disagree with the actual buffer size, yields a
//! [`CodecError`](crate::error::CodecError) and the message is discarded by
//! the caller.
//!
//! `AudioBuffer` samples are **channel-major**: all frames of channel 0,
//! then all frames of channel 1, and so on, since remote reconstruction
//! indexes by `[channel][frame]`.

pub mod decoder;
pub mod encoder;

pub use decoder::decode;
pub use encoder::encode;

use std::collections::{BTreeMap, BTreeSet};

pub(crate) const TAG_ENVIRONMENT: u8 = 0x01;
pub(crate) const TAG_REINIT_IO_COUNT: u8 = 0x02;
pub(crate) const TAG_ANALYZER_PARAMETERS: u8 = 0x03;
pub(crate) const TAG_AUDIO_BUFFER: u8 = 0x04;
pub(crate) const TAG_CONTROL_PARAMETERS: u8 = 0x05;
pub(crate) const TAG_TRAFFIC_SELECTION: u8 = 0x06;

/// Discriminant of a [`Message`], used for traffic subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MessageType {
    EnvironmentParameters,
    ReinitIoCount,
    AnalyzerParameters,
    AudioBuffer,
    ControlParameters,
    TrafficSelection,
}

impl MessageType {
    /// Wire tag for this message type
    pub fn tag(self) -> u8 {
        match self {
            MessageType::EnvironmentParameters => TAG_ENVIRONMENT,
            MessageType::ReinitIoCount => TAG_REINIT_IO_COUNT,
            MessageType::AnalyzerParameters => TAG_ANALYZER_PARAMETERS,
            MessageType::AudioBuffer => TAG_AUDIO_BUFFER,
            MessageType::ControlParameters => TAG_CONTROL_PARAMETERS,
            MessageType::TrafficSelection => TAG_TRAFFIC_SELECTION,
        }
    }

    /// Map a wire tag back to a message type
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            TAG_ENVIRONMENT => Some(MessageType::EnvironmentParameters),
            TAG_REINIT_IO_COUNT => Some(MessageType::ReinitIoCount),
            TAG_ANALYZER_PARAMETERS => Some(MessageType::AnalyzerParameters),
            TAG_AUDIO_BUFFER => Some(MessageType::AudioBuffer),
            TAG_CONTROL_PARAMETERS => Some(MessageType::ControlParameters),
            TAG_TRAFFIC_SELECTION => Some(MessageType::TrafficSelection),
            _ => None,
        }
    }
}

/// Which side of the matrix an audio buffer belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input = 0,
    Output = 1,
}

impl Direction {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Direction::Input),
            1 => Some(Direction::Output),
            _ => None,
        }
    }
}

/// Remote UI environment hints pushed by the engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvironmentParameters {
    /// Palette/theme hint for remote surfaces
    pub palette: u8,
    /// Engine-wide metering floor; remote displays convert linear values to
    /// decibels against this floor
    pub min_db: f32,
}

/// Full matrix control state: mute maps plus crosspoint enable/gain maps
///
/// Channel indices are 1-based, matching the matrix data model. The maps
/// are sparse: a channel or crosspoint absent from a map is at its default
/// (unmuted, disabled, gain 0).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlParameters {
    pub input_mutes: BTreeMap<u16, bool>,
    pub output_mutes: BTreeMap<u16, bool>,
    pub crosspoint_enables: BTreeMap<(u16, u16), bool>,
    pub crosspoint_gains: BTreeMap<(u16, u16), f32>,
}

/// A control/data message exchanged between engine and clients
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Remote UI theme hint and display floor
    EnvironmentParameters(EnvironmentParameters),
    /// New matrix input/output channel counts
    ReinitIoCount { inputs: u16, outputs: u16 },
    /// Analyzer configuration established by the engine
    AnalyzerParameters {
        sample_rate: u32,
        max_block_size: u32,
    },
    /// Multichannel float samples, channel-major
    AudioBuffer {
        direction: Direction,
        channels: u16,
        frames: u32,
        samples: Vec<f32>,
    },
    /// Mute and crosspoint state
    ControlParameters(ControlParameters),
    /// The set of message types a client wishes to receive
    TrafficSelection(BTreeSet<MessageType>),
}

impl Message {
    /// The type discriminant of this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::EnvironmentParameters(_) => MessageType::EnvironmentParameters,
            Message::ReinitIoCount { .. } => MessageType::ReinitIoCount,
            Message::AnalyzerParameters { .. } => MessageType::AnalyzerParameters,
            Message::AudioBuffer { .. } => MessageType::AudioBuffer,
            Message::ControlParameters(_) => MessageType::ControlParameters,
            Message::TrafficSelection(_) => MessageType::TrafficSelection,
        }
    }
}
