//! Message serialization
//!
//! Produces the `[tag][payload]` layout documented in [`super`]. Encoding
//! never fails for a constructible [`Message`]; validation lives on the
//! decode side.

use bytes::{BufMut, Bytes, BytesMut};

use super::{
    ControlParameters, Message, TAG_ANALYZER_PARAMETERS, TAG_AUDIO_BUFFER, TAG_CONTROL_PARAMETERS,
    TAG_ENVIRONMENT, TAG_REINIT_IO_COUNT, TAG_TRAFFIC_SELECTION,
};

/// Serialize a message into its wire representation
pub fn encode(message: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(encoded_size_hint(message));

    match message {
        Message::EnvironmentParameters(env) => {
            buf.put_u8(TAG_ENVIRONMENT);
            buf.put_u8(env.palette);
            buf.put_f32_le(env.min_db);
        }
        Message::ReinitIoCount { inputs, outputs } => {
            buf.put_u8(TAG_REINIT_IO_COUNT);
            buf.put_u16_le(*inputs);
            buf.put_u16_le(*outputs);
        }
        Message::AnalyzerParameters {
            sample_rate,
            max_block_size,
        } => {
            buf.put_u8(TAG_ANALYZER_PARAMETERS);
            buf.put_u32_le(*sample_rate);
            buf.put_u32_le(*max_block_size);
        }
        Message::AudioBuffer {
            direction,
            channels,
            frames,
            samples,
        } => {
            buf.put_u8(TAG_AUDIO_BUFFER);
            buf.put_u8(*direction as u8);
            buf.put_u16_le(*channels);
            buf.put_u32_le(*frames);
            for sample in samples {
                buf.put_f32_le(*sample);
            }
        }
        Message::ControlParameters(control) => {
            buf.put_u8(TAG_CONTROL_PARAMETERS);
            put_control(&mut buf, control);
        }
        Message::TrafficSelection(types) => {
            buf.put_u8(TAG_TRAFFIC_SELECTION);
            buf.put_u8(types.len() as u8);
            for ty in types {
                buf.put_u8(ty.tag());
            }
        }
    }

    buf.freeze()
}

fn put_control(buf: &mut BytesMut, control: &ControlParameters) {
    buf.put_u16_le(control.input_mutes.len() as u16);
    for (channel, muted) in &control.input_mutes {
        buf.put_u16_le(*channel);
        buf.put_u8(u8::from(*muted));
    }

    buf.put_u16_le(control.output_mutes.len() as u16);
    for (channel, muted) in &control.output_mutes {
        buf.put_u16_le(*channel);
        buf.put_u8(u8::from(*muted));
    }

    buf.put_u32_le(control.crosspoint_enables.len() as u32);
    for ((input, output), enabled) in &control.crosspoint_enables {
        buf.put_u16_le(*input);
        buf.put_u16_le(*output);
        buf.put_u8(u8::from(*enabled));
    }

    buf.put_u32_le(control.crosspoint_gains.len() as u32);
    for ((input, output), gain) in &control.crosspoint_gains {
        buf.put_u16_le(*input);
        buf.put_u16_le(*output);
        buf.put_f32_le(*gain);
    }
}

fn encoded_size_hint(message: &Message) -> usize {
    match message {
        Message::EnvironmentParameters(_) => 6,
        Message::ReinitIoCount { .. } => 5,
        Message::AnalyzerParameters { .. } => 9,
        Message::AudioBuffer { samples, .. } => 8 + samples.len() * 4,
        Message::ControlParameters(c) => {
            13 + (c.input_mutes.len() + c.output_mutes.len()) * 3
                + c.crosspoint_enables.len() * 5
                + c.crosspoint_gains.len() * 8
        }
        Message::TrafficSelection(types) => 2 + types.len(),
    }
}
