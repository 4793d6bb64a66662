//! Message deserialization
//!
//! Total over arbitrary input: every malformed buffer maps to a
//! [`CodecError`], whether an unknown tag, truncation, declared counts that
//! disagree with the buffer size, trailing bytes, or invalid enum bytes.
//! Nothing here panics on wire data.

use bytes::Buf;
use std::collections::BTreeSet;

use crate::error::CodecError;

use super::{
    ControlParameters, Direction, EnvironmentParameters, Message, MessageType,
    TAG_ANALYZER_PARAMETERS, TAG_AUDIO_BUFFER, TAG_CONTROL_PARAMETERS, TAG_ENVIRONMENT,
    TAG_REINIT_IO_COUNT, TAG_TRAFFIC_SELECTION,
};

/// Deserialize one complete message from its wire representation
pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    let mut buf = bytes;

    let tag = take_u8(&mut buf)?;
    let message = match tag {
        TAG_ENVIRONMENT => Message::EnvironmentParameters(EnvironmentParameters {
            palette: take_u8(&mut buf)?,
            min_db: take_f32(&mut buf)?,
        }),
        TAG_REINIT_IO_COUNT => Message::ReinitIoCount {
            inputs: take_u16(&mut buf)?,
            outputs: take_u16(&mut buf)?,
        },
        TAG_ANALYZER_PARAMETERS => Message::AnalyzerParameters {
            sample_rate: take_u32(&mut buf)?,
            max_block_size: take_u32(&mut buf)?,
        },
        TAG_AUDIO_BUFFER => decode_audio_buffer(&mut buf)?,
        TAG_CONTROL_PARAMETERS => Message::ControlParameters(decode_control(&mut buf)?),
        TAG_TRAFFIC_SELECTION => decode_traffic_selection(&mut buf)?,
        other => return Err(CodecError::UnknownTag(other)),
    };

    if !buf.is_empty() {
        return Err(CodecError::TrailingBytes(buf.len()));
    }

    Ok(message)
}

fn decode_audio_buffer(buf: &mut &[u8]) -> Result<Message, CodecError> {
    let direction_byte = take_u8(buf)?;
    let direction = Direction::from_byte(direction_byte)
        .ok_or_else(|| CodecError::InvalidValue(format!("direction byte {direction_byte}")))?;

    let channels = take_u16(buf)?;
    let frames = take_u32(buf)?;

    let declared = (channels as usize)
        .checked_mul(frames as usize)
        .and_then(|n| n.checked_mul(4))
        .ok_or(CodecError::TooLarge(usize::MAX))?;
    if declared != buf.len() {
        return Err(CodecError::LengthMismatch {
            declared,
            actual: buf.len(),
        });
    }

    let mut samples = Vec::with_capacity(channels as usize * frames as usize);
    while buf.has_remaining() {
        samples.push(buf.get_f32_le());
    }

    Ok(Message::AudioBuffer {
        direction,
        channels,
        frames,
        samples,
    })
}

fn decode_control(buf: &mut &[u8]) -> Result<ControlParameters, CodecError> {
    let mut control = ControlParameters::default();

    let input_count = take_u16(buf)?;
    for _ in 0..input_count {
        let channel = take_u16(buf)?;
        let muted = take_bool(buf)?;
        control.input_mutes.insert(channel, muted);
    }

    let output_count = take_u16(buf)?;
    for _ in 0..output_count {
        let channel = take_u16(buf)?;
        let muted = take_bool(buf)?;
        control.output_mutes.insert(channel, muted);
    }

    let enable_count = take_u32(buf)?;
    for _ in 0..enable_count {
        let input = take_u16(buf)?;
        let output = take_u16(buf)?;
        let enabled = take_bool(buf)?;
        control.crosspoint_enables.insert((input, output), enabled);
    }

    let gain_count = take_u32(buf)?;
    for _ in 0..gain_count {
        let input = take_u16(buf)?;
        let output = take_u16(buf)?;
        let gain = take_f32(buf)?;
        if !gain.is_finite() || !(0.0..=1.0).contains(&gain) {
            return Err(CodecError::InvalidValue(format!(
                "crosspoint gain {gain} outside [0, 1]"
            )));
        }
        control.crosspoint_gains.insert((input, output), gain);
    }

    Ok(control)
}

fn decode_traffic_selection(buf: &mut &[u8]) -> Result<Message, CodecError> {
    let count = take_u8(buf)?;
    let mut types = BTreeSet::new();
    for _ in 0..count {
        let tag = take_u8(buf)?;
        let ty = MessageType::from_tag(tag).ok_or(CodecError::UnknownTag(tag))?;
        types.insert(ty);
    }
    Ok(Message::TrafficSelection(types))
}

fn ensure(buf: &[u8], needed: usize) -> Result<(), CodecError> {
    if buf.len() < needed {
        Err(CodecError::Truncated {
            needed: needed - buf.len(),
        })
    } else {
        Ok(())
    }
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, CodecError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn take_bool(buf: &mut &[u8]) -> Result<bool, CodecError> {
    match take_u8(buf)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(CodecError::InvalidValue(format!("bool byte {other}"))),
    }
}

fn take_u16(buf: &mut &[u8]) -> Result<u16, CodecError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16_le())
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, CodecError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32_le())
}

fn take_f32(buf: &mut &[u8]) -> Result<f32, CodecError> {
    ensure(buf, 4)?;
    Ok(buf.get_f32_le())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use proptest::prelude::*;

    fn roundtrip(message: Message) {
        let encoded = encode(&message);
        let decoded = decode(&encoded).expect("decode failed");
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_roundtrip_environment() {
        roundtrip(Message::EnvironmentParameters(EnvironmentParameters {
            palette: 2,
            min_db: -100.0,
        }));
    }

    #[test]
    fn test_roundtrip_reinit_io_count() {
        roundtrip(Message::ReinitIoCount {
            inputs: 8,
            outputs: 4,
        });
    }

    #[test]
    fn test_roundtrip_analyzer_parameters() {
        roundtrip(Message::AnalyzerParameters {
            sample_rate: 48000,
            max_block_size: 4096,
        });
    }

    #[test]
    fn test_roundtrip_empty_audio_buffer() {
        roundtrip(Message::AudioBuffer {
            direction: Direction::Input,
            channels: 0,
            frames: 0,
            samples: vec![],
        });
    }

    #[test]
    fn test_roundtrip_audio_buffer() {
        roundtrip(Message::AudioBuffer {
            direction: Direction::Output,
            channels: 2,
            frames: 3,
            samples: vec![0.0, 0.5, -0.5, 1.0, -1.0, 0.25],
        });
    }

    #[test]
    fn test_roundtrip_control_parameters() {
        let mut control = ControlParameters::default();
        control.input_mutes.insert(1, true);
        control.input_mutes.insert(3, false);
        control.output_mutes.insert(2, true);
        control.crosspoint_enables.insert((3, 2), true);
        control.crosspoint_gains.insert((3, 2), 0.75);
        control.crosspoint_gains.insert((1, 1), 0.0);
        roundtrip(Message::ControlParameters(control));
    }

    #[test]
    fn test_roundtrip_traffic_selection() {
        let types: BTreeSet<MessageType> =
            [MessageType::ReinitIoCount, MessageType::ControlParameters]
                .into_iter()
                .collect();
        roundtrip(Message::TrafficSelection(types));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(matches!(
            decode(&[0xff, 0, 0]),
            Err(CodecError::UnknownTag(0xff))
        ));
    }

    #[test]
    fn test_empty_input_rejected() {
        assert!(matches!(decode(&[]), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let encoded = encode(&Message::ReinitIoCount {
            inputs: 8,
            outputs: 4,
        });
        assert!(decode(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut encoded = encode(&Message::ReinitIoCount {
            inputs: 8,
            outputs: 4,
        })
        .to_vec();
        encoded.push(0);
        assert!(matches!(
            decode(&encoded),
            Err(CodecError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_audio_buffer_length_mismatch_rejected() {
        // Header claims 2 channels x 4 frames but carries no samples
        let mut bytes = vec![TAG_AUDIO_BUFFER, 0];
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&4u32.to_le_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(CodecError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_direction_rejected() {
        let mut bytes = vec![TAG_AUDIO_BUFFER, 7];
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        assert!(matches!(decode(&bytes), Err(CodecError::InvalidValue(_))));
    }

    #[test]
    fn test_out_of_range_gain_rejected() {
        let mut control = ControlParameters::default();
        control.crosspoint_gains.insert((1, 1), 0.5);
        let mut encoded = encode(&Message::ControlParameters(control)).to_vec();
        // Patch the trailing gain f32 to 2.0
        let len = encoded.len();
        encoded[len - 4..].copy_from_slice(&2.0f32.to_le_bytes());
        assert!(matches!(decode(&encoded), Err(CodecError::InvalidValue(_))));
    }

    fn arb_message_type() -> impl Strategy<Value = MessageType> {
        prop_oneof![
            Just(MessageType::EnvironmentParameters),
            Just(MessageType::ReinitIoCount),
            Just(MessageType::AnalyzerParameters),
            Just(MessageType::AudioBuffer),
            Just(MessageType::ControlParameters),
            Just(MessageType::TrafficSelection),
        ]
    }

    fn arb_control() -> impl Strategy<Value = ControlParameters> {
        (
            prop::collection::btree_map(1u16..=64, any::<bool>(), 0..16),
            prop::collection::btree_map(1u16..=64, any::<bool>(), 0..16),
            prop::collection::btree_map((1u16..=64, 1u16..=64), any::<bool>(), 0..32),
            prop::collection::btree_map((1u16..=64, 1u16..=64), 0.0f32..=1.0, 0..32),
        )
            .prop_map(
                |(input_mutes, output_mutes, crosspoint_enables, crosspoint_gains)| {
                    ControlParameters {
                        input_mutes,
                        output_mutes,
                        crosspoint_enables,
                        crosspoint_gains,
                    }
                },
            )
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        prop_oneof![
            (any::<u8>(), -120.0f32..0.0).prop_map(|(palette, min_db)| {
                Message::EnvironmentParameters(EnvironmentParameters { palette, min_db })
            }),
            (any::<u16>(), any::<u16>())
                .prop_map(|(inputs, outputs)| Message::ReinitIoCount { inputs, outputs }),
            (1u32..=192_000, 1u32..=65_536).prop_map(|(sample_rate, max_block_size)| {
                Message::AnalyzerParameters {
                    sample_rate,
                    max_block_size,
                }
            }),
            (0u16..=8, 0u32..=64, any::<bool>()).prop_flat_map(|(channels, frames, out)| {
                let count = channels as usize * frames as usize;
                prop::collection::vec(-2.0f32..=2.0, count..=count).prop_map(move |samples| {
                    Message::AudioBuffer {
                        direction: if out { Direction::Output } else { Direction::Input },
                        channels,
                        frames,
                        samples,
                    }
                })
            }),
            arb_control().prop_map(Message::ControlParameters),
            prop::collection::btree_set(arb_message_type(), 0..6)
                .prop_map(Message::TrafficSelection),
        ]
    }

    proptest! {
        #[test]
        fn prop_roundtrip(message in arb_message()) {
            let encoded = encode(&message);
            let decoded = decode(&encoded).unwrap();
            prop_assert_eq!(decoded, message);
        }

        #[test]
        fn prop_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
            let _ = decode(&bytes);
        }
    }
}
