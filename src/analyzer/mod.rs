//! Streaming audio level analysis
//!
//! Consumes raw audio blocks on the real-time callback path and maintains
//! per-channel peak / peak-hold / RMS accumulators. [`LevelAnalyzer::analyze_data`]
//! is callback-safe: it does bounded work, allocates nothing, and takes the
//! accumulator lock with `try_lock`, skipping the block (counted) instead
//! of stalling when the network thread holds it.
//!
//! Snapshots are taken at a bounded rate by the engine's metering timer,
//! decoupled from the audio block rate, and travel as `AudioBuffer`-class
//! messages. Sample values are linear engine-gain units; decibel conversion
//! is the consumer's job, against the shared `min_db` floor.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use crate::codec::{Direction, Message};
use crate::constants::PEAK_HOLD_DECAY_DB_PER_SEC;
use crate::error::AnalyzerError;

/// A raw multichannel audio block, channel-major: all frames of channel 0,
/// then channel 1, and so on. Matches the `AudioBuffer` wire layout.
pub struct AudioBlock<'a> {
    pub samples: &'a [f32],
    pub channels: u16,
    pub frames: usize,
}

impl<'a> AudioBlock<'a> {
    pub fn new(samples: &'a [f32], channels: u16, frames: usize) -> Self {
        Self {
            samples,
            channels,
            frames,
        }
    }

    fn channel(&self, index: usize) -> &[f32] {
        &self.samples[index * self.frames..(index + 1) * self.frames]
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ChannelAccumulator {
    /// Highest absolute sample since the last snapshot
    window_peak: f32,
    /// Decaying peak hold, refreshed whenever the window peak exceeds it
    hold: f32,
    sum_squares: f64,
    window_samples: u64,
}

struct AnalyzerState {
    channels: Vec<ChannelAccumulator>,
    last_snapshot: Instant,
}

/// Per-channel levels computed from one analysis window.
///
/// Transient: recomputed every window and immediately wrapped into an
/// `AudioBuffer`-class message ([`Self::into_message`]); it has no lifecycle
/// beyond the message that carries it.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelSnapshot {
    pub peak: Vec<f32>,
    pub hold: Vec<f32>,
    pub rms: Vec<f32>,
    /// Metering floor the consumer should convert against
    pub min_db: f32,
}

/// Frames per channel in a snapshot-carrying `AudioBuffer`:
/// frame 0 = peak, frame 1 = hold, frame 2 = rms
pub const SNAPSHOT_FRAMES: u32 = 3;

impl LevelSnapshot {
    pub fn channel_count(&self) -> usize {
        self.peak.len()
    }

    /// Wrap the snapshot into an `AudioBuffer` message for the given matrix
    /// side, 3 frames per channel (peak, hold, rms)
    pub fn into_message(self, direction: Direction) -> Message {
        let channels = self.peak.len();
        let mut samples = Vec::with_capacity(channels * SNAPSHOT_FRAMES as usize);
        for ch in 0..channels {
            samples.push(self.peak[ch]);
            samples.push(self.hold[ch]);
            samples.push(self.rms[ch]);
        }
        Message::AudioBuffer {
            direction,
            channels: channels as u16,
            frames: SNAPSHOT_FRAMES,
            samples,
        }
    }

    /// Reconstruct a snapshot from a metering `AudioBuffer`. Returns `None`
    /// for buffers that do not carry the 3-frame metering layout.
    pub fn from_message(message: &Message, min_db: f32) -> Option<(Direction, Self)> {
        let Message::AudioBuffer {
            direction,
            channels,
            frames,
            samples,
        } = message
        else {
            return None;
        };
        if *frames != SNAPSHOT_FRAMES
            || samples.len() != *channels as usize * SNAPSHOT_FRAMES as usize
        {
            return None;
        }

        let count = *channels as usize;
        let mut snapshot = LevelSnapshot {
            peak: Vec::with_capacity(count),
            hold: Vec::with_capacity(count),
            rms: Vec::with_capacity(count),
            min_db,
        };
        for ch in 0..count {
            let base = ch * SNAPSHOT_FRAMES as usize;
            snapshot.peak.push(samples[base]);
            snapshot.hold.push(samples[base + 1]);
            snapshot.rms.push(samples[base + 2]);
        }
        Some((*direction, snapshot))
    }
}

/// Running peak/RMS analyzer for one side of the matrix
pub struct LevelAnalyzer {
    /// 0 means uninitialized
    sample_rate: AtomicU32,
    max_block_size: AtomicU32,
    min_db: f32,
    state: Mutex<AnalyzerState>,
    skipped_blocks: AtomicU64,
}

impl LevelAnalyzer {
    pub fn new(min_db: f32) -> Self {
        Self {
            sample_rate: AtomicU32::new(0),
            max_block_size: AtomicU32::new(0),
            min_db,
            state: Mutex::new(AnalyzerState {
                channels: Vec::new(),
                last_snapshot: Instant::now(),
            }),
            skipped_blocks: AtomicU64::new(0),
        }
    }

    /// Establish sample rate, maximum block size and channel count. Must be
    /// called before [`Self::analyze_data`]; re-initialization resets all
    /// accumulators.
    pub fn initialize_parameters(&self, sample_rate: u32, max_block_size: u32, channels: u16) {
        let mut state = self.state.lock();
        state.channels.clear();
        state
            .channels
            .resize(channels as usize, ChannelAccumulator::default());
        state.last_snapshot = Instant::now();
        self.sample_rate.store(sample_rate, Ordering::Release);
        self.max_block_size.store(max_block_size, Ordering::Release);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Acquire)
    }

    pub fn max_block_size(&self) -> u32 {
        self.max_block_size.load(Ordering::Acquire)
    }

    /// Blocks dropped because the accumulator lock was contended
    pub fn skipped_blocks(&self) -> u64 {
        self.skipped_blocks.load(Ordering::Relaxed)
    }

    /// Fold one audio block into the accumulators. Safe to call from the
    /// real-time audio callback: on lock contention the block is skipped,
    /// never waited for.
    pub fn analyze_data(&self, block: &AudioBlock<'_>) -> Result<(), AnalyzerError> {
        let max = self.max_block_size.load(Ordering::Acquire);
        if self.sample_rate.load(Ordering::Acquire) == 0 || max == 0 {
            return Err(AnalyzerError::NotInitialized);
        }
        if block.frames > max as usize {
            return Err(AnalyzerError::BlockTooLarge {
                frames: block.frames,
                max: max as usize,
            });
        }
        if block.samples.len() != block.channels as usize * block.frames {
            return Err(AnalyzerError::MalformedBlock {
                samples: block.samples.len(),
            });
        }

        let Some(mut state) = self.state.try_lock() else {
            self.skipped_blocks.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };

        if block.channels as usize != state.channels.len() {
            return Err(AnalyzerError::ChannelMismatch {
                got: block.channels,
                expected: state.channels.len() as u16,
            });
        }

        for (index, acc) in state.channels.iter_mut().enumerate() {
            for &sample in block.channel(index) {
                let magnitude = sample.abs();
                if magnitude > acc.window_peak {
                    acc.window_peak = magnitude;
                }
                acc.sum_squares += f64::from(sample) * f64::from(sample);
            }
            acc.window_samples += block.frames as u64;
            if acc.window_peak > acc.hold {
                acc.hold = acc.window_peak;
            }
        }

        Ok(())
    }

    /// Compute per-channel levels for the window since the last snapshot and
    /// reset the window. The peak hold decays dB-linearly over time instead
    /// of dropping with the signal, so it stays readable at low refresh
    /// rates. Called from the metering timer, never the audio callback.
    pub fn take_snapshot(&self) -> Option<LevelSnapshot> {
        if self.sample_rate.load(Ordering::Acquire) == 0 {
            return None;
        }

        let mut state = self.state.lock();
        let elapsed = state.last_snapshot.elapsed().as_secs_f32();
        state.last_snapshot = Instant::now();

        let decay_factor = 10f32.powf(-PEAK_HOLD_DECAY_DB_PER_SEC * elapsed / 20.0);

        let count = state.channels.len();
        let mut snapshot = LevelSnapshot {
            peak: Vec::with_capacity(count),
            hold: Vec::with_capacity(count),
            rms: Vec::with_capacity(count),
            min_db: self.min_db,
        };

        for acc in state.channels.iter_mut() {
            let rms = if acc.window_samples > 0 {
                (acc.sum_squares / acc.window_samples as f64).sqrt() as f32
            } else {
                0.0
            };
            acc.hold = (acc.hold * decay_factor).max(acc.window_peak);

            snapshot.peak.push(acc.window_peak);
            snapshot.hold.push(acc.hold);
            snapshot.rms.push(rms);

            acc.window_peak = 0.0;
            acc.sum_squares = 0.0;
            acc.window_samples = 0;
        }

        Some(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer(channels: u16) -> LevelAnalyzer {
        let analyzer = LevelAnalyzer::new(-100.0);
        analyzer.initialize_parameters(48000, 512, channels);
        analyzer
    }

    #[test]
    fn test_requires_initialization() {
        let analyzer = LevelAnalyzer::new(-100.0);
        let samples = [0.0f32; 4];
        let block = AudioBlock::new(&samples, 1, 4);
        assert!(matches!(
            analyzer.analyze_data(&block),
            Err(AnalyzerError::NotInitialized)
        ));
        assert!(analyzer.take_snapshot().is_none());
    }

    #[test]
    fn test_closed_form_peak_and_rms() {
        let analyzer = analyzer(2);

        // Channel 0: 0.5, -0.5, 0.5, -0.5, 0.5, -0.5  -> peak 0.5, rms 0.5
        // Channel 1: 0.0, 0.6, 0.0, -0.8, 0.0, 0.0    -> peak 0.8, rms 0.40825
        let samples = [
            0.5, -0.5, 0.5, -0.5, 0.5, -0.5, //
            0.0, 0.6, 0.0, -0.8, 0.0, 0.0,
        ];
        let block = AudioBlock::new(&samples, 2, 6);
        analyzer.analyze_data(&block).unwrap();

        let snapshot = analyzer.take_snapshot().unwrap();
        assert!((snapshot.peak[0] - 0.5).abs() < 1e-6);
        assert!((snapshot.rms[0] - 0.5).abs() < 1e-6);
        assert!((snapshot.peak[1] - 0.8).abs() < 1e-6);

        let expected_rms = ((0.6f64 * 0.6 + 0.8 * 0.8) / 6.0).sqrt() as f32;
        assert!((snapshot.rms[1] - expected_rms).abs() < 1e-6);
    }

    #[test]
    fn test_peak_hold_decays_instead_of_dropping() {
        let analyzer = analyzer(1);

        let loud = [0.9f32; 8];
        analyzer
            .analyze_data(&AudioBlock::new(&loud, 1, 8))
            .unwrap();
        let first = analyzer.take_snapshot().unwrap();
        assert!((first.hold[0] - 0.9).abs() < 1e-6);

        std::thread::sleep(std::time::Duration::from_millis(50));

        let quiet = [0.1f32; 8];
        analyzer
            .analyze_data(&AudioBlock::new(&quiet, 1, 8))
            .unwrap();
        let second = analyzer.take_snapshot().unwrap();

        // Instantaneous peak follows the signal down; the hold decays from
        // 0.9 but has not collapsed to it
        assert!((second.peak[0] - 0.1).abs() < 1e-6);
        assert!(second.hold[0] < 0.9);
        assert!(second.hold[0] > 0.5);
    }

    #[test]
    fn test_oversize_block_rejected() {
        let analyzer = LevelAnalyzer::new(-100.0);
        analyzer.initialize_parameters(48000, 4, 1);
        let samples = [0.0f32; 8];
        assert!(matches!(
            analyzer.analyze_data(&AudioBlock::new(&samples, 1, 8)),
            Err(AnalyzerError::BlockTooLarge { .. })
        ));
    }

    #[test]
    fn test_channel_mismatch_rejected() {
        let analyzer = analyzer(2);
        let samples = [0.0f32; 4];
        assert!(matches!(
            analyzer.analyze_data(&AudioBlock::new(&samples, 1, 4)),
            Err(AnalyzerError::ChannelMismatch { .. })
        ));
    }

    #[test]
    fn test_empty_window_snapshot_is_silent() {
        let analyzer = analyzer(2);
        let snapshot = analyzer.take_snapshot().unwrap();
        assert_eq!(snapshot.peak, vec![0.0, 0.0]);
        assert_eq!(snapshot.rms, vec![0.0, 0.0]);
    }

    #[test]
    fn test_snapshot_message_roundtrip() {
        let snapshot = LevelSnapshot {
            peak: vec![0.5, 0.8],
            hold: vec![0.9, 0.8],
            rms: vec![0.35, 0.4],
            min_db: -100.0,
        };
        let message = snapshot.clone().into_message(Direction::Output);
        let (direction, restored) = LevelSnapshot::from_message(&message, -100.0).unwrap();
        assert_eq!(direction, Direction::Output);
        assert_eq!(restored, snapshot);
    }

    #[test]
    fn test_non_metering_buffer_not_mistaken_for_snapshot() {
        let message = Message::AudioBuffer {
            direction: Direction::Input,
            channels: 2,
            frames: 6,
            samples: vec![0.0; 12],
        };
        assert!(LevelSnapshot::from_message(&message, -100.0).is_none());
    }
}
