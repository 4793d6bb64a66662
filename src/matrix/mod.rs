//! Crosspoint matrix state
//!
//! The matrix is the single source of truth on the engine side; clients
//! hold a mirrored copy updated only by inbound control messages. Channel
//! indices are 1-based. All maps are sparse: an absent entry means unmuted,
//! or `{enabled: false, gain: 0.0}` for a crosspoint.
//!
//! Gains are stored as normalized linear values in `[0, 1]`; conversion to
//! decibels happens only at the display boundary via [`gain_to_db`] /
//! [`db_to_gain`] against the engine-wide `min_db` floor.

pub mod commander;

pub use commander::{
    CommanderHub, CrosspointCommander, InputCommander, MatrixChange, MatrixListener, OriginatorId,
    OutputCommander,
};

use std::collections::BTreeMap;

use crate::codec::ControlParameters;
use crate::error::MatrixError;

/// State of a single (input, output) junction
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CrosspointState {
    pub enabled: bool,
    /// Normalized linear gain in `[0, 1]`
    pub gain: f32,
}

/// N-input x M-output routing matrix with per-channel mutes and
/// per-crosspoint enable/gain
#[derive(Debug, Clone, PartialEq)]
pub struct CrosspointMatrix {
    inputs: u16,
    outputs: u16,
    input_mutes: BTreeMap<u16, bool>,
    output_mutes: BTreeMap<u16, bool>,
    crosspoints: BTreeMap<(u16, u16), CrosspointState>,
}

impl CrosspointMatrix {
    /// Create a matrix with the given channel counts, all state at defaults
    pub fn new(inputs: u16, outputs: u16) -> Result<Self, MatrixError> {
        if inputs == 0 || outputs == 0 {
            return Err(MatrixError::InvalidIoCount);
        }
        Ok(Self {
            inputs,
            outputs,
            input_mutes: BTreeMap::new(),
            output_mutes: BTreeMap::new(),
            crosspoints: BTreeMap::new(),
        })
    }

    /// Current (inputs, outputs) channel counts
    pub fn io_count(&self) -> (u16, u16) {
        (self.inputs, self.outputs)
    }

    /// Resize the matrix. Shrinking discards entries whose channel indices
    /// fall out of range; growing leaves new channels at defaults.
    pub fn reinit_io_count(&mut self, inputs: u16, outputs: u16) -> Result<(), MatrixError> {
        if inputs == 0 || outputs == 0 {
            return Err(MatrixError::InvalidIoCount);
        }
        self.inputs = inputs;
        self.outputs = outputs;
        self.input_mutes.retain(|channel, _| *channel <= inputs);
        self.output_mutes.retain(|channel, _| *channel <= outputs);
        self.crosspoints
            .retain(|(input, output), _| *input <= inputs && *output <= outputs);
        Ok(())
    }

    fn check_input(&self, channel: u16) -> Result<(), MatrixError> {
        if channel == 0 || channel > self.inputs {
            return Err(MatrixError::InputOutOfRange {
                channel,
                count: self.inputs,
            });
        }
        Ok(())
    }

    fn check_output(&self, channel: u16) -> Result<(), MatrixError> {
        if channel == 0 || channel > self.outputs {
            return Err(MatrixError::OutputOutOfRange {
                channel,
                count: self.outputs,
            });
        }
        Ok(())
    }

    fn check_gain(gain: f32) -> Result<f32, MatrixError> {
        if !gain.is_finite() {
            return Err(MatrixError::InvalidGain(gain));
        }
        Ok(gain.clamp(0.0, 1.0))
    }

    pub fn set_input_mute(&mut self, channel: u16, muted: bool) -> Result<(), MatrixError> {
        self.check_input(channel)?;
        self.input_mutes.insert(channel, muted);
        Ok(())
    }

    pub fn set_output_mute(&mut self, channel: u16, muted: bool) -> Result<(), MatrixError> {
        self.check_output(channel)?;
        self.output_mutes.insert(channel, muted);
        Ok(())
    }

    pub fn input_mute(&self, channel: u16) -> bool {
        self.input_mutes.get(&channel).copied().unwrap_or(false)
    }

    pub fn output_mute(&self, channel: u16) -> bool {
        self.output_mutes.get(&channel).copied().unwrap_or(false)
    }

    /// Toggling `enabled` does not erase the stored gain, it only silences it.
    pub fn set_crosspoint_enabled(
        &mut self,
        input: u16,
        output: u16,
        enabled: bool,
    ) -> Result<(), MatrixError> {
        self.check_input(input)?;
        self.check_output(output)?;
        self.crosspoints.entry((input, output)).or_default().enabled = enabled;
        Ok(())
    }

    pub fn set_crosspoint_gain(
        &mut self,
        input: u16,
        output: u16,
        gain: f32,
    ) -> Result<(), MatrixError> {
        self.check_input(input)?;
        self.check_output(output)?;
        let gain = Self::check_gain(gain)?;
        self.crosspoints.entry((input, output)).or_default().gain = gain;
        Ok(())
    }

    /// Current state of a crosspoint; defaults for an untouched junction
    pub fn crosspoint(&self, input: u16, output: u16) -> CrosspointState {
        self.crosspoints
            .get(&(input, output))
            .copied()
            .unwrap_or_default()
    }

    /// Audible contribution factor of a crosspoint: `gain` when enabled and
    /// neither side is muted, 0 otherwise
    pub fn effective_gain(&self, input: u16, output: u16) -> f32 {
        let state = self.crosspoint(input, output);
        if state.enabled && !self.input_mute(input) && !self.output_mute(output) {
            state.gain
        } else {
            0.0
        }
    }

    /// Snapshot of the full control state for transmission
    pub fn control_parameters(&self) -> ControlParameters {
        let mut control = ControlParameters::default();
        control.input_mutes = self.input_mutes.clone();
        control.output_mutes = self.output_mutes.clone();
        for (key, state) in &self.crosspoints {
            control.crosspoint_enables.insert(*key, state.enabled);
            control.crosspoint_gains.insert(*key, state.gain);
        }
        control
    }

    /// Apply an inbound control snapshot, all-or-nothing: every referenced
    /// channel index is validated before any map is touched, so a rejected
    /// message never partially mutates the matrix.
    pub fn apply_control(&mut self, control: &ControlParameters) -> Result<(), MatrixError> {
        for channel in control.input_mutes.keys() {
            self.check_input(*channel)?;
        }
        for channel in control.output_mutes.keys() {
            self.check_output(*channel)?;
        }
        for (input, output) in control
            .crosspoint_enables
            .keys()
            .chain(control.crosspoint_gains.keys())
        {
            self.check_input(*input)?;
            self.check_output(*output)?;
        }
        for gain in control.crosspoint_gains.values() {
            Self::check_gain(*gain)?;
        }

        for (channel, muted) in &control.input_mutes {
            self.input_mutes.insert(*channel, *muted);
        }
        for (channel, muted) in &control.output_mutes {
            self.output_mutes.insert(*channel, *muted);
        }
        for (key, enabled) in &control.crosspoint_enables {
            self.crosspoints.entry(*key).or_default().enabled = *enabled;
        }
        for (key, gain) in &control.crosspoint_gains {
            self.crosspoints.entry(*key).or_default().gain = gain.clamp(0.0, 1.0);
        }
        Ok(())
    }
}

impl Default for CrosspointMatrix {
    fn default() -> Self {
        // Default dimensions are nonzero, so construction cannot fail
        Self::new(
            crate::constants::DEFAULT_INPUT_COUNT,
            crate::constants::DEFAULT_OUTPUT_COUNT,
        )
        .unwrap()
    }
}

/// Convert a normalized linear gain to decibels for display.
/// `gain = 0` maps to the `min_db` floor, `gain = 1` to 0 dB (unity).
pub fn gain_to_db(gain: f32, min_db: f32) -> f32 {
    if gain <= 0.0 {
        return min_db;
    }
    (20.0 * gain.log10()).max(min_db)
}

/// Inverse of [`gain_to_db`]: decibels at or below the floor map to 0.0
pub fn db_to_gain(db: f32, min_db: f32) -> f32 {
    if db <= min_db {
        return 0.0;
    }
    10f32.powf(db / 20.0).min(1.0)
}
