//! Commanders: the mutation path into the crosspoint matrix
//!
//! Every mutation goes through a commander and carries an [`OriginatorId`].
//! Registered [`MatrixListener`]s are notified after the matrix lock is
//! released, and the originator is always attached to the notification, so
//! echo suppression is part of the signature: a surface that mutates the
//! matrix and also observes it simply ignores notifications carrying its
//! own id.
//!
//! Listeners must not mutate the matrix from inside `matrix_changed`; a
//! notification handler that re-emits a change would create exactly the
//! feedback loop the originator id exists to prevent.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use uuid::Uuid;

use crate::codec::ControlParameters;
use crate::error::MatrixError;

use super::{CrosspointMatrix, CrosspointState};

/// Identity of the surface or connection that issued a mutation
pub type OriginatorId = Uuid;

/// A single observable matrix mutation
#[derive(Debug, Clone, PartialEq)]
pub enum MatrixChange {
    InputMute { channel: u16, muted: bool },
    OutputMute { channel: u16, muted: bool },
    CrosspointEnabled { input: u16, output: u16, enabled: bool },
    CrosspointGain { input: u16, output: u16, gain: f32 },
    IoCount { inputs: u16, outputs: u16 },
    /// A full control snapshot was applied in one step
    ControlApplied,
}

/// Observer of matrix mutations. The originator id of the surface that
/// issued the change is always attached.
pub trait MatrixListener: Send + Sync {
    fn matrix_changed(&self, change: &MatrixChange, originator: OriginatorId);
}

/// Shared core behind the three commander specializations: the matrix under
/// a short-lived lock plus the listener registry
pub struct CommanderHub {
    matrix: Mutex<CrosspointMatrix>,
    listeners: RwLock<Vec<Arc<dyn MatrixListener>>>,
}

impl CommanderHub {
    pub fn new(matrix: CrosspointMatrix) -> Arc<Self> {
        Arc::new(Self {
            matrix: Mutex::new(matrix),
            listeners: RwLock::new(Vec::new()),
        })
    }

    pub fn register_listener(&self, listener: Arc<dyn MatrixListener>) {
        self.listeners.write().push(listener);
    }

    /// Read access to the matrix under the lock
    pub fn with_matrix<R>(&self, f: impl FnOnce(&CrosspointMatrix) -> R) -> R {
        f(&self.matrix.lock())
    }

    pub fn io_count(&self) -> (u16, u16) {
        self.matrix.lock().io_count()
    }

    /// Full control snapshot for transmission or late-joiner sync
    pub fn snapshot(&self) -> ControlParameters {
        self.matrix.lock().control_parameters()
    }

    /// Apply an inbound control snapshot all-or-nothing and notify listeners
    pub fn apply_control(
        &self,
        control: &ControlParameters,
        originator: OriginatorId,
    ) -> Result<(), MatrixError> {
        self.matrix.lock().apply_control(control)?;
        self.notify(&MatrixChange::ControlApplied, originator);
        Ok(())
    }

    /// Resize the matrix and notify listeners
    pub fn reinit_io_count(
        &self,
        inputs: u16,
        outputs: u16,
        originator: OriginatorId,
    ) -> Result<(), MatrixError> {
        self.matrix.lock().reinit_io_count(inputs, outputs)?;
        self.notify(&MatrixChange::IoCount { inputs, outputs }, originator);
        Ok(())
    }

    /// Notify all listeners. Called only after the matrix lock is released.
    fn notify(&self, change: &MatrixChange, originator: OriginatorId) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.matrix_changed(change, originator);
        }
    }
}

/// Commander for input-channel state
pub struct InputCommander {
    hub: Arc<CommanderHub>,
}

impl InputCommander {
    pub fn new(hub: Arc<CommanderHub>) -> Self {
        Self { hub }
    }

    /// Mutate the mute flag and notify listeners with the originator
    pub fn set_mute(
        &self,
        channel: u16,
        muted: bool,
        originator: OriginatorId,
    ) -> Result<(), MatrixError> {
        self.hub.matrix.lock().set_input_mute(channel, muted)?;
        self.hub
            .notify(&MatrixChange::InputMute { channel, muted }, originator);
        Ok(())
    }

    /// Re-publish the current value, for late joiners or UI re-sync
    pub fn poll_mute(&self, channel: u16, originator: OriginatorId) -> Result<bool, MatrixError> {
        let matrix = self.hub.matrix.lock();
        let (inputs, _) = matrix.io_count();
        if channel == 0 || channel > inputs {
            return Err(MatrixError::InputOutOfRange {
                channel,
                count: inputs,
            });
        }
        let muted = matrix.input_mute(channel);
        drop(matrix);
        self.hub
            .notify(&MatrixChange::InputMute { channel, muted }, originator);
        Ok(muted)
    }
}

/// Commander for output-channel state
pub struct OutputCommander {
    hub: Arc<CommanderHub>,
}

impl OutputCommander {
    pub fn new(hub: Arc<CommanderHub>) -> Self {
        Self { hub }
    }

    pub fn set_mute(
        &self,
        channel: u16,
        muted: bool,
        originator: OriginatorId,
    ) -> Result<(), MatrixError> {
        self.hub.matrix.lock().set_output_mute(channel, muted)?;
        self.hub
            .notify(&MatrixChange::OutputMute { channel, muted }, originator);
        Ok(())
    }

    pub fn poll_mute(&self, channel: u16, originator: OriginatorId) -> Result<bool, MatrixError> {
        let matrix = self.hub.matrix.lock();
        let (_, outputs) = matrix.io_count();
        if channel == 0 || channel > outputs {
            return Err(MatrixError::OutputOutOfRange {
                channel,
                count: outputs,
            });
        }
        let muted = matrix.output_mute(channel);
        drop(matrix);
        self.hub
            .notify(&MatrixChange::OutputMute { channel, muted }, originator);
        Ok(muted)
    }
}

/// Commander for (input, output) crosspoint state
pub struct CrosspointCommander {
    hub: Arc<CommanderHub>,
}

impl CrosspointCommander {
    pub fn new(hub: Arc<CommanderHub>) -> Self {
        Self { hub }
    }

    pub fn set_enabled(
        &self,
        input: u16,
        output: u16,
        enabled: bool,
        originator: OriginatorId,
    ) -> Result<(), MatrixError> {
        self.hub
            .matrix
            .lock()
            .set_crosspoint_enabled(input, output, enabled)?;
        self.hub.notify(
            &MatrixChange::CrosspointEnabled {
                input,
                output,
                enabled,
            },
            originator,
        );
        Ok(())
    }

    pub fn set_gain(
        &self,
        input: u16,
        output: u16,
        gain: f32,
        originator: OriginatorId,
    ) -> Result<(), MatrixError> {
        self.hub
            .matrix
            .lock()
            .set_crosspoint_gain(input, output, gain)?;
        self.hub.notify(
            &MatrixChange::CrosspointGain {
                input,
                output,
                gain,
            },
            originator,
        );
        Ok(())
    }

    /// Set enable and gain together, notifying once per field
    pub fn set(
        &self,
        input: u16,
        output: u16,
        enabled: bool,
        gain: f32,
        originator: OriginatorId,
    ) -> Result<(), MatrixError> {
        {
            let mut matrix = self.hub.matrix.lock();
            matrix.set_crosspoint_gain(input, output, gain)?;
            matrix.set_crosspoint_enabled(input, output, enabled)?;
        }
        self.hub.notify(
            &MatrixChange::CrosspointGain {
                input,
                output,
                gain,
            },
            originator,
        );
        self.hub.notify(
            &MatrixChange::CrosspointEnabled {
                input,
                output,
                enabled,
            },
            originator,
        );
        Ok(())
    }

    /// Re-publish the current crosspoint state
    pub fn poll(
        &self,
        input: u16,
        output: u16,
        originator: OriginatorId,
    ) -> Result<CrosspointState, MatrixError> {
        let matrix = self.hub.matrix.lock();
        let (inputs, outputs) = matrix.io_count();
        if input == 0 || input > inputs {
            return Err(MatrixError::InputOutOfRange {
                channel: input,
                count: inputs,
            });
        }
        if output == 0 || output > outputs {
            return Err(MatrixError::OutputOutOfRange {
                channel: output,
                count: outputs,
            });
        }
        let state = matrix.crosspoint(input, output);
        drop(matrix);
        self.hub.notify(
            &MatrixChange::CrosspointEnabled {
                input,
                output,
                enabled: state.enabled,
            },
            originator,
        );
        self.hub.notify(
            &MatrixChange::CrosspointGain {
                input,
                output,
                gain: state.gain,
            },
            originator,
        );
        Ok(state)
    }
}
