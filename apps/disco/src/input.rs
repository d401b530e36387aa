use thiserror::Error;

use crate::protocol::{AccelSample, ButtonEvent};

#[derive(Debug, Error)]
pub enum InputError {
    #[error("controller read failed: {0}")]
    Read(String),
    #[error("controller disconnected")]
    Disconnected,
}

/// Boundary to the physical-device driver. The driver runs its own
/// acquisition loop; the engine only drains its pending transitions and asks
/// for the current accelerometer reading, never blocking on device internals.
pub trait InputSource: Send {
    /// Drain and clear all pending button transitions. Finite per call.
    fn drain_events(&mut self) -> Vec<ButtonEvent>;

    /// Current raw 3-axis accelerometer sample.
    fn accel_sample(&mut self) -> Result<AccelSample, InputError>;
}

/// Placeholder source with no buttons and a resting-gravity reading, enough
/// to exercise pairing and the connection handshake from the CLI.
// TODO: replace with a HID-backed driver once one lands.
#[derive(Debug, Default)]
pub struct IdleInputSource;

impl InputSource for IdleInputSource {
    fn drain_events(&mut self) -> Vec<ButtonEvent> {
        Vec::new()
    }

    fn accel_sample(&mut self) -> Result<AccelSample, InputError> {
        Ok([0.0, -1.0, 0.0])
    }
}
