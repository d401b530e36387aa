use parking_lot::Mutex;
use std::fmt;

/// Connection lifecycle. Happy-path transitions run strictly forward; a
/// failure jumps to the error state of the stage that produced it and the
/// session goes straight to cleanup. No state is revisited once left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    GettingToken,
    Pairing,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    /// Token/auth failure or generic connect failure.
    ErrorConnection,
    ErrorInvalidPairingCode,
    ErrorPunchPairing,
    ErrorHolePunching,
    /// WebSocket connection to the console failed.
    ErrorConsoleConnection,
    /// Controller acquisition or read failure.
    ErrorController,
}

impl ConnectionState {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            ConnectionState::ErrorConnection
                | ConnectionState::ErrorInvalidPairingCode
                | ConnectionState::ErrorPunchPairing
                | ConnectionState::ErrorHolePunching
                | ConnectionState::ErrorConsoleConnection
                | ConnectionState::ErrorController
        )
    }

    fn label(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::GettingToken => "getting_token",
            ConnectionState::Pairing => "pairing",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::ErrorConnection => "error_connection",
            ConnectionState::ErrorInvalidPairingCode => "error_invalid_pairing_code",
            ConnectionState::ErrorPunchPairing => "error_punch_pairing",
            ConnectionState::ErrorHolePunching => "error_hole_punching",
            ConnectionState::ErrorConsoleConnection => "error_console_connection",
            ConnectionState::ErrorController => "error_controller",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub type StateCallback = Box<dyn Fn(ConnectionState) + Send + Sync>;

/// Tracks the current state and drives the caller-supplied notification.
/// Without a callback, transitions are logged and otherwise discarded.
pub struct StateTracker {
    current: Mutex<ConnectionState>,
    callback: StateCallback,
}

impl StateTracker {
    pub fn new(callback: Option<StateCallback>) -> Self {
        let callback = callback.unwrap_or_else(|| {
            Box::new(|state| {
                tracing::info!(target: "disco::session", %state, "state changed");
            })
        });
        Self {
            current: Mutex::new(ConnectionState::Idle),
            callback,
        }
    }

    pub fn current(&self) -> ConnectionState {
        *self.current.lock()
    }

    /// Move to `next` and notify. Re-entering the current state is a no-op.
    pub fn transition(&self, next: ConnectionState) {
        {
            let mut current = self.current.lock();
            if *current == next {
                return;
            }
            tracing::debug!(target: "disco::session", from = %*current, to = %next, "transition");
            *current = next;
        }
        (self.callback)(next);
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new(None)
    }
}
