pub mod commands;

pub use commands::{Button, ButtonEvent, Command, CommandValue};

use serde_json::{Value, json};
use std::collections::HashSet;

/// WebSocket subprotocol identifiers, one per console protocol generation.
pub const SUBPROTOCOL_V1: &str = "v1.phonescoring.jd.ubisoft.com";
pub const SUBPROTOCOL_V2: &str = "v2.phonescoring.jd.ubisoft.com";

pub const ACCEL_ACQUISITION_FREQ_HZ: f64 = 200.0;
pub const ACCEL_ACQUISITION_LATENCY: f64 = 0.0;
pub const ACCEL_MAX_RANGE: f64 = 8.0;

/// Hard cap on samples per outbound scoring message.
pub const ACCEL_SAMPLES_PER_MESSAGE: usize = 10;

/// One raw accelerometer reading, in g units.
pub type AccelSample = [f64; 3];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V1,
    V2,
}

impl ProtocolVersion {
    pub fn subprotocol(self) -> &'static str {
        match self {
            ProtocolVersion::V1 => SUBPROTOCOL_V1,
            ProtocolVersion::V2 => SUBPROTOCOL_V2,
        }
    }
}

/// Outbound messages, phone to console.
#[derive(Debug, Clone, PartialEq)]
pub enum PhoneMessage {
    Hello,
    Scoring {
        samples: Vec<AccelSample>,
        timestamp: u64,
    },
    Pause,
    CustomIdentifier {
        identifier: &'static str,
    },
    InputCode {
        input: u32,
    },
}

impl PhoneMessage {
    /// Serialize to the wire envelope: a single object whose `root` member
    /// carries the `__class` discriminant plus the class-specific fields.
    /// Some console firmwares are sensitive to payload framing, so the
    /// output must carry no insignificant whitespace.
    pub fn encode(&self) -> String {
        let root = match self {
            PhoneMessage::Hello => json!({
                "__class": "JD_PhoneDataCmdHandshakeHello",
                "accelAcquisitionFreqHz": ACCEL_ACQUISITION_FREQ_HZ,
                "accelAcquisitionLatency": ACCEL_ACQUISITION_LATENCY,
                "accelMaxRange": ACCEL_MAX_RANGE,
            }),
            PhoneMessage::Scoring { samples, timestamp } => json!({
                "__class": "JD_PhoneScoringData",
                "accelData": samples,
                "timeStamp": timestamp,
            }),
            PhoneMessage::Pause => json!({
                "__class": "JD_PhoneUiPauseData",
            }),
            PhoneMessage::CustomIdentifier { identifier } => json!({
                "__class": "JD_PhoneUiCustomIdentifierData",
                "identifier": identifier,
            }),
            PhoneMessage::InputCode { input } => json!({
                "__class": "JD_PhoneUiInputData",
                "input": input,
            }),
        };
        json!({ "root": root }).to_string()
    }
}

/// Inbound control messages, console to phone.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleMessage {
    EnableAccel,
    DisableAccel,
    InputSetup { enabled: bool },
    ShortcutSetup { enabled: bool },
    ShortcutList { shortcuts: HashSet<Command> },
}

/// Decode one inbound frame. Unknown discriminants and malformed frames are
/// non-fatal: both yield `None`, the latter with a warning.
pub fn decode_console_frame(text: &str) -> Option<ConsoleMessage> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(target: "disco::protocol", error = %err, "malformed console frame");
            return None;
        }
    };

    let class = value.get("__class").and_then(Value::as_str)?;
    match class {
        "JD_EnableAccelValuesSending_ConsoleCommandData" => Some(ConsoleMessage::EnableAccel),
        "JD_DisableAccelValuesSending_ConsoleCommandData" => Some(ConsoleMessage::DisableAccel),
        "JD_PhoneUiSetupData" => Some(ConsoleMessage::InputSetup {
            enabled: is_enabled(&value),
        }),
        "JD_PhoneUiShortcutSetupData" => Some(ConsoleMessage::ShortcutSetup {
            enabled: is_enabled(&value),
        }),
        "JD_PhoneUiShortcutListSetupData" => Some(ConsoleMessage::ShortcutList {
            shortcuts: parse_shortcuts(&value),
        }),
        other => {
            tracing::trace!(target: "disco::protocol", class = other, "ignoring console frame");
            None
        }
    }
}

fn is_enabled(value: &Value) -> bool {
    value.get("isEnabled").and_then(Value::as_u64) == Some(1)
}

/// Rebuild the advertised shortcut set from a shortcut-list update. Entries
/// that are not action shortcuts, or whose type is unrecognized, are skipped.
fn parse_shortcuts(value: &Value) -> HashSet<Command> {
    let entries = match value.get("shortcuts").and_then(Value::as_array) {
        Some(entries) => entries,
        None => return HashSet::new(),
    };

    entries
        .iter()
        .filter(|entry| {
            entry.get("__class").and_then(Value::as_str) == Some("JD_PhoneAction_Shortcut")
        })
        .filter_map(|entry| entry.get("shortcutType").and_then(Value::as_u64))
        .filter_map(Command::from_shortcut_type)
        .collect()
}
