//! Seestar JSON-RPC wire protocol
//!
//! Outbound commands are `{"id", "method", "params"?}` objects terminated by
//! `\r\n`. Inbound lines are either responses (carry `jsonrpc`/`id`) or
//! events (carry `Event`).

use crate::error::DeviceResult;
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Line terminator used in both directions
pub const LINE_TERMINATOR: &str = "\r\n";

/// `result` text returned when a synchronous call gets no response in time
pub const SYNC_TIMEOUT_RESULT: &str = "Error: Exceeded allotted wait time for result";

/// `result` text returned for commands dispatched on a detached task
pub const SENT_ASYNC_RESULT: &str = "Sent command async for these types of commands.";

/// Device methods used by the session
pub mod methods {
    // Mount
    pub const SCOPE_GET_EQU_COORD: &str = "scope_get_equ_coord";
    pub const SCOPE_GET_HORIZ_COORD: &str = "scope_get_horiz_coord";
    pub const SCOPE_GOTO: &str = "scope_goto";
    pub const SCOPE_SYNC: &str = "scope_sync";
    pub const SCOPE_PARK: &str = "scope_park";
    pub const SCOPE_SPEED_MOVE: &str = "scope_speed_move";

    // View / imaging
    pub const ISCOPE_START_VIEW: &str = "iscope_start_view";
    pub const ISCOPE_STOP_VIEW: &str = "iscope_stop_view";
    pub const ISCOPE_START_STACK: &str = "iscope_start_stack";
    pub const GET_VIEW_STATE: &str = "get_view_state";
    pub const SET_CONTROL_VALUE: &str = "set_control_value";
    pub const SET_SEQUENCE_SETTING: &str = "set_sequence_setting";
    pub const SET_STACK_SETTING: &str = "set_stack_setting";
    pub const START_CREATE_DARK: &str = "start_create_dark";

    // Focus
    pub const START_AUTO_FOCUSE: &str = "start_auto_focuse";
    pub const GET_FOCUSER_POSITION: &str = "get_focuser_position";
    pub const MOVE_FOCUSER: &str = "move_focuser";

    // Alignment
    pub const START_SOLVE: &str = "start_solve";
    pub const START_POLAR_ALIGN: &str = "start_polar_align";
    pub const STOP_POLAR_ALIGN: &str = "stop_polar_align";

    // Device
    pub const GET_DEVICE_STATE: &str = "get_device_state";
    pub const GET_SETTING: &str = "get_setting";
    pub const SET_SETTING: &str = "set_setting";
    pub const SET_USER_LOCATION: &str = "set_user_location";
    pub const PI_SET_TIME: &str = "pi_set_time";
    pub const PI_OUTPUT_SET2: &str = "pi_output_set2";
    pub const PLAY_SOUND: &str = "play_sound";
    pub const PI_SHUTDOWN: &str = "pi_shutdown";
    pub const PI_REBOOT: &str = "pi_reboot";

    // Discovery
    pub const SCAN_ISCOPE: &str = "scan_iscope";
}

/// Event names published by the device
pub mod events {
    pub const AUTO_GOTO: &str = "AutoGoto";
    pub const SCOPE_GOTO: &str = "ScopeGoto";
    pub const SCOPE_HOME: &str = "ScopeHome";
    pub const PLATE_SOLVE: &str = "PlateSolve";
    pub const AUTO_FOCUS: &str = "AutoFocus";
    pub const EQ_MODE_PA: &str = "EqModePA";
    pub const DARK_LIBRARY: &str = "DarkLibrary";
    pub const STACK: &str = "Stack";
    pub const SIMU_STACK: &str = "Simu_Stack";
    pub const CLIENT: &str = "Client";
    pub const PI_STATUS: &str = "PiStatus";

    /// Synthetic entry holding the polar-alignment error
    pub const THREE_PPA: &str = "3PPA";
    /// Synthetic entry mirroring scheduler progress
    pub const SCHEDULER: &str = "scheduler";
}

/// Audible cues
pub mod sounds {
    pub const SCHEDULE_START: u32 = 80;
    pub const SCHEDULE_FINISH: u32 = 82;
    pub const SCHEDULE_STOP: u32 = 83;
    pub const SHUTDOWN: u32 = 13;
}

/// Outbound command envelope
#[derive(Debug, Clone, Serialize)]
pub struct Command {
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Command {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }

    /// Serialize to a single line without the terminator
    pub fn to_line(&self) -> DeviceResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A parsed inbound line
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Reply to a command, keyed by `id`
    Response { id: u64, body: Value },
    /// Unsolicited status update, keyed by event name
    Event { name: String, body: Value },
    /// Valid JSON that is neither
    Unknown(Value),
}

impl InboundMessage {
    /// Parse one line of inbound text
    pub fn parse_line(line: &str) -> DeviceResult<Self> {
        let value: Value = serde_json::from_str(line)?;
        Ok(Self::classify(value))
    }

    /// Classify an already-parsed message
    pub fn classify(value: Value) -> Self {
        if let Some(name) = value.get("Event").and_then(Value::as_str) {
            return InboundMessage::Event {
                name: name.to_string(),
                body: value,
            };
        }
        match value.get("id").and_then(Value::as_u64) {
            Some(id) => InboundMessage::Response { id, body: value },
            None => InboundMessage::Unknown(value),
        }
    }
}

/// Whether a device response reports failure.
///
/// Covers a top-level `error` key and the synthetic timeout result.
pub fn response_failed(response: &Value) -> bool {
    if response.get("error").is_some() {
        return true;
    }
    matches!(
        response.get("result").and_then(Value::as_str),
        Some(text) if text.starts_with("Error:")
    )
}

/// Extract the `error` message of a failed response
pub fn response_error_message(response: &Value) -> Option<String> {
    match response.get("error") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
        None => response
            .get("result")
            .and_then(Value::as_str)
            .filter(|s| s.starts_with("Error:"))
            .map(str::to_string),
    }
}

/// State string carried by operation events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpState {
    Idle,
    Start,
    Working,
    Complete,
    Fail,
    Cancel,
    Stopped,
    Other(String),
}

impl OpState {
    pub fn parse(text: &str) -> Self {
        match text {
            "idle" => OpState::Idle,
            "start" => OpState::Start,
            "working" => OpState::Working,
            "complete" => OpState::Complete,
            "fail" => OpState::Fail,
            "cancel" => OpState::Cancel,
            "stopped" => OpState::Stopped,
            other => OpState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            OpState::Idle => "idle",
            OpState::Start => "start",
            OpState::Working => "working",
            OpState::Complete => "complete",
            OpState::Fail => "fail",
            OpState::Cancel => "cancel",
            OpState::Stopped => "stopped",
            OpState::Other(s) => s,
        }
    }

    /// An operation in this state has finished
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OpState::Complete | OpState::Fail | OpState::Cancel | OpState::Stopped
        )
    }

    /// An operation in this state is still running
    pub fn is_active(&self) -> bool {
        matches!(self, OpState::Start | OpState::Working)
    }
}

impl Serialize for OpState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for OpState {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(OpState::parse(&text))
    }
}

impl fmt::Display for OpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result envelope returned by session and scheduler commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub jsonrpc: String,
    #[serde(rename = "TimeStamp")]
    pub timestamp: String,
    pub command: String,
    pub code: i32,
    pub result: Value,
}

impl CommandResult {
    pub fn new(command: impl Into<String>, code: i32, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            timestamp: Local::now().to_rfc3339(),
            command: command.into(),
            code,
            result,
        }
    }

    pub fn ok(command: impl Into<String>, result: Value) -> Self {
        Self::new(command, 0, result)
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }

    pub fn to_value(&self) -> Value {
        json!({
            "jsonrpc": self.jsonrpc,
            "TimeStamp": self.timestamp,
            "command": self.command,
            "code": self.code,
            "result": self.result,
        })
    }
}
