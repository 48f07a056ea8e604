//! Wire protocol shared by the control-plane and data-plane clients: newline-delimited JSON
//! frames over a WebSocket.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// The tag on a [`Message`] envelope. Closed over the operations this agent understands;
/// anything else deserializes into [`MessageKind::Unknown`] rather than failing the whole
/// frame, so a server rolling out a new operation kind doesn't wedge older agents.
///
/// `Serialize`/`Deserialize` are implemented by hand rather than derived so that every
/// variant — known or [`MessageKind::Unknown`] — round-trips through the wire format as a
/// bare string in the `type` field, not a nested `{"unknown": "..."}` object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// Server challenges the agent to authenticate.
    AuthChallenge,
    /// Agent's reply to an auth challenge.
    AuthResponse,
    /// Periodic liveness ping sent by the agent.
    Heartbeat,
    /// Server's ack of a heartbeat.
    HeartbeatAck,
    /// Low-level keepalive ping.
    Ping,
    /// Low-level keepalive pong.
    Pong,

    /// Run a single shell command.
    ExecuteCommand,
    /// Run a multi-line script.
    ExecuteScript,
    /// Open an interactive terminal session.
    StartTerminal,
    /// Bytes typed into an open terminal session.
    TerminalInput,
    /// Resize an open terminal session's viewport.
    TerminalResize,
    /// Close an open terminal session.
    CloseTerminal,
    /// List mounted drives/volumes.
    ListDrives,
    /// List files in a directory.
    ListFiles,
    /// Recursively walk a directory tree.
    ScanDirectory,
    /// Stream a file back to the server.
    DownloadFile,
    /// Accept a file pushed from the server.
    UploadFile,
    /// Start a remote-desktop peer connection.
    StartRemote,
    /// Stop an active remote-desktop session.
    StopRemote,
    /// Input event for an active remote-desktop session.
    RemoteInput,
    /// Begin WebRTC signaling for a remote-desktop session.
    WebrtcStart,
    /// Exchange a WebRTC SDP/ICE signal.
    WebrtcSignal,
    /// Tear down WebRTC signaling.
    WebrtcStop,
    /// Collect host/process diagnostics.
    CollectDiagnostics,
    /// Mark the agent for removal.
    UninstallAgent,

    /// Generic operation response (success or failure) to a request.
    Response,

    /// Streamed terminal output chunk.
    TerminalOutput,
    /// Streamed file chunk during a download.
    FileChunk,
    /// Progress update during a directory scan.
    ScanProgress,
    /// Streamed remote-desktop video/input frame.
    RemoteFrame,

    /// Server-pushed metrics snapshot.
    Metrics,
    /// Server-pushed tamper/security notification.
    TamperAlert,

    /// Any message kind this build doesn't recognize. Carries the original tag string so it
    /// can still be logged.
    Unknown(String),
}

impl MessageKind {
    fn as_wire_str(&self) -> &str {
        match self {
            MessageKind::AuthChallenge => "auth_challenge",
            MessageKind::AuthResponse => "auth_response",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::HeartbeatAck => "heartbeat_ack",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::ExecuteCommand => "execute_command",
            MessageKind::ExecuteScript => "execute_script",
            MessageKind::StartTerminal => "start_terminal",
            MessageKind::TerminalInput => "terminal_input",
            MessageKind::TerminalResize => "terminal_resize",
            MessageKind::CloseTerminal => "close_terminal",
            MessageKind::ListDrives => "list_drives",
            MessageKind::ListFiles => "list_files",
            MessageKind::ScanDirectory => "scan_directory",
            MessageKind::DownloadFile => "download_file",
            MessageKind::UploadFile => "upload_file",
            MessageKind::StartRemote => "start_remote",
            MessageKind::StopRemote => "stop_remote",
            MessageKind::RemoteInput => "remote_input",
            MessageKind::WebrtcStart => "webrtc_start",
            MessageKind::WebrtcSignal => "webrtc_signal",
            MessageKind::WebrtcStop => "webrtc_stop",
            MessageKind::CollectDiagnostics => "collect_diagnostics",
            MessageKind::UninstallAgent => "uninstall_agent",
            MessageKind::Response => "response",
            MessageKind::TerminalOutput => "terminal_output",
            MessageKind::FileChunk => "file_chunk",
            MessageKind::ScanProgress => "scan_progress",
            MessageKind::RemoteFrame => "remote_frame",
            MessageKind::Metrics => "metrics",
            MessageKind::TamperAlert => "tamper_alert",
            MessageKind::Unknown(s) => s.as_str(),
        }
    }

    fn from_wire_str(s: &str) -> Self {
        match s {
            "auth_challenge" => MessageKind::AuthChallenge,
            "auth_response" => MessageKind::AuthResponse,
            "heartbeat" => MessageKind::Heartbeat,
            "heartbeat_ack" => MessageKind::HeartbeatAck,
            "ping" => MessageKind::Ping,
            "pong" => MessageKind::Pong,
            "execute_command" => MessageKind::ExecuteCommand,
            "execute_script" => MessageKind::ExecuteScript,
            "start_terminal" => MessageKind::StartTerminal,
            "terminal_input" => MessageKind::TerminalInput,
            "terminal_resize" => MessageKind::TerminalResize,
            "close_terminal" => MessageKind::CloseTerminal,
            "list_drives" => MessageKind::ListDrives,
            "list_files" => MessageKind::ListFiles,
            "scan_directory" => MessageKind::ScanDirectory,
            "download_file" => MessageKind::DownloadFile,
            "upload_file" => MessageKind::UploadFile,
            "start_remote" => MessageKind::StartRemote,
            "stop_remote" => MessageKind::StopRemote,
            "remote_input" => MessageKind::RemoteInput,
            "webrtc_start" => MessageKind::WebrtcStart,
            "webrtc_signal" => MessageKind::WebrtcSignal,
            "webrtc_stop" => MessageKind::WebrtcStop,
            "collect_diagnostics" => MessageKind::CollectDiagnostics,
            "uninstall_agent" => MessageKind::UninstallAgent,
            "response" => MessageKind::Response,
            "terminal_output" => MessageKind::TerminalOutput,
            "file_chunk" => MessageKind::FileChunk,
            "scan_progress" => MessageKind::ScanProgress,
            "remote_frame" => MessageKind::RemoteFrame,
            "metrics" => MessageKind::Metrics,
            "tamper_alert" => MessageKind::TamperAlert,
            other => MessageKind::Unknown(other.to_string()),
        }
    }
}

impl Serialize for MessageKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_wire_str())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(MessageKind::from_wire_str(&s))
    }
}

/// A single control/data-plane frame. Newline-delimited JSON over the WebSocket text
/// channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Discriminates the frame's purpose.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Correlates a request with its response; absent on fire-and-forget frames.
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Opaque operation-specific payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    /// Set on `response` frames that failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Message {
    /// Builds a fire-and-forget frame (no `request_id`).
    pub fn fire(kind: MessageKind, data: Value) -> Self {
        Self {
            kind,
            request_id: None,
            data,
            error: None,
        }
    }

    /// Builds a correlated request frame.
    pub fn request(kind: MessageKind, request_id: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            request_id: Some(request_id.into()),
            data,
            error: None,
        }
    }

    /// Builds a success response to `request_id`.
    pub fn ok_response(request_id: impl Into<String>, data: Value) -> Self {
        Self {
            kind: MessageKind::Response,
            request_id: Some(request_id.into()),
            data,
            error: None,
        }
    }

    /// Builds a failure response to `request_id`.
    pub fn err_response(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Response,
            request_id: Some(request_id.into()),
            data: Value::Null,
            error: Some(error.into()),
        }
    }

    /// Serializes as a single newline-terminated JSON line, the wire framing used by both
    /// channels.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut s = serde_json::to_string(self)?;
        s.push('\n');
        Ok(s)
    }

    /// Parses a single frame. Malformed JSON is a protocol error the caller should log and
    /// drop rather than treat as fatal.
    pub fn parse(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_message_kind_does_not_fail_the_frame() {
        let line = r#"{"type":"future_operation","requestId":"r1","data":{}}"#;
        let msg = Message::parse(line).expect("unknown kinds must still parse");
        assert_eq!(msg.kind, MessageKind::Unknown("future_operation".to_string()));
        assert_eq!(msg.request_id.as_deref(), Some("r1"));
    }

    #[test]
    fn known_kind_round_trips() {
        let msg = Message::request(MessageKind::ExecuteCommand, "abc", serde_json::json!({"cmd": "ls"}));
        let line = msg.to_line().unwrap();
        let parsed = Message::parse(&line).unwrap();
        assert_eq!(parsed.kind, MessageKind::ExecuteCommand);
        assert_eq!(parsed.request_id.as_deref(), Some("abc"));
    }

    #[test]
    fn error_response_carries_no_data() {
        let msg = Message::err_response("r2", "boom");
        assert_eq!(msg.error.as_deref(), Some("boom"));
        assert!(msg.data.is_null());
    }
}
