//! Wire protocol types for client-adapter communication.
//!
//! Three envelope kinds share one `type`-tagged JSON object:
//! - **request**: `seq`, `command`, `arguments`
//! - **response**: `seq`, `request_seq`, `success`, `command`, `body` or `message`
//! - **event**: `seq`, `event`, `body`
//!
//! Typed argument and body structs cover the commands and events the engine
//! itself consumes and emits. Everything else travels as raw `serde_json::Value`.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Sequence number of a message within a session.
pub type Seq = i64;

/// Command names the session state machine handles itself.
pub mod command {
    pub const INITIALIZE: &str = "initialize";
    pub const LAUNCH: &str = "launch";
    pub const ATTACH: &str = "attach";
    pub const CONFIGURATION_DONE: &str = "configurationDone";
    pub const DISCONNECT: &str = "disconnect";
}

/// Event names the engine emits.
pub mod event {
    pub const OUTPUT: &str = "output";
    pub const INITIALIZED: &str = "initialized";
    pub const EXITED: &str = "exited";
    pub const TERMINATED: &str = "terminated";
}

/// A single framed protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Request(Request),
    Response(Response),
    Event(Event),
}

impl Message {
    pub fn seq(&self) -> Seq {
        match self {
            Self::Request(r) => r.seq,
            Self::Response(r) => r.seq,
            Self::Event(e) => e.seq,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub seq: Seq,
    pub command: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub arguments: serde_json::Value,
}

impl Request {
    /// Decode `arguments` into a typed struct. A missing `arguments` field
    /// decodes as an empty object so all-optional argument structs work.
    pub fn parse_arguments<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        if self.arguments.is_null() {
            serde_json::from_value(serde_json::Value::Object(Default::default()))
        } else {
            serde_json::from_value(self.arguments.clone())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub seq: Seq,
    pub request_seq: Seq,
    pub success: bool,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: Seq,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

/// Arguments of the `initialize` request. Unknown client capability fields
/// are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeArguments {
    #[serde(rename = "adapterID", default, skip_serializing_if = "Option::is_none")]
    pub adapter_id: Option<String>,
    #[serde(rename = "clientID", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchArguments {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Overrides the service-wide terminate-on-disconnect policy for this launch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminate_on_disconnect: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachArguments {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debuggee_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectArguments {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminate_debuggee: Option<bool>,
}

/// Category of an `output` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputCategory {
    Telemetry,
    Stdout,
    Stderr,
}

impl OutputCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Telemetry => "telemetry",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputEventBody {
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub category: OutputCategory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitedEventBody {
    pub exit_code: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_deserializes_without_arguments() {
        let msg: Message =
            serde_json::from_value(json!({"seq": 3, "type": "request", "command": "configurationDone"}))
                .unwrap();
        match msg {
            Message::Request(req) => {
                assert_eq!(req.seq, 3);
                assert_eq!(req.command, "configurationDone");
                assert!(req.arguments.is_null());
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn response_omits_absent_message_and_body() {
        let resp = Message::Response(Response {
            seq: 4,
            request_seq: 1,
            success: true,
            command: "launch".to_string(),
            message: None,
            body: None,
        });
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({
                "type": "response",
                "seq": 4,
                "request_seq": 1,
                "success": true,
                "command": "launch",
            })
        );
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let ev = Message::Event(Event {
            seq: 7,
            event: event::EXITED.to_string(),
            body: Some(serde_json::to_value(ExitedEventBody { exit_code: 42 }).unwrap()),
        });
        insta::assert_json_snapshot!("exited_event", ev);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let result =
            serde_json::from_value::<Message>(json!({"seq": 1, "type": "notification", "event": "x"}));
        assert!(result.is_err());
    }

    #[test]
    fn initialize_arguments_use_protocol_field_names() {
        let req = Request {
            seq: 1,
            command: command::INITIALIZE.to_string(),
            arguments: json!({"adapterID": "spam", "clientID": "vscode", "linesStartAt1": true}),
        };
        let args: InitializeArguments = req.parse_arguments().unwrap();
        assert_eq!(args.adapter_id.as_deref(), Some("spam"));
        assert_eq!(args.client_id.as_deref(), Some("vscode"));
        assert!(args.client_name.is_none());
    }

    #[test]
    fn launch_arguments_default_optional_fields() {
        let req = Request {
            seq: 2,
            command: command::LAUNCH.to_string(),
            arguments: json!({"program": "/bin/true"}),
        };
        let args: LaunchArguments = req.parse_arguments().unwrap();
        assert_eq!(args.program, "/bin/true");
        assert!(args.args.is_empty());
        assert!(args.env.is_empty());
        assert!(args.cwd.is_none());
        assert!(args.terminate_on_disconnect.is_none());
    }

    #[test]
    fn missing_arguments_parse_as_empty_object() {
        let req = Request {
            seq: 9,
            command: command::DISCONNECT.to_string(),
            arguments: serde_json::Value::Null,
        };
        let args: DisconnectArguments = req.parse_arguments().unwrap();
        assert_eq!(args.terminate_debuggee, None);
    }

    #[test]
    fn output_body_field_order_matches_wire_convention() {
        let body = OutputEventBody {
            output: "hello\n".to_string(),
            data: None,
            category: OutputCategory::Stderr,
        };
        assert_eq!(
            serde_json::to_string(&body).unwrap(),
            r#"{"output":"hello\n","category":"stderr"}"#
        );
    }
}
