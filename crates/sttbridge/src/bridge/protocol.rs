//! Wire protocol types for host-worker communication.
//!
//! Both directions are one JSON object per line:
//! - **Commands** (host → worker stdin): `{"command": "<name>", <param>: <value>, ...}`
//! - **Messages** (worker stdout → host): `{"type": "<kind>", "data": {...}, "timestamp": ...}`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Discriminator key of an outbound command record.
pub const COMMAND_KEY: &str = "command";

/// Message emitted by the worker on stdout.
///
/// Only `type` is required. The payload is opaque to the bridge and is
/// forwarded to observers as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
}

/// Command written to the worker's stdin.
///
/// Parameters are merged flat into the record next to `command`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    command: String,
    #[serde(flatten)]
    params: Map<String, Value>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            command: name.into(),
            params: Map::new(),
        }
    }

    /// Add a named parameter. `command` is reserved and cannot be overridden.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key == COMMAND_KEY {
            tracing::warn!(command = %self.command, "Ignoring reserved parameter name 'command'");
            return self;
        }
        self.params.insert(key, value.into());
        self
    }

    /// Load the model and open the capture device.
    pub fn initialize(device_index: i64, model: impl Into<String>) -> Self {
        Self::new("initialize")
            .with_param("deviceIndex", device_index)
            .with_param("model", model.into())
    }

    pub fn start() -> Self {
        Self::new("start")
    }

    pub fn stop() -> Self {
        Self::new("stop")
    }

    pub fn list_devices() -> Self {
        Self::new("list_devices")
    }

    /// Graceful exit request.
    pub fn exit() -> Self {
        Self::new("exit")
    }

    pub fn name(&self) -> &str {
        &self.command
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }
}

/// `transcription` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    pub text: String,
    #[serde(default)]
    pub is_stable: bool,
    #[serde(default)]
    pub is_partial: bool,
    #[serde(default)]
    pub is_final: bool,
}

/// `devices` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceList {
    pub devices: Vec<AudioDevice>,
}

/// Audio device as reported by the worker, in worker order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioDevice {
    pub index: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub channels: i64,
    #[serde(rename = "sampleRate", default)]
    pub sample_rate: i64,
}

impl AudioDevice {
    /// Devices with no input channels cannot be used for capture.
    pub fn is_input_capable(&self) -> bool {
        self.channels > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn initialize_serializes_flat() {
        insta::assert_json_snapshot!(Command::initialize(34, "tiny"), @r#"
        {
          "command": "initialize",
          "deviceIndex": 34,
          "model": "tiny"
        }
        "#);
    }

    #[test]
    fn bare_commands_have_no_params() {
        for (cmd, name) in [
            (Command::start(), "start"),
            (Command::stop(), "stop"),
            (Command::list_devices(), "list_devices"),
            (Command::exit(), "exit"),
        ] {
            assert_eq!(serde_json::to_value(&cmd).unwrap(), json!({ "command": name }));
        }
    }

    #[test]
    fn reserved_param_is_ignored() {
        let cmd = Command::new("start").with_param("command", "exit");
        assert_eq!(cmd.name(), "start");
        assert!(cmd.params().is_empty());
        assert_eq!(serde_json::to_value(&cmd).unwrap(), json!({ "command": "start" }));
    }

    #[test]
    fn inbound_message_defaults() {
        let msg: InboundMessage = serde_json::from_str(r#"{"type":"ready"}"#).unwrap();
        assert_eq!(msg.kind, "ready");
        assert_eq!(msg.data, Value::Null);
        assert_eq!(msg.timestamp, None);

        let msg: InboundMessage = serde_json::from_str(
            r#"{"type":"status","data":{"message":"Loading models..."},"timestamp":1712.5}"#,
        )
        .unwrap();
        assert_eq!(msg.data["message"], "Loading models...");
        assert_eq!(msg.timestamp, Some(json!(1712.5)));
    }

    #[test]
    fn inbound_message_requires_type() {
        assert!(serde_json::from_str::<InboundMessage>(r#"{"data":{}}"#).is_err());
        assert!(serde_json::from_str::<InboundMessage>(r#"{"type":7}"#).is_err());
    }

    #[test]
    fn transcription_flags_default_false() {
        let t: Transcription =
            serde_json::from_value(json!({"text": "hello", "is_partial": true})).unwrap();
        assert_eq!(t.text, "hello");
        assert!(t.is_partial);
        assert!(!t.is_stable);
        assert!(!t.is_final);
    }

    #[test]
    fn device_list_parses_worker_shape() {
        let list: DeviceList = serde_json::from_value(json!({
            "devices": [
                {"index": 0, "name": "Speakers", "channels": 0, "sampleRate": 48000},
                {"index": 34, "name": "Stereo Mix", "channels": 2, "sampleRate": 44100}
            ]
        }))
        .unwrap();

        assert_eq!(list.devices.len(), 2);
        assert!(!list.devices[0].is_input_capable());
        assert!(list.devices[1].is_input_capable());
        assert_eq!(list.devices[1].sample_rate, 44100);
    }
}
