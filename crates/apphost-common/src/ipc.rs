//! IPC control messages
//!
//! Messages travel between the master and its children as newline-delimited
//! JSON records. Every record carries a `name` discriminator:
//!
//! | name | direction | meaning |
//! |------|-----------|---------|
//! | `apphost:start` | worker → master | worker finished loading its applications |
//! | `apphost:exit` | worker → master | worker is exiting, optionally with an error |
//! | `apphost:forklongworker` | worker → master → workers | a long worker was forked |
//! | `apphost:exitlongworker` | worker → master → workers | a long worker exited |
//!
//! # Wire Format
//!
//! `{"name":"apphost:start","id":1}\n`
//!
//! One message per line; a line that fails to decode is reported to the caller
//! and never interpreted.

use serde::{Deserialize, Serialize};

use crate::error::{HostError, Result};

/// A control message exchanged over a process channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "name")]
pub enum IpcMessage {
    /// Worker start acknowledgement.
    #[serde(rename = "apphost:start")]
    Start {
        /// Numeric worker id of the sender
        id: u32,
    },

    /// Worker exit notification.
    #[serde(rename = "apphost:exit")]
    Exit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A long worker was forked for an application.
    #[serde(rename = "apphost:forklongworker", rename_all = "camelCase")]
    ForkLongWorker {
        app_name: String,
        node_id: String,
        pid: u32,
        /// Handler file the long worker executes (its identity key)
        file: String,
    },

    /// A long worker exited and must be forgotten.
    #[serde(rename = "apphost:exitlongworker", rename_all = "camelCase")]
    ExitLongWorker { app_name: String, node_id: String },
}

impl IpcMessage {
    /// The `name` discriminator of this message.
    pub fn name(&self) -> &'static str {
        match self {
            IpcMessage::Start { .. } => "apphost:start",
            IpcMessage::Exit { .. } => "apphost:exit",
            IpcMessage::ForkLongWorker { .. } => "apphost:forklongworker",
            IpcMessage::ExitLongWorker { .. } => "apphost:exitlongworker",
        }
    }

    /// Application this message refers to, if any.
    pub fn app_name(&self) -> Option<&str> {
        match self {
            IpcMessage::ForkLongWorker { app_name, .. }
            | IpcMessage::ExitLongWorker { app_name, .. } => Some(app_name),
            _ => None,
        }
    }

    /// Whether the master relays this message to every other worker.
    pub fn is_retranslated(&self) -> bool {
        matches!(
            self,
            IpcMessage::ForkLongWorker { .. } | IpcMessage::ExitLongWorker { .. }
        )
    }

    /// Encodes the message as one JSON line, newline included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }

    /// Decodes one line (with or without its trailing newline).
    pub fn decode(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Err(HostError::Ipc("empty message".into()));
        }
        serde_json::from_str(line)
            .map_err(|e| HostError::Ipc(format!("malformed message {:?}: {}", line, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_start_message_wire_shape() {
        let msg = IpcMessage::Start { id: 3 };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"name": "apphost:start", "id": 3}));
    }

    #[test]
    fn test_exit_without_error_omits_fields() {
        let msg = IpcMessage::Exit { code: None, error: None };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"name": "apphost:exit"}));
    }

    #[test]
    fn test_fork_long_worker_uses_camel_case() {
        let msg = IpcMessage::ForkLongWorker {
            app_name: "shop".into(),
            node_id: "S1N1L1".into(),
            pid: 4242,
            file: "/www/cart/long.js".into(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["appName"], "shop");
        assert_eq!(value["nodeId"], "S1N1L1");
        assert_eq!(value["name"], "apphost:forklongworker");
        assert_eq!(msg.app_name(), Some("shop"));
        assert!(msg.is_retranslated());
    }

    #[test]
    fn test_decode_line_with_newline() {
        let line = "{\"name\":\"apphost:exit\",\"error\":\"Can't bind to *:80\"}\n";
        let msg = IpcMessage::decode(line).unwrap();
        assert_eq!(
            msg,
            IpcMessage::Exit { code: None, error: Some("Can't bind to *:80".into()) }
        );
        assert!(!msg.is_retranslated());
    }

    #[test]
    fn test_encode_ends_with_single_newline() {
        let encoded = IpcMessage::ExitLongWorker {
            app_name: "a".into(),
            node_id: "n".into(),
        }
        .encode()
        .unwrap();
        assert_eq!(encoded.last(), Some(&b'\n'));
        assert_eq!(encoded.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[test]
    fn test_decode_rejects_unknown_name() {
        assert!(IpcMessage::decode("{\"name\":\"apphost:unknown\"}").is_err());
        assert!(IpcMessage::decode("").is_err());
        assert!(IpcMessage::decode("not json").is_err());
    }
}
