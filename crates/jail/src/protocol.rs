//! Line protocol spoken between the driver and a jailed worker
//!
//! Every message is one JSON object on its own line, tagged as
//! `{"type": "...", "payload": {...}}`. The driver writes to the worker's
//! stdin and reads the worker's stdout; the worker logs to stderr.

use awap_pool::{DriverError, JobPayload, JobResult};
use serde::{Deserialize, Serialize};

/// Message exchanged with a jailed worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum JailMessage {
    /// Run a job
    Execute {
        request_id: String,
        input: JobPayload,
    },

    /// Job finished
    Result {
        request_id: String,
        output: JobResult,
    },

    /// Job (or the worker itself, when `request_id` is absent) failed
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        message: String,
    },

    /// Liveness probe
    Ping { timestamp: i64 },

    /// Liveness answer
    Pong { timestamp: i64 },

    /// Ask the worker to exit
    Shutdown,
}

impl JailMessage {
    /// A ping stamped with the current time
    pub fn ping() -> Self {
        Self::Ping {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Serialize as a single newline-terminated line
    pub fn encode(&self) -> Result<String, DriverError> {
        let mut line =
            serde_json::to_string(self).map_err(|e| DriverError::Protocol(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one line read from a worker
    pub fn decode(line: &str) -> Result<Self, DriverError> {
        serde_json::from_str(line.trim())
            .map_err(|e| DriverError::Protocol(format!("invalid message {:?}: {e}", line.trim())))
    }

    /// Request id carried by this message, if any
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Execute { request_id, .. } | Self::Result { request_id, .. } => {
                Some(request_id.as_str())
            }
            Self::Error { request_id, .. } => request_id.as_deref(),
            Self::Ping { .. } | Self::Pong { .. } | Self::Shutdown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_execute_wire_format() {
        let message = JailMessage::Execute {
            request_id: "r-1".into(),
            input: json!({"submission": "print(1)"}),
        };
        let line = message.encode().unwrap();

        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "Execute");
        assert_eq!(value["payload"]["request_id"], "r-1");
        assert_eq!(value["payload"]["input"]["submission"], "print(1)");
    }

    #[test]
    fn test_shutdown_has_no_payload() {
        let line = JailMessage::Shutdown.encode().unwrap();
        assert_eq!(line, "{\"type\":\"Shutdown\"}\n");
    }

    #[test]
    fn test_decode_worker_messages() {
        let result = JailMessage::decode(
            r#"{"type":"Result","payload":{"request_id":"r-9","output":{"score":7}}}"#,
        )
        .unwrap();
        assert_eq!(result.request_id(), Some("r-9"));

        let error =
            JailMessage::decode(r#"{"type":"Error","payload":{"message":"model not loaded"}}"#)
                .unwrap();
        assert_eq!(
            error,
            JailMessage::Error {
                request_id: None,
                message: "model not loaded".into()
            }
        );

        let pong = JailMessage::decode("{\"type\":\"Pong\",\"payload\":{\"timestamp\":42}}\n")
            .unwrap();
        assert_eq!(pong, JailMessage::Pong { timestamp: 42 });
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = JailMessage::decode("loading weights...").unwrap_err();
        assert!(matches!(err, DriverError::Protocol(_)));

        let err = JailMessage::decode(r#"{"type":"Teleport","payload":{}}"#).unwrap_err();
        assert!(matches!(err, DriverError::Protocol(_)));
    }
}
