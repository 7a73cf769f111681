//! Wire protocol for client-server communication.
//!
//! JSON text frames tagged by `type`; byte strings are standard base64.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use shell_broker_core::{
    AuthMethod, BrokerEvent, Credential, ErrorKind, SessionSnapshot, StatusState,
};
use thiserror::Error;

/// Undecodable inbound frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid input encoding: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Binary frame is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a remote shell. Missing fields are reported by validation.
    Connect {
        #[serde(default)]
        host: String,
        #[serde(default)]
        port: Option<i64>,
        #[serde(default)]
        username: String,
        #[serde(default)]
        credential: Credential,
        #[serde(default)]
        auth_method: AuthMethod,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },
    /// Terminal input data (base64 encoded).
    Input { data: String },
    /// Resize terminal.
    Resize { cols: u16, rows: u16 },
    /// End the remote shell.
    Disconnect,
    /// Ask for the current session state.
    GetStatus,
    /// Ping for keepalive.
    Ping,
}

impl ClientMessage {
    /// Parse one text frame.
    ///
    /// # Errors
    /// Returns error if the frame is not a known message.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Create an input message from raw bytes.
    #[must_use]
    pub fn input(data: &[u8]) -> Self {
        Self::Input {
            data: BASE64.encode(data),
        }
    }

    /// Decode input data from base64.
    ///
    /// # Errors
    /// Returns error if `data` is not valid base64.
    pub fn decode_input(data: &str) -> Result<Vec<u8>, ProtocolError> {
        Ok(BASE64.decode(data)?)
    }
}

/// Message from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection state change or `get_status` reply.
    Status {
        state: StatusState,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<SessionSnapshot>,
    },
    /// Terminal output data (base64 encoded).
    Output { data: String },
    /// Rejected operation or session failure.
    Error { kind: ErrorKind, message: String },
    /// Pong response.
    Pong,
}

impl ServerMessage {
    /// Create an output message from raw bytes.
    #[must_use]
    pub fn output(data: &[u8]) -> Self {
        Self::Output {
            data: BASE64.encode(data),
        }
    }

    /// Decode output data from base64.
    #[must_use]
    pub fn decode_output(&self) -> Option<Vec<u8>> {
        if let Self::Output { data } = self {
            BASE64.decode(data).ok()
        } else {
            None
        }
    }

    /// Serialize to a JSON text frame.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<BrokerEvent> for ServerMessage {
    fn from(event: BrokerEvent) -> Self {
        match event {
            BrokerEvent::Status {
                state,
                message,
                snapshot,
            } => Self::Status {
                state,
                message,
                session: snapshot,
            },
            BrokerEvent::Output(data) => Self::output(&data),
            BrokerEvent::Error { kind, message } => Self::Error { kind, message },
            BrokerEvent::Pong => Self::Pong,
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_connect_parses_with_defaults() {
        let msg = ClientMessage::parse(
            r#"{"type":"connect","host":"example.com","port":22,"username":"alice","credential":"pw"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Connect {
                host: "example.com".into(),
                port: Some(22),
                username: "alice".into(),
                credential: Credential::new("pw"),
                auth_method: AuthMethod::Password,
                cols: None,
                rows: None,
            }
        );

        let msg = ClientMessage::parse(r#"{"type":"connect"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Connect { port: None, .. }));
    }

    #[test]
    fn test_unit_messages() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"get_status"}"#).unwrap(),
            ClientMessage::GetStatus
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"disconnect"}"#).unwrap(),
            ClientMessage::Disconnect
        );
        assert_eq!(serde_json::to_value(ServerMessage::Pong).unwrap(), json!({"type": "pong"}));
    }

    #[test]
    fn test_invalid_frames() {
        assert!(ClientMessage::parse("not json").is_err());
        assert!(ClientMessage::parse(r#"{"type":"launch"}"#).is_err());
        assert!(ClientMessage::parse(r#"{"type":"resize","cols":-1,"rows":24}"#).is_err());
        assert!(matches!(
            ClientMessage::decode_input("%%%"),
            Err(ProtocolError::Base64(_))
        ));
    }

    #[test]
    fn test_input_roundtrip() {
        let original = b"ls -la\r";
        let ClientMessage::Input { data } = ClientMessage::input(original) else {
            panic!("Wrong message type");
        };
        assert_eq!(ClientMessage::decode_input(&data).unwrap(), original);
    }

    #[test]
    fn test_events_map_to_wire() {
        let msg = ServerMessage::from(BrokerEvent::Output(Bytes::from_static(b"\x1b[1mhi")));
        assert_eq!(msg.decode_output().unwrap(), b"\x1b[1mhi");

        let msg = ServerMessage::from(BrokerEvent::Error {
            kind: ErrorKind::Validation,
            message: "Invalid host format".into(),
        });
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "error", "kind": "validation", "message": "Invalid host format"})
        );

        let msg = ServerMessage::from(BrokerEvent::Status {
            state: StatusState::Disconnected,
            message: "No active connection".into(),
            snapshot: None,
        });
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "status", "state": "disconnected", "message": "No active connection"})
        );
    }
}
