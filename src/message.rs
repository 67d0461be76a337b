//! Module that contains the messages exchanged between peers.
//!
//! Every message travels as one JSON line. The caller writes a request line and
//! the callee answers with exactly one `Ack` line.

use crate::{clock::Timestamp, error::Result};
use serde::{Deserialize, Serialize};

/// Enum that represents every message a peer can send or receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Ask for permission to enter the critical section.
    Request {
        timestamp: Timestamp,
        requester: String,
    },
    /// Grant permission to a requester.
    Reply { timestamp: Timestamp, from: String },
    /// Liveness probe.
    Ping,
    /// Acknowledgement of any of the above.
    Ack,
}

impl Message {
    /// Function that returns the message as a JSON formatted `String`.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Function that parses a message from a JSON formatted `String`.
    pub fn from_json_string(line: &str) -> Result<Self> {
        Ok(serde_json::from_str::<Self>(line)?)
    }

    /// Function that returns a short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request { .. } => "Request",
            Self::Reply { .. } => "Reply",
            Self::Ping => "Ping",
            Self::Ack => "Ack",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_format() {
        let msg = Message::Request {
            timestamp: 4,
            requester: "127.0.0.1:5001".into(),
        };
        let line = msg.to_json_string().unwrap();
        assert_eq!(
            line,
            r#"{"Request":{"timestamp":4,"requester":"127.0.0.1:5001"}}"#
        );
        assert_eq!(Message::from_json_string(&line).unwrap(), msg);
    }

    #[test]
    fn unit_variants_are_plain_strings() {
        assert_eq!(Message::Ping.to_json_string().unwrap(), r#""Ping""#);
        assert_eq!(Message::from_json_string(r#""Ack""#).unwrap(), Message::Ack);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(Message::from_json_string("{\"Reply\":{}}").is_err());
        assert!(Message::from_json_string("hot potato").is_err());
    }
}
