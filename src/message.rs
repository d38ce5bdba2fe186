//! Message (C1): the immutable record carrying IDs, channel, and payload.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::backend::BusError;

/// A single published message.
///
/// `message_id` is monotonic per channel; `global_id` is monotonic across
/// the whole bus. Both are assigned atomically by the backend at publish
/// time and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub global_id: u64,
    pub message_id: u64,
    pub channel: String,
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<HashSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_ids: Option<HashSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ids: Option<HashSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
}

impl Message {
    /// Encode to the wire format: `global_id|message_id|channel\n<payload>`.
    ///
    /// Only the first newline is significant, so payloads may contain
    /// embedded newlines and `|` characters.
    pub fn encode(&self) -> Vec<u8> {
        let header = format!("{}|{}|{}\n", self.global_id, self.message_id, self.channel);
        let mut out = Vec::with_capacity(header.len() + self.data.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// Decode a wire-format payload produced by [`Message::encode`].
    ///
    /// `user_ids`/`group_ids`/`client_ids`/`site_id` are not part of the
    /// wire header; callers that need scoping metadata carry it alongside
    /// (the backend stores it in the same sorted-set member, see
    /// `backend::redis::encode_member`).
    pub fn decode(bytes: &[u8]) -> Result<Self, BusError> {
        let nl = bytes
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| BusError::MalformedMessage("missing header newline".into()))?;
        let (header, rest) = bytes.split_at(nl);
        let payload = &rest[1..];

        let header = std::str::from_utf8(header)
            .map_err(|e| BusError::MalformedMessage(format!("invalid header utf8: {e}")))?;
        let mut parts = header.splitn(3, '|');
        let global_id = parts
            .next()
            .ok_or_else(|| BusError::MalformedMessage("missing global_id".into()))?;
        let message_id = parts
            .next()
            .ok_or_else(|| BusError::MalformedMessage("missing message_id".into()))?;
        let channel = parts
            .next()
            .ok_or_else(|| BusError::MalformedMessage("missing channel".into()))?;

        if parts.next().is_some() {
            return Err(BusError::MalformedMessage("too many header parts".into()));
        }

        let global_id = global_id
            .parse()
            .map_err(|_| BusError::MalformedMessage(format!("bad global_id: {global_id}")))?;
        let message_id = message_id
            .parse()
            .map_err(|_| BusError::MalformedMessage(format!("bad message_id: {message_id}")))?;

        Ok(Message {
            global_id,
            message_id,
            channel: channel.to_string(),
            data: payload.to_vec(),
            user_ids: None,
            group_ids: None,
            client_ids: None,
            site_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(global_id: u64, message_id: u64, channel: &str, data: &[u8]) -> Message {
        Message {
            global_id,
            message_id,
            channel: channel.to_string(),
            data: data.to_vec(),
            user_ids: None,
            group_ids: None,
            client_ids: None,
            site_id: None,
        }
    }

    #[test]
    fn round_trip_simple() {
        let m = msg(1, 1, "/chat", b"hello");
        assert_eq!(Message::decode(&m.encode()).unwrap(), m);
    }

    #[test]
    fn round_trip_embedded_newline_and_pipe() {
        let m = msg(42, 7, "/x|y", b"line one\nline two|with pipe");
        let decoded = Message::decode(&m.encode()).unwrap();
        assert_eq!(decoded.global_id, m.global_id);
        assert_eq!(decoded.message_id, m.message_id);
        assert_eq!(decoded.channel, m.channel);
        assert_eq!(decoded.data, m.data);
    }

    #[test]
    fn round_trip_empty_payload() {
        let m = msg(1, 1, "/x", b"");
        assert_eq!(Message::decode(&m.encode()).unwrap(), m);
    }

    #[test]
    fn decode_rejects_missing_newline() {
        assert!(Message::decode(b"1|1|/x").is_err());
    }

    #[test]
    fn decode_rejects_malformed_header() {
        assert!(Message::decode(b"1|/x\npayload").is_err());
        assert!(Message::decode(b"nan|1|/x\npayload").is_err());
    }
}
