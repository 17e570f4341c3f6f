//! Wire protocol for one command hand-off session.
//!
//! Self-describing messages (the spawn request, resize events) travel as
//! JSON, one message per transport frame. Status words are fixed 8-byte
//! little-endian integers so the reader never has to parse to know their
//! length.

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Upper bound for an encoded spawn request. Anything larger is treated
/// as malformed.
pub const MAX_SPAWN_REQUEST_LEN: usize = 8 * 1024;

/// Width of an encoded status word.
pub const STATUS_LEN: usize = 8;

/// Early status: the command resolved and will be spawned.
pub const STATUS_ACCEPTED: u64 = 0;

/// Early status: the command did not resolve; nothing was spawned.
pub const STATUS_COMMAND_NOT_FOUND: u64 = 1;

/// Everything the server needs to spawn one command, sent by the client as
/// the first message on the Info channel. Consumed exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnRequest {
    /// Working directory for the spawned command
    pub cwd: String,
    /// Argument vector; the first element names the executable
    pub args: Vec<String>,
    /// Environment as KEY=VALUE strings, replacing the server's own
    pub envs: Vec<String>,
    /// Opaque per-invocation token, used in server logs for correlation
    pub session: String,
}

/// One terminal geometry change, client to server. Latest wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeEvent {
    pub rows: u16,
    pub cols: u16,
}

/// Encode a self-describing message as JSON.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(msg)?)
}

/// Decode a self-describing message from JSON bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Encode a status word as 8 little-endian bytes.
pub fn encode_status(code: u64) -> [u8; STATUS_LEN] {
    code.to_le_bytes()
}

/// Decode a status word. Returns `None` when the payload is too short to
/// carry one.
pub fn decode_status(bytes: &[u8]) -> Option<u64> {
    let raw: [u8; STATUS_LEN] = bytes.get(..STATUS_LEN)?.try_into().ok()?;
    Some(u64::from_le_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_spawn_request_roundtrip() {
        let request = SpawnRequest {
            cwd: "/home/user/project".to_string(),
            args: vec!["vim".to_string(), "notes.txt".to_string()],
            envs: vec!["TERM=xterm-256color".to_string(), "LANG=C.UTF-8".to_string()],
            session: "4f3a9c".to_string(),
        };
        let encoded = encode(&request).unwrap();
        let decoded: SpawnRequest = decode(&encoded).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_spawn_request_is_self_describing() {
        let request = SpawnRequest {
            cwd: "/tmp".to_string(),
            args: vec!["ls".to_string()],
            envs: vec![],
            session: "t0".to_string(),
        };
        let json = String::from_utf8(encode(&request).unwrap()).unwrap();
        assert!(json.contains("\"cwd\""));
        assert!(json.contains("\"args\""));
        assert!(json.contains("\"envs\""));
        assert!(json.contains("\"session\""));
    }

    #[test]
    fn test_resize_event_roundtrip() {
        let event = ResizeEvent { rows: 40, cols: 120 };
        let encoded = encode(&event).unwrap();
        let decoded: ResizeEvent = decode(&encoded).unwrap();
        assert_eq!(decoded, event);
        let json = String::from_utf8(encoded).unwrap();
        assert!(json.contains("\"rows\":40"));
        assert!(json.contains("\"cols\":120"));
    }

    #[test]
    fn test_status_roundtrip() {
        for code in [STATUS_ACCEPTED, STATUS_COMMAND_NOT_FOUND, 7, 130] {
            let bytes = encode_status(code);
            assert_eq!(bytes.len(), STATUS_LEN);
            assert_eq!(decode_status(&bytes), Some(code));
        }
    }

    #[test]
    fn test_status_little_endian_layout() {
        assert_eq!(encode_status(1), [1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_status_rejects_short_payload() {
        assert_eq!(decode_status(&[1, 0, 0]), None);
        assert_eq!(decode_status(&[]), None);
    }

    #[test]
    fn test_decode_malformed_spawn_request_fails() {
        assert!(decode::<SpawnRequest>(b"{not json").is_err());
        assert!(decode::<SpawnRequest>(b"[1,2,3]").is_err());
    }
}
