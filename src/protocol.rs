//! Control-plane wire protocol.
//!
//! Transport is TCP; framing is one JSON object per LF-terminated UTF-8 line.
//! Every line is a self-contained request or response. Immediately after
//! accept, the server emits exactly one [`Banner`] line describing the
//! session, then answers requests strictly in order.
//!
//! ```text
//! Client                                  Server
//!   |                                        |
//!   |                        {banner}\n      |
//!   | <------------------------------------- |
//!   |  {"type":"StartContainer"}\n           |
//!   | -------------------------------------> |
//!   |            {"type":"ContainerStarted"} |
//!   | <------------------------------------- |
//! ```
//!
//! | Request          | Response                          |
//! |------------------|-----------------------------------|
//! | `StartContainer` | `ContainerStarted` or `Error`     |
//! | `GetStatus`      | `Status`                          |
//! | `Ping`           | `Pong`                            |
//! | `TouchEvent`     | `Ok`                              |
//! | `KeyEvent`       | `Ok`                              |
//! | malformed        | `Error`                           |
//!
//! When the screen stream is enabled, binary [`frame`] chunks are interleaved
//! between complete JSON lines on the same socket.

use serde::{Deserialize, Serialize};

// =============================================================================
// Daemon Status
// =============================================================================

/// Daemon-level container state, as reported in the banner.
///
/// ```text
/// setup_mode ──StartContainer──▶ booting ──latch──▶ running
///      ▲                           │
///      └────────reset──────────────┴──timeout/exit──▶ boot_failed
/// ```
///
/// `SetupMode` covers both an idle daemon and one whose rootfs has never been
/// initialized; either way no container is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonStatus {
    /// No container is running.
    SetupMode,
    /// A container start is in flight, waiting on the boot latch.
    Boot,
    /// The guest completed boot.
    Running,
    /// The last start attempt timed out or the guest exited early.
    BootFailed,
}

// =============================================================================
// Banner
// =============================================================================

/// The first line sent on every fresh connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Banner {
    pub status: DaemonStatus,
    pub width: u32,
    pub height: u32,
    /// True when no container is running.
    pub setup_mode: bool,
    /// True when the screen streamer is attached to this socket.
    pub streaming: bool,
    /// True when display goes through the scrcpy/ADB path instead.
    pub scrcpy_mode: bool,
}

// =============================================================================
// Requests
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Materialize the rootfs if needed and boot the container.
    StartContainer,
    /// Snapshot current state.
    GetStatus,
    /// Keep-alive.
    Ping,
    /// Touch input, coordinates in the server's declared resolution.
    TouchEvent {
        /// 0=DOWN, 1=UP, 2=MOVE, 3=CANCEL/POINTER_UP.
        action: i32,
        x: f32,
        y: f32,
        pointer_id: i32,
        pressure: f32,
    },
    /// Key input.
    KeyEvent { keycode: i32, pressed: bool },
}

// =============================================================================
// Responses
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// The container booted within the deadline.
    ContainerStarted,
    /// Snapshot of the daemon state.
    Status {
        container_running: bool,
        rootfs_path: String,
        width: u32,
        height: u32,
    },
    /// Generic acknowledgement.
    Ok,
    /// Keep-alive response.
    Pong,
    /// Request failed or could not be parsed.
    Error { message: String },
}

// =============================================================================
// Wire Helpers
// =============================================================================

/// Serializes a message as one LF-terminated JSON line.
pub fn to_json_line<T: Serialize>(message: &T) -> String {
    let mut line = serde_json::to_string(message).unwrap_or_else(|_| {
        r#"{"type":"Error","message":"serialization failed"}"#.to_string()
    });
    line.push('\n');
    line
}

/// Encodes a binary screen frame: `FRAME` + LE u32 width, height, length +
/// RGBA8888 payload.
pub fn frame(width: u32, height: u32, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(crate::constants::FRAME_HEADER.len() + 12 + data.len());
    out.extend_from_slice(crate::constants::FRAME_HEADER);
    out.extend_from_slice(&width.to_le_bytes());
    out.extend_from_slice(&height.to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_has_expected_keys() {
        let banner = Banner {
            status: DaemonStatus::SetupMode,
            width: 720,
            height: 1280,
            setup_mode: true,
            streaming: false,
            scrcpy_mode: false,
        };
        let line = to_json_line(&banner);
        assert!(line.ends_with('\n'));
        assert!(line.contains("\"status\":\"setup_mode\""));
        assert!(line.contains("\"width\":720"));
        assert!(line.contains("\"height\":1280"));
        assert!(line.contains("\"setup_mode\":true"));
        assert!(line.contains("\"streaming\":false"));
        assert!(line.contains("\"scrcpy_mode\":false"));
    }

    #[test]
    fn requests_round_trip() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"StartContainer"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::StartContainer));

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"TouchEvent","action":0,"x":10.5,"y":20.0,"pointer_id":1,"pressure":1.0}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::TouchEvent {
                action, pointer_id, ..
            } => {
                assert_eq!(action, 0);
                assert_eq!(pointer_id, 1);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let result = serde_json::from_str::<ClientMessage>(r#"{"type":"Nope"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn status_response_shape() {
        let line = to_json_line(&ServerMessage::Status {
            container_running: true,
            rootfs_path: "/data/rootfs".to_string(),
            width: 720,
            height: 1280,
        });
        assert!(line.contains("\"type\":\"Status\""));
        assert!(line.contains("\"container_running\":true"));
    }

    #[test]
    fn frame_layout() {
        let data = vec![0u8; 16];
        let chunk = frame(2, 2, &data);
        assert_eq!(&chunk[..5], b"FRAME");
        assert_eq!(u32::from_le_bytes(chunk[5..9].try_into().unwrap()), 2);
        assert_eq!(u32::from_le_bytes(chunk[9..13].try_into().unwrap()), 2);
        assert_eq!(u32::from_le_bytes(chunk[13..17].try_into().unwrap()), 16);
        assert_eq!(chunk.len(), 17 + 16);
    }
}
