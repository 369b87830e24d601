//! Voice sessions over a WebSocket.
//!
//! The socket carries one JSON object per text message, tagged by `type`.
//! Client frames are [`ClientFrame`], server frames are [`ServerFrame`]:
//!
//! ```text
//! client                                   server
//!   ─── (upgrade) ───────────────────────▶
//!   ◀──────────────── ready {sessionId} ───
//!   ─── audio {data, mimeType} ──────────▶  (buffered)
//!   ─── audio ... ───────────────────────▶
//!   ─── stop ────────────────────────────▶  utterance boundary
//!   ◀─────────────────── transcript {data} ─
//!   ◀──────── response {data, sources, cached}
//! ```
//!
//! Errors (bad audio, STT failure, rate limiting, degraded service) arrive
//! as `error {data}` and leave the session usable. The per-session state
//! machine lives in [`session`]; live sessions are tracked in [`registry`].

pub mod registry;
pub mod session;

pub use registry::{SessionGuard, SessionInfo, SessionRegistry, SessionSummary};
pub use session::{CloseReason, Inbound, SessionSettings, SessionState, VoiceSession};

use serde::{Deserialize, Serialize};

use crate::models::SourceRef;

/// Message from the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// A base64 chunk of recorded audio.
    Audio {
        data: String,
        #[serde(rename = "mimeType", default = "default_mime_type")]
        mime_type: String,
    },
    /// End of the current utterance.
    #[serde(alias = "process_audio")]
    Stop,
    Ping,
    Close,
}

fn default_mime_type() -> String {
    "audio/webm".to_string()
}

/// Message to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Ready {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Transcript {
        data: String,
    },
    Response {
        data: String,
        #[serde(default)]
        sources: Vec<SourceRef>,
        #[serde(default)]
        cached: bool,
    },
    Error {
        data: String,
    },
    Pong,
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            data: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frames_parse() {
        let audio: ClientFrame =
            serde_json::from_str(r#"{"type":"audio","data":"AAEC","mimeType":"audio/ogg"}"#).unwrap();
        assert_eq!(
            audio,
            ClientFrame::Audio {
                data: "AAEC".into(),
                mime_type: "audio/ogg".into()
            }
        );

        let legacy: ClientFrame = serde_json::from_str(r#"{"type":"process_audio"}"#).unwrap();
        assert_eq!(legacy, ClientFrame::Stop);

        let no_mime: ClientFrame = serde_json::from_str(r#"{"type":"audio","data":""}"#).unwrap();
        assert!(matches!(no_mime, ClientFrame::Audio { mime_type, .. } if mime_type == "audio/webm"));
    }

    #[test]
    fn test_unknown_frame_type_rejected() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn test_server_frames_are_distinguishable() {
        let t = serde_json::to_value(ServerFrame::Transcript { data: "hi".into() }).unwrap();
        assert_eq!(t, serde_json::json!({"type": "transcript", "data": "hi"}));

        let r = serde_json::to_value(ServerFrame::Response {
            data: "answer".into(),
            sources: Vec::new(),
            cached: false,
        })
        .unwrap();
        assert_eq!(r["type"], "response");

        let ready = serde_json::to_value(ServerFrame::Ready {
            session_id: "abc".into(),
        })
        .unwrap();
        assert_eq!(ready["sessionId"], "abc");
        assert_eq!(serde_json::to_value(ServerFrame::error("x")).unwrap()["type"], "error");
    }
}
