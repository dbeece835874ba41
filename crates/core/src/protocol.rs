//! Worker IPC protocol: JSON lines over the worker's stdin and stdout.
//!
//! Requests are written as `{requestId, request, body}`. Responses arrive as
//! `{requestId, stopped, body}` where `body` is one of
//! `{state: "running", imageProgress}`, `{state: "complete", images, seed}`,
//! or `{error}`. Bodies are decoded once, here, into [`ResponseBody`];
//! anything else becomes [`ResponseBody::Rejected`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::options::DreamSettings;
use crate::types::DreamId;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Generate,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRequest {
    /// `None` for control requests that expect no response.
    pub request_id: Option<DreamId>,
    pub request: RequestKind,
    #[serde(default)]
    pub body: Value,
}

impl WorkerRequest {
    pub fn new(request_id: DreamId, request: RequestKind, body: Value) -> Self {
        Self {
            request_id: Some(request_id),
            request,
            body,
        }
    }

    pub fn stop() -> Self {
        Self {
            request_id: None,
            request: RequestKind::Stop,
            body: Value::Null,
        }
    }
}

/// Body of a `generate` request: the dream's settings snapshot plus the
/// bytes of any uploaded images it references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateBody {
    #[serde(flatten)]
    pub settings: DreamSettings,
    #[serde(
        default,
        with = "base64_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub base_image: Option<Vec<u8>>,
    #[serde(
        default,
        with = "base64_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub base_image_mask: Option<Vec<u8>>,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerImageState {
    Pending,
    Running,
    Complete,
}

/// Progress of one image, reported positionally (entry `i` is image `i`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageProgress {
    pub state: WorkerImageState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u32>,
    #[serde(
        default,
        with = "base64_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub image: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
}

/// A response body the receiving side refused to interpret.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("protocol violation: {0}")]
pub struct ProtocolViolation(pub String);

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Running {
        image_progress: Vec<ImageProgress>,
    },
    Complete {
        images: Vec<ImageProgress>,
        seed: u32,
    },
    /// `crashed` is set only for failures synthesized by the watchdog.
    Error {
        message: String,
        crashed: bool,
    },
    Rejected(ProtocolViolation),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunningWire {
    image_progress: Vec<ImageProgress>,
}

#[derive(Deserialize)]
struct CompleteWire {
    images: Vec<ImageProgress>,
    seed: u32,
}

impl ResponseBody {
    /// Decode a raw body. Never fails: unusable bodies become `Rejected`.
    pub fn decode(raw: Value) -> Self {
        Self::try_decode(raw).unwrap_or_else(Self::Rejected)
    }

    fn try_decode(raw: Value) -> Result<Self, ProtocolViolation> {
        if let Some(error) = raw.get("error") {
            let message = match error {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Ok(Self::Error {
                message,
                crashed: false,
            });
        }

        let state = raw
            .get("state")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolViolation("body has neither state nor error".to_string()))?;

        match state {
            "running" => {
                let wire: RunningWire = serde_json::from_value(raw.clone())
                    .map_err(|e| ProtocolViolation(format!("malformed running body: {e}")))?;
                Ok(Self::Running {
                    image_progress: wire.image_progress,
                })
            }
            "complete" => {
                let wire: CompleteWire = serde_json::from_value(raw.clone())
                    .map_err(|e| ProtocolViolation(format!("malformed complete body: {e}")))?;
                Ok(Self::Complete {
                    images: wire.images,
                    seed: wire.seed,
                })
            }
            other => Err(ProtocolViolation(format!("unknown response state '{other}'"))),
        }
    }

    /// Wire form of this body.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Running { image_progress } => {
                json!({ "state": "running", "imageProgress": image_progress })
            }
            Self::Complete { images, seed } => {
                json!({ "state": "complete", "images": images, "seed": seed })
            }
            Self::Error { message, .. } => json!({ "error": message }),
            Self::Rejected(violation) => json!({ "error": violation.to_string() }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerResponse {
    pub request_id: DreamId,
    /// Terminal flag: no further responses follow for this request.
    pub stopped: bool,
    pub body: ResponseBody,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseWire {
    request_id: DreamId,
    #[serde(default)]
    stopped: bool,
    #[serde(default)]
    body: Value,
}

impl WorkerResponse {
    /// A terminal error that did not come from the worker itself.
    pub fn crashed(request_id: DreamId, message: impl Into<String>) -> Self {
        Self {
            request_id,
            stopped: true,
            body: ResponseBody::Error {
                message: message.into(),
                crashed: true,
            },
        }
    }

    /// Decode one stdout line. Fails only when the envelope itself (and so
    /// the request id) is unreadable.
    pub fn decode_line(line: &str) -> Result<Self, serde_json::Error> {
        let wire: ResponseWire = serde_json::from_str(line)?;
        Ok(Self {
            request_id: wire.request_id,
            stopped: wire.stopped,
            body: ResponseBody::decode(wire.body),
        })
    }

    pub fn encode_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&ResponseWire {
            request_id: self.request_id,
            stopped: self.stopped,
            body: self.body.to_value(),
        })
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

/// `Option<Vec<u8>>` as an optional base64 string. Accepts an optional
/// `data:<mime>;base64,` prefix on input.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let Some(encoded) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        let payload = match encoded.split_once(";base64,") {
            Some((prefix, rest)) if prefix.starts_with("data:") => rest,
            _ => encoded.as_str(),
        };
        STANDARD.decode(payload).map(Some).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn request_uses_camel_case_envelope() {
        let id = DreamId::new();
        let request = WorkerRequest::new(id, RequestKind::Generate, json!({"prompt": "x"}));
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["requestId"], json!(id.to_string()));
        assert_eq!(json["request"], "generate");
        assert_eq!(json["body"]["prompt"], "x");
    }

    #[test]
    fn stop_request_has_no_id() {
        let json = serde_json::to_value(WorkerRequest::stop()).unwrap();
        assert_eq!(json["requestId"], Value::Null);
        assert_eq!(json["request"], "stop");
    }

    #[test]
    fn decodes_running_body() {
        let id = DreamId::new();
        let line = json!({
            "requestId": id,
            "stopped": false,
            "body": {
                "state": "running",
                "imageProgress": [
                    {"state": "complete", "seed": 42, "completedSteps": 20, "totalSteps": 20},
                    {"state": "running", "completedSteps": 3}
                ]
            }
        })
        .to_string();

        let response = WorkerResponse::decode_line(&line).unwrap();
        assert_eq!(response.request_id, id);
        assert!(!response.stopped);
        let ResponseBody::Running { image_progress } = response.body else {
            panic!("Expected Running, got {:?}", response.body);
        };
        assert_eq!(image_progress.len(), 2);
        assert_eq!(image_progress[0].state, WorkerImageState::Complete);
        assert_eq!(image_progress[1].completed_steps, Some(3));
    }

    #[test]
    fn decodes_complete_body() {
        let body = ResponseBody::decode(json!({
            "state": "complete",
            "images": [{"state": "complete", "image": "iVBORw=="}],
            "seed": 42
        }));
        match body {
            ResponseBody::Complete { images, seed } => {
                assert_eq!(seed, 42);
                assert!(images[0].image.is_some());
            }
            other => panic!("Expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn decodes_worker_error() {
        let body = ResponseBody::decode(json!({"error": "CUDA out of memory"}));
        assert_eq!(
            body,
            ResponseBody::Error {
                message: "CUDA out of memory".to_string(),
                crashed: false
            }
        );
    }

    #[test]
    fn unknown_state_is_rejected() {
        let body = ResponseBody::decode(json!({"state": "paused"}));
        assert_matches!(body, ResponseBody::Rejected(ProtocolViolation(reason)) if reason.contains("paused"));
    }

    #[test]
    fn unknown_image_state_is_rejected() {
        let body = ResponseBody::decode(json!({
            "state": "running",
            "imageProgress": [{"state": "exploded"}]
        }));
        assert_matches!(body, ResponseBody::Rejected(_));
    }

    #[test]
    fn empty_body_is_rejected() {
        assert_matches!(ResponseBody::decode(json!({})), ResponseBody::Rejected(_));
        assert_matches!(ResponseBody::decode(Value::Null), ResponseBody::Rejected(_));
    }

    #[test]
    fn unreadable_envelope_fails() {
        assert!(WorkerResponse::decode_line("not json").is_err());
        assert!(WorkerResponse::decode_line(r#"{"stopped": true}"#).is_err());
    }

    #[test]
    fn encoded_line_decodes_to_same_response() {
        let response = WorkerResponse {
            request_id: DreamId::new(),
            stopped: true,
            body: ResponseBody::Complete {
                images: vec![ImageProgress {
                    state: WorkerImageState::Complete,
                    seed: Some(1),
                    image: Some(vec![1, 2, 3]),
                    completed_steps: None,
                    total_steps: None,
                }],
                seed: 1,
            },
        };
        let line = response.encode_line().unwrap();
        assert_eq!(WorkerResponse::decode_line(&line).unwrap(), response);
    }
}
