#![forbid(unsafe_code)]

// Signaling protocol - Message types for WebSocket communication

use crate::media::{ConsumerInfo, TransportInfo};
use crate::room::roles::Role;
use crate::room::state::FanOut;
use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_ROOM_NAME_LEN: usize = 128;
pub const MAX_USER_NAME_LEN: usize = 64;

/// Protocol-level failures, answered with `protocolError`
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignalingError {
    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("{0} requires joining a room first")]
    NotJoined(&'static str),

    #[error("{request} is not allowed while {phase}")]
    OutOfOrder {
        request: &'static str,
        phase: &'static str,
    },

    #[error("Invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("Rate limit exceeded: max {0} messages/second")]
    RateLimited(u64),
}

/// Which side of the media path a transport serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Producer,
    Consumer,
}

/// Anything other than "mute" unmutes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioAction {
    Mute,
    #[serde(other)]
    Unmute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoAction {
    Pause,
    Resume,
}

/// Client-to-Server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Join (or switch to) a room
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        user_name: String,
        room_name: String,
        #[serde(default)]
        user_role: Role,
    },
    /// Create the upstream transport, or a downstream one for a remote audio producer
    #[serde(rename_all = "camelCase")]
    RequestTransport {
        transport_type: TransportKind,
        #[serde(default)]
        audio_pid: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        dtls_parameters: DtlsParameters,
        transport_type: TransportKind,
        #[serde(default)]
        audio_pid: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    StartProducing {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    AudioChange {
        action: AudioAction,
    },
    VideoChange {
        action: VideoAction,
    },
    #[serde(rename_all = "camelCase")]
    ConsumeMedia {
        rtp_capabilities: RtpCapabilities,
        pid: String,
        kind: MediaKind,
    },
    UnpauseConsumer {
        pid: String,
        kind: MediaKind,
    },
    LeaveRoom,
}

impl ClientMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "joinRoom",
            ClientMessage::RequestTransport { .. } => "requestTransport",
            ClientMessage::ConnectTransport { .. } => "connectTransport",
            ClientMessage::StartProducing { .. } => "startProducing",
            ClientMessage::AudioChange { .. } => "audioChange",
            ClientMessage::VideoChange { .. } => "videoChange",
            ClientMessage::ConsumeMedia { .. } => "consumeMedia",
            ClientMessage::UnpauseConsumer { .. } => "unpauseConsumer",
            ClientMessage::LeaveRoom => "leaveRoom",
        }
    }

    /// Best-effort notifications get no ack
    pub fn expects_ack(&self) -> bool {
        !matches!(self, ClientMessage::AudioChange { .. } | ClientMessage::VideoChange { .. })
    }
}

/// A decoded client message and the id its ack must carry
#[derive(Debug, Clone)]
pub struct Request {
    pub request_id: Option<u64>,
    pub message: ClientMessage,
}

/// A frame that could not be decoded; the id is kept when it was readable
#[derive(Debug, Clone, PartialEq)]
pub struct Rejected {
    pub request_id: Option<u64>,
    pub error: SignalingError,
}

/// Decodes one text frame. The `requestId` is read before the message body
/// so that a malformed body can still be acked.
pub fn parse_request(text: &str) -> Result<Request, Rejected> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|e| Rejected {
        request_id: None,
        error: SignalingError::Malformed(e.to_string()),
    })?;
    let request_id = value.get("requestId").and_then(serde_json::Value::as_u64);
    let message = serde_json::from_value(value).map_err(|e| Rejected {
        request_id,
        error: SignalingError::Malformed(e.to_string()),
    })?;
    Ok(Request { request_id, message })
}

pub fn validate_join(room_name: &str, user_name: &str) -> Result<(), SignalingError> {
    let room_len = room_name.chars().count();
    if room_len == 0 || room_len > MAX_ROOM_NAME_LEN {
        return Err(SignalingError::Validation {
            field: "roomName",
            reason: format!("must be 1-{MAX_ROOM_NAME_LEN} characters"),
        });
    }
    let user_len = user_name.chars().count();
    if user_len == 0 || user_len > MAX_USER_NAME_LEN {
        return Err(SignalingError::Validation {
            field: "userName",
            reason: format!("must be 1-{MAX_USER_NAME_LEN} characters"),
        });
    }
    Ok(())
}

/// Reply to `joinRoom`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub router_rtp_capabilities: RtpCapabilitiesFinalized,
    pub new_room: bool,
    #[serde(flatten)]
    pub fan_out: FanOut,
}

/// Reply to `requestTransport`; downstream transports also name the peer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportResponse {
    #[serde(flatten)]
    pub transport: TransportInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub producer_channel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub producer_role: Option<Role>,
}

/// Outcome carried by an ack
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum AckBody {
    Joined(JoinResponse),
    Transport(TransportResponse),
    Produced { id: String },
    Consumer(ConsumerInfo),
    Success,
    Error { message: String },
    /// Router cannot serve the producer to these capabilities
    CannotConsume,
    ConsumeFailed { message: String },
    ProtocolError { message: String },
}

/// Server-to-Client messages
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// The single reply to a request
    #[serde(rename_all = "camelCase")]
    Ack {
        request_id: Option<u64>,
        #[serde(flatten)]
        body: AckBody,
    },
    #[serde(rename_all = "camelCase")]
    NewProducersToConsume {
        router_rtp_capabilities: RtpCapabilitiesFinalized,
        #[serde(flatten)]
        fan_out: FanOut,
        active_speaker_list: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    UpdateActiveSpeakers { active_speaker_list: Vec<String> },
    #[serde(rename_all = "camelCase")]
    UserLeft {
        user_name: String,
        channel_id: String,
        user_role: Role,
    },
    /// Sent when a bad frame carried no usable requestId
    ProtocolError { message: String },
}

impl ServerMessage {
    pub fn ack(request_id: Option<u64>, body: AckBody) -> Self {
        ServerMessage::Ack { request_id, body }
    }

    pub fn protocol_error(request_id: Option<u64>, error: &SignalingError) -> Self {
        let message = error.to_string();
        match request_id {
            Some(_) => ServerMessage::Ack {
                request_id,
                body: AckBody::ProtocolError { message },
            },
            None => ServerMessage::ProtocolError { message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_defaults_role_to_candidate() {
        let req = parse_request(r#"{"type":"joinRoom","requestId":1,"userName":"ada","roomName":"r1"}"#).unwrap();
        assert_eq!(req.request_id, Some(1));
        match req.message {
            ClientMessage::JoinRoom { user_name, room_name, user_role } => {
                assert_eq!(user_name, "ada");
                assert_eq!(room_name, "r1");
                assert_eq!(user_role, Role::Candidate);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn unknown_role_is_rejected_with_request_id() {
        let err = parse_request(r#"{"type":"joinRoom","requestId":9,"userName":"a","roomName":"r","userRole":"admin"}"#)
            .unwrap_err();
        assert_eq!(err.request_id, Some(9));
        assert!(matches!(err.error, SignalingError::Malformed(_)));
    }

    #[test]
    fn invalid_json_has_no_request_id() {
        let err = parse_request("{not json").unwrap_err();
        assert_eq!(err.request_id, None);
    }

    #[test]
    fn unknown_type_is_malformed() {
        let err = parse_request(r#"{"type":"restartIce","requestId":4}"#).unwrap_err();
        assert_eq!(err.request_id, Some(4));
    }

    #[test]
    fn leave_room_accepts_request_id() {
        let req = parse_request(r#"{"type":"leaveRoom","requestId":2}"#).unwrap();
        assert!(matches!(req.message, ClientMessage::LeaveRoom));
        assert!(req.message.expects_ack());
    }

    #[test]
    fn audio_change_other_means_unmute() {
        let req = parse_request(r#"{"type":"audioChange","action":"whatever"}"#).unwrap();
        assert!(matches!(req.message, ClientMessage::AudioChange { action: AudioAction::Unmute }));
        assert!(!req.message.expects_ack());

        let req = parse_request(r#"{"type":"audioChange","action":"mute"}"#).unwrap();
        assert!(matches!(req.message, ClientMessage::AudioChange { action: AudioAction::Mute }));
    }

    #[test]
    fn request_transport_for_a_peer() {
        let req = parse_request(r#"{"type":"requestTransport","requestId":3,"transportType":"consumer","audioPid":"p1"}"#)
            .unwrap();
        match req.message {
            ClientMessage::RequestTransport { transport_type, audio_pid } => {
                assert_eq!(transport_type, TransportKind::Consumer);
                assert_eq!(audio_pid.as_deref(), Some("p1"));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn validation_limits() {
        assert!(validate_join("room", "user").is_ok());
        assert!(validate_join("", "user").is_err());
        assert!(validate_join("room", "").is_err());
        assert!(validate_join(&"r".repeat(MAX_ROOM_NAME_LEN + 1), "user").is_err());
        assert!(validate_join("room", &"u".repeat(MAX_USER_NAME_LEN + 1)).is_err());
        assert!(validate_join(&"r".repeat(MAX_ROOM_NAME_LEN), &"u".repeat(MAX_USER_NAME_LEN)).is_ok());
    }

    #[test]
    fn acks_carry_request_id_and_status() {
        let value = serde_json::to_value(ServerMessage::ack(Some(5), AckBody::Success)).unwrap();
        assert_eq!(value, json!({"type": "ack", "requestId": 5, "status": "success"}));

        let value = serde_json::to_value(ServerMessage::ack(Some(6), AckBody::CannotConsume)).unwrap();
        assert_eq!(value["status"], "cannotConsume");

        let value = serde_json::to_value(ServerMessage::ack(
            Some(7),
            AckBody::Produced { id: "p".into() },
        ))
        .unwrap();
        assert_eq!(value, json!({"type": "ack", "requestId": 7, "status": "produced", "id": "p"}));
    }

    #[test]
    fn protocol_error_is_an_ack_only_with_a_request_id() {
        let err = SignalingError::NotJoined("startProducing");
        let value = serde_json::to_value(ServerMessage::protocol_error(Some(1), &err)).unwrap();
        assert_eq!(value["type"], "ack");
        assert_eq!(value["status"], "protocolError");

        let value = serde_json::to_value(ServerMessage::protocol_error(None, &err)).unwrap();
        assert_eq!(value["type"], "protocolError");
        assert!(value["message"].as_str().unwrap().contains("startProducing"));
    }

    #[test]
    fn user_left_shape() {
        let value = serde_json::to_value(ServerMessage::UserLeft {
            user_name: "ada".into(),
            channel_id: "c1".into(),
            user_role: Role::Interviewer,
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"type": "userLeft", "userName": "ada", "channelId": "c1", "userRole": "interviewer"})
        );
    }

    #[test]
    fn active_speaker_update_shape() {
        let value = serde_json::to_value(ServerMessage::UpdateActiveSpeakers {
            active_speaker_list: vec!["a".into(), "b".into()],
        })
        .unwrap();
        assert_eq!(value, json!({"type": "updateActiveSpeakers", "activeSpeakerList": ["a", "b"]}));
    }
}
