#![forbid(unsafe_code)]

// Media-layer errors and the transport/consumer parameter blocks sent to clients

use mediasoup::prelude::*;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("worker unavailable: {0}")]
    Worker(String),

    #[error("router failure: {0}")]
    Router(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("produce failed: {0}")]
    Producer(String),

    #[error("consume failed: {0}")]
    Consumer(String),

    /// The room task has stopped; the caller may retry against a fresh room
    #[error("room {0} is closed")]
    RoomClosed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("bad configuration: {0}")]
    Config(String),
}

pub type MediaResult<T> = Result<T, MediaError>;

/// What a client needs to finish its side of a WebRTC transport
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

impl From<&WebRtcTransport> for TransportInfo {
    fn from(transport: &WebRtcTransport) -> Self {
        Self {
            id: transport.id().to_string(),
            ice_parameters: transport.ice_parameters().clone(),
            ice_candidates: transport.ice_candidates().clone(),
            dtls_parameters: transport.dtls_parameters(),
        }
    }
}

/// A freshly created (paused) consumer as the client sees it
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

impl From<&Consumer> for ConsumerInfo {
    fn from(consumer: &Consumer) -> Self {
        Self {
            id: consumer.id().to_string(),
            producer_id: consumer.producer_id().to_string(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters().clone(),
        }
    }
}
