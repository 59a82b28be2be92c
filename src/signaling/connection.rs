#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{
    parse_request, validate_join, AckBody, AudioAction, ClientMessage, JoinResponse, Request, ServerMessage,
    SignalingError, TransportKind, TransportResponse, VideoAction,
};
use super::session::{ClientSession, ConsumeError};
use crate::metrics::{Counter, ServerMetrics};
use crate::room::state::{Forwarding, Member, Outbound, Steering};
use crate::room::{Role, SessionManager};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use mediasoup::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client.
/// At 100 msg/s rate limit, 64 slots = 640ms of burst buffer.
const CHANNEL_CAPACITY: usize = 64;

/// Close the connection if no message arrives within this duration
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

/// Per-channel token bucket
struct RateLimiter {
    tokens_us: u64,
    last_refill: Instant,
    warned: bool,
}

impl RateLimiter {
    fn new(now: Instant) -> Self {
        Self {
            tokens_us: MAX_TOKENS_US,
            last_refill: now,
            warned: false,
        }
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        let elapsed_us = now.duration_since(self.last_refill).as_micros() as u64;
        self.last_refill = now;
        self.tokens_us = (self.tokens_us + elapsed_us * RATE_LIMIT_REFILL_RATE).min(MAX_TOKENS_US);

        if self.tokens_us >= TOKEN_US {
            self.tokens_us -= TOKEN_US;
            self.warned = false;
            true
        } else {
            false
        }
    }

    /// True only for the first rejection of a burst
    fn should_warn(&mut self) -> bool {
        !std::mem::replace(&mut self.warned, true)
    }
}

/// Where a client is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unjoined,
    Joined,
    Producing,
    Closed,
}

impl Phase {
    fn describe(self) -> &'static str {
        match self {
            Phase::Unjoined => "not in a room",
            Phase::Joined => "joined",
            Phase::Producing => "producing",
            Phase::Closed => "closed",
        }
    }
}

/// Which requests each phase accepts. `joinRoom` and `leaveRoom` are always
/// accepted; media requests need a room.
pub fn check_allowed(phase: Phase, message: &ClientMessage) -> Result<(), SignalingError> {
    match (phase, message) {
        (_, ClientMessage::JoinRoom { .. } | ClientMessage::LeaveRoom) => Ok(()),
        (Phase::Joined | Phase::Producing, _) => Ok(()),
        (Phase::Unjoined, m) => Err(SignalingError::NotJoined(m.name())),
        (Phase::Closed, m) => Err(SignalingError::OutOfOrder {
            request: m.name(),
            phase: phase.describe(),
        }),
    }
}

enum ClientState {
    Unjoined,
    Joined(ClientSession),
    Closed,
}

impl ClientState {
    fn phase(&self) -> Phase {
        match self {
            ClientState::Unjoined => Phase::Unjoined,
            ClientState::Joined(session) if session.is_producing() => Phase::Producing,
            ClientState::Joined(_) => Phase::Joined,
            ClientState::Closed => Phase::Closed,
        }
    }
}

/// Serialize a ServerMessage and send it through the channel as pre-serialized JSON.
fn send_json(sender: &Outbound, msg: &ServerMessage) -> anyhow::Result<()> {
    let json = Arc::new(serde_json::to_string(msg)?);
    sender.try_send(json).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    sessions: SessionManager,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let channel_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", channel_id);

    metrics.inc(Counter::Connections);
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let channel_id_clone = channel_id.clone();
    let send_metrics = metrics.clone();

    // Spawn task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc(Counter::MessagesSent);
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for channel: {}", channel_id_clone);
    });

    // Forwarding changes from the room, applied to this client's consumers
    let (steering, mut steering_rx) = mpsc::unbounded_channel::<Forwarding>();
    let mut connection = Connection::new(channel_id.clone(), tx.clone(), steering, sessions, metrics.clone());
    let mut limiter = RateLimiter::new(Instant::now());

    let idle = tokio::time::sleep(IDLE_TIMEOUT);
    tokio::pin!(idle);

    loop {
        let msg = tokio::select! {
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(message)) => message,
                Some(Err(_)) | None => break, // Stream error or closed
            },
            Some(change) = steering_rx.recv() => {
                connection.apply_forwarding(change).await;
                continue;
            }
            () = &mut idle => {
                warn!("Idle timeout for channel {}", channel_id);
                break;
            }
        };
        idle.as_mut().reset(tokio::time::Instant::now() + IDLE_TIMEOUT);

        match msg {
            Message::Text(text) => {
                metrics.inc(Counter::MessagesReceived);

                if !limiter.try_acquire(Instant::now()) {
                    if limiter.should_warn() {
                        warn!("Rate limit exceeded for channel {}", channel_id);
                        let _ = send_json(
                            &tx,
                            &ServerMessage::protocol_error(None, &SignalingError::RateLimited(RATE_LIMIT_REFILL_RATE)),
                        );
                    }
                    continue;
                }

                let start = Instant::now();
                let reply = match parse_request(&text) {
                    Ok(request) => connection.dispatch(request).await,
                    Err(rejected) => {
                        warn!("Invalid message from {}: {}", channel_id, rejected.error);
                        metrics.inc(Counter::Errors);
                        Some(ServerMessage::protocol_error(rejected.request_id, &rejected.error))
                    }
                };
                metrics.observe_message_handling(start.elapsed());

                if let Some(reply) = reply {
                    if let Err(e) = send_json(&tx, &reply) {
                        error!("Failed to send reply to {}: {}", channel_id, e);
                        // Send task has exited
                        if tx.is_closed() {
                            break;
                        }
                    }
                }
            }
            Message::Close(_) => {
                info!("Client {} closed connection", channel_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            _ => {
                warn!("Unexpected message type from client {}", channel_id);
            }
        }
    }

    // Channel loss releases everything the client held, like leaveRoom
    connection.leave(ClientState::Closed).await;

    drop(connection);
    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished for channel: {}", channel_id);
}

struct Connection {
    channel_id: String,
    tx: Outbound,
    steering: Steering,
    sessions: SessionManager,
    metrics: ServerMetrics,
    state: ClientState,
}

impl Connection {
    fn new(channel_id: String, tx: Outbound, steering: Steering, sessions: SessionManager, metrics: ServerMetrics) -> Self {
        Self {
            channel_id,
            tx,
            steering,
            sessions,
            metrics,
            state: ClientState::Unjoined,
        }
    }

    async fn apply_forwarding(&mut self, change: Forwarding) {
        if let ClientState::Joined(session) = &mut self.state {
            session.apply_forwarding(&change).await;
        }
    }

    /// Runs one request; returns the ack to send, if the request takes one
    async fn dispatch(&mut self, request: Request) -> Option<ServerMessage> {
        let Request { request_id, message } = request;
        let phase = self.state.phase();

        if let Err(e) = check_allowed(phase, &message) {
            warn!("Rejected {} from {}: {}", message.name(), self.channel_id, e);
            self.metrics.inc(Counter::Errors);
            return Some(ServerMessage::protocol_error(request_id, &e));
        }

        let expects_ack = message.expects_ack();
        let body = match self.handle(message).await {
            Ok(body) => body,
            Err(e) => {
                self.metrics.inc(Counter::Errors);
                AckBody::ProtocolError { message: e.to_string() }
            }
        };
        if let AckBody::Error { message } | AckBody::ConsumeFailed { message } = &body {
            error!("Request from {} failed: {}", self.channel_id, message);
            self.metrics.inc(Counter::Errors);
        }

        expects_ack.then(|| ServerMessage::ack(request_id, body))
    }

    fn session(&mut self, request: &'static str) -> Result<&mut ClientSession, SignalingError> {
        match &mut self.state {
            ClientState::Joined(session) => Ok(session),
            _ => Err(SignalingError::NotJoined(request)),
        }
    }

    async fn handle(&mut self, message: ClientMessage) -> Result<AckBody, SignalingError> {
        let name = message.name();
        match message {
            ClientMessage::JoinRoom {
                user_name,
                room_name,
                user_role,
            } => {
                validate_join(&room_name, &user_name)?;
                Ok(self.join(user_name, room_name, user_role).await)
            }

            ClientMessage::RequestTransport {
                transport_type,
                audio_pid,
            } => {
                let config = self.sessions.config().webrtc_transport_config.clone();
                let session = self.session(name)?;

                let peer = match (transport_type, audio_pid.as_deref()) {
                    (TransportKind::Producer, _) => None,
                    (TransportKind::Consumer, None) => {
                        return Err(SignalingError::Malformed(
                            "requestTransport for a consumer needs audioPid".to_string(),
                        ))
                    }
                    (TransportKind::Consumer, Some(pid)) => match session.room().peer_by_audio_pid(pid).await {
                        Ok(Some(peer)) => Some(peer),
                        Ok(None) => {
                            return Ok(AckBody::Error {
                                message: format!("No participant owns producer {pid}"),
                            })
                        }
                        Err(e) => return Ok(AckBody::Error { message: e.to_string() }),
                    },
                };

                let video_pid = peer.as_ref().and_then(|p| p.video_pid.clone());
                match session
                    .request_transport(transport_type, audio_pid, video_pid, &config)
                    .await
                {
                    Ok(transport) => Ok(AckBody::Transport(TransportResponse {
                        transport,
                        producer_channel_id: peer.as_ref().map(|p| p.channel_id.clone()),
                        producer_role: peer.as_ref().map(|p| p.role),
                    })),
                    Err(e) => Ok(AckBody::Error { message: e.to_string() }),
                }
            }

            ClientMessage::ConnectTransport {
                dtls_parameters,
                transport_type,
                audio_pid,
            } => {
                let session = self.session(name)?;
                match session
                    .connect_transport(transport_type, audio_pid.as_deref(), dtls_parameters)
                    .await
                {
                    Ok(()) => Ok(AckBody::Success),
                    Err(e) => Ok(AckBody::Error { message: e.to_string() }),
                }
            }

            ClientMessage::StartProducing { kind, rtp_parameters } => {
                let session = self.session(name)?;
                let producer = match session.produce(kind, rtp_parameters).await {
                    Ok(producer) => producer,
                    Err(e) => return Ok(AckBody::Error { message: e.to_string() }),
                };
                let producer_id = producer.id().to_string();
                if let Err(e) = session
                    .room()
                    .producer_added(session.channel_id(), kind, &producer_id)
                    .await
                {
                    warn!("Room did not record producer {}: {}", producer_id, e);
                }
                self.metrics.inc(Counter::Producers);
                Ok(AckBody::Produced { id: producer_id })
            }

            ClientMessage::AudioChange { action } => {
                let session = self.session(name)?;
                let paused = action == AudioAction::Mute;
                if let Err(e) = session.set_producer_paused(MediaKind::Audio, paused).await {
                    debug!("audioChange ignored for {}: {}", session.channel_id(), e);
                }
                Ok(AckBody::Success)
            }

            ClientMessage::VideoChange { action } => {
                let session = self.session(name)?;
                let paused = action == VideoAction::Pause;
                if let Err(e) = session.set_producer_paused(MediaKind::Video, paused).await {
                    debug!("videoChange ignored for {}: {}", session.channel_id(), e);
                }
                Ok(AckBody::Success)
            }

            ClientMessage::ConsumeMedia {
                rtp_capabilities,
                pid,
                kind,
            } => {
                let session = self.session(name)?;
                match session.consume(rtp_capabilities, &pid, kind).await {
                    Ok(consumer) => {
                        self.metrics.inc(Counter::Consumers);
                        Ok(AckBody::Consumer(consumer))
                    }
                    Err(ConsumeError::CannotConsume(pid)) => {
                        debug!("Cannot consume {} for {}", pid, self.channel_id);
                        self.metrics.inc(Counter::CannotConsume);
                        Ok(AckBody::CannotConsume)
                    }
                    Err(ConsumeError::Failed(e)) => Ok(AckBody::ConsumeFailed { message: e.to_string() }),
                }
            }

            ClientMessage::UnpauseConsumer { pid, kind } => {
                let session = self.session(name)?;
                match session.unpause_consumer(&pid, kind).await {
                    Ok(()) => Ok(AckBody::Success),
                    Err(e) => Ok(AckBody::Error { message: e.to_string() }),
                }
            }

            ClientMessage::LeaveRoom => {
                self.leave(ClientState::Closed).await;
                Ok(AckBody::Success)
            }
        }
    }

    async fn join(&mut self, user_name: String, room_name: String, role: Role) -> AckBody {
        // Switching rooms releases everything held in the old one
        self.leave(ClientState::Unjoined).await;

        let member = Member::new(self.channel_id.clone(), user_name.clone(), role, self.tx.clone())
            .with_steering(self.steering.clone());
        match self.sessions.join_room(&room_name, member).await {
            Ok((room, new_room, fan_out)) => {
                info!(
                    "{} ({}) joined room {} as {}{}",
                    user_name,
                    self.channel_id,
                    room_name,
                    role,
                    if new_room { " (new room)" } else { "" }
                );
                let response = JoinResponse {
                    router_rtp_capabilities: room.rtp_capabilities().clone(),
                    new_room,
                    fan_out,
                };
                self.state = ClientState::Joined(ClientSession::new(self.channel_id.clone(), user_name, role, room));
                self.metrics.inc(Counter::Joins);
                AckBody::Joined(response)
            }
            Err(e) => {
                error!("Failed to join room {} for {}: {}", room_name, self.channel_id, e);
                AckBody::Error { message: e.to_string() }
            }
        }
    }

    /// Unregisters from the room and releases the client's media, then moves to `next`
    async fn leave(&mut self, next: ClientState) {
        let previous = std::mem::replace(&mut self.state, next);
        let ClientState::Joined(session) = previous else {
            return;
        };

        match session.room().leave(session.channel_id()).await {
            Ok(true) => self.metrics.inc(Counter::Leaves),
            Ok(false) => debug!("{} was not a member of {}", session.channel_id(), session.room().name()),
            Err(e) => debug!("Room {} already closed: {}", session.room().name(), e),
        }
        session.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaConfig, WorkerPool};
    use std::num::{NonZeroU32, NonZeroU8};

    fn leave() -> ClientMessage {
        ClientMessage::LeaveRoom
    }

    fn unpause() -> ClientMessage {
        ClientMessage::UnpauseConsumer {
            pid: "p".into(),
            kind: MediaKind::Audio,
        }
    }

    fn join() -> ClientMessage {
        ClientMessage::JoinRoom {
            user_name: "ada".into(),
            room_name: "r".into(),
            user_role: Role::Candidate,
        }
    }

    #[test]
    fn media_requests_need_a_room() {
        assert_eq!(
            check_allowed(Phase::Unjoined, &unpause()),
            Err(SignalingError::NotJoined("unpauseConsumer"))
        );
        assert!(check_allowed(Phase::Joined, &unpause()).is_ok());
        assert!(check_allowed(Phase::Producing, &unpause()).is_ok());
    }

    #[test]
    fn closed_sessions_only_accept_join_and_leave() {
        assert!(matches!(
            check_allowed(Phase::Closed, &unpause()),
            Err(SignalingError::OutOfOrder { request: "unpauseConsumer", phase: "closed" })
        ));
        assert!(check_allowed(Phase::Closed, &join()).is_ok());
        assert!(check_allowed(Phase::Closed, &leave()).is_ok());
    }

    #[test]
    fn join_and_leave_always_allowed() {
        for phase in [Phase::Unjoined, Phase::Joined, Phase::Producing, Phase::Closed] {
            assert!(check_allowed(phase, &join()).is_ok());
            assert!(check_allowed(phase, &leave()).is_ok());
        }
    }

    async fn engine_sessions(eviction: bool) -> SessionManager {
        let mut config = MediaConfig::default();
        config.worker_config.num_workers = 1;
        config.webrtc_transport_config.listen_ip = "127.0.0.1".parse().unwrap();
        let pool = Arc::new(WorkerPool::new(&config).await.unwrap());
        SessionManager::new(pool, config, ServerMetrics::new(), eviction)
    }

    fn client(channel_id: &str, sessions: &SessionManager) -> (Connection, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (steering, _) = mpsc::unbounded_channel();
        let connection = Connection::new(channel_id.into(), tx, steering, sessions.clone(), ServerMetrics::new());
        (connection, rx)
    }

    fn request(id: u64, message: ClientMessage) -> Request {
        Request {
            request_id: Some(id),
            message,
        }
    }

    async fn ack(connection: &mut Connection, id: u64, message: ClientMessage) -> serde_json::Value {
        let reply = connection.dispatch(request(id, message)).await.unwrap();
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["type"], "ack");
        assert_eq!(value["requestId"], id);
        value
    }

    /// Reads pushed messages until one of type `kind` arrives
    async fn pushed(rx: &mut mpsc::Receiver<Arc<String>>, kind: &str) -> serde_json::Value {
        loop {
            let json = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("no push in time")
                .expect("channel closed");
            let value: serde_json::Value = serde_json::from_str(&json).unwrap();
            if value["type"] == kind {
                return value;
            }
        }
    }

    fn join_as(user: &str) -> ClientMessage {
        ClientMessage::JoinRoom {
            user_name: user.into(),
            room_name: "interview".into(),
            user_role: Role::Candidate,
        }
    }

    fn opus_parameters() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters::Audio {
                mime_type: MimeTypeAudio::Opus,
                payload_type: 111,
                clock_rate: NonZeroU32::new(48000).unwrap(),
                channels: NonZeroU8::new(2).unwrap(),
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: vec![],
            }],
            header_extensions: vec![],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(11_111_111),
                ..Default::default()
            }],
            rtcp: RtcpParameters {
                cname: Some("audio".to_string()),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn dispatch_runs_a_join_produce_leave_cycle() {
        let sessions = engine_sessions(false).await;
        let (mut alice, _alice_rx) = client("chan-a", &sessions);
        let (mut bob, mut bob_rx) = client("chan-b", &sessions);

        // Media requests before joining are answered, not executed
        let refused = ack(&mut alice, 1, unpause()).await;
        assert_eq!(refused["status"], "protocolError");
        assert_eq!(alice.state.phase(), Phase::Unjoined);

        let joined = ack(&mut alice, 2, join_as("alice")).await;
        assert_eq!(joined["status"], "joined");
        assert_eq!(joined["newRoom"], true);
        assert!(joined["routerRtpCapabilities"]["codecs"].is_array());
        assert_eq!(alice.state.phase(), Phase::Joined);

        let joined = ack(&mut bob, 1, join_as("bob")).await;
        assert_eq!(joined["newRoom"], false);
        assert_eq!(joined["audioPidsToCreate"], serde_json::json!([]));

        let transport = ack(
            &mut alice,
            3,
            ClientMessage::RequestTransport {
                transport_type: TransportKind::Producer,
                audio_pid: None,
            },
        )
        .await;
        assert_eq!(transport["status"], "transport");
        assert!(transport["id"].is_string());

        let produced = ack(
            &mut alice,
            4,
            ClientMessage::StartProducing {
                kind: MediaKind::Audio,
                rtp_parameters: opus_parameters(),
            },
        )
        .await;
        assert_eq!(produced["status"], "produced");
        let pid = produced["id"].as_str().unwrap().to_string();
        assert_eq!(alice.state.phase(), Phase::Producing);

        let announced = pushed(&mut bob_rx, "newProducersToConsume").await;
        assert_eq!(announced["audioPidsToCreate"], serde_json::json!([pid]));
        assert_eq!(announced["associatedUserNames"], serde_json::json!(["alice"]));

        let downstream = ack(
            &mut bob,
            2,
            ClientMessage::RequestTransport {
                transport_type: TransportKind::Consumer,
                audio_pid: Some(pid.clone()),
            },
        )
        .await;
        assert_eq!(downstream["status"], "transport");
        assert_eq!(downstream["producerChannelId"], "chan-a");

        // Mute changes take no ack
        assert!(alice
            .dispatch(request(
                5,
                ClientMessage::AudioChange {
                    action: AudioAction::Mute
                }
            ))
            .await
            .is_none());

        let left = ack(&mut alice, 6, ClientMessage::LeaveRoom).await;
        assert_eq!(left["status"], "success");
        assert_eq!(alice.state.phase(), Phase::Closed);

        let gone = pushed(&mut bob_rx, "userLeft").await;
        assert_eq!(gone["channelId"], "chan-a");
        let speakers = pushed(&mut bob_rx, "updateActiveSpeakers").await;
        assert_eq!(speakers["activeSpeakerList"], serde_json::json!([]));

        let refused = ack(&mut alice, 7, unpause()).await;
        assert_eq!(refused["status"], "protocolError");

        // A closed client may join again
        let rejoined = ack(&mut alice, 8, join_as("alice")).await;
        assert_eq!(rejoined["status"], "joined");
        assert_eq!(sessions.participant_count(), 2);
    }

    #[tokio::test]
    async fn channel_loss_releases_the_room_like_leave() {
        let sessions = engine_sessions(true).await;
        let (mut alice, _rx) = client("chan-a", &sessions);
        ack(&mut alice, 1, join_as("alice")).await;
        assert_eq!(sessions.room_count(), 1);

        // What the socket loop does when the stream ends
        alice.leave(ClientState::Closed).await;
        assert_eq!(alice.state.phase(), Phase::Closed);
        for _ in 0..50 {
            if sessions.room_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sessions.room_count(), 0);
        assert_eq!(sessions.participant_count(), 0);
    }

    #[tokio::test]
    async fn joining_with_a_bad_room_name_is_a_protocol_error() {
        let sessions = engine_sessions(false).await;
        let (mut alice, _rx) = client("chan-a", &sessions);
        let reply = ack(
            &mut alice,
            1,
            ClientMessage::JoinRoom {
                user_name: "alice".into(),
                room_name: String::new(),
                user_role: Role::Candidate,
            },
        )
        .await;
        assert_eq!(reply["status"], "protocolError");
        assert_eq!(alice.state.phase(), Phase::Unjoined);
        assert_eq!(sessions.room_count(), 0);
    }

    #[test]
    fn rate_limiter_allows_a_burst_then_refills() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(start);
        for _ in 0..RATE_LIMIT_MAX_TOKENS {
            assert!(limiter.try_acquire(start));
        }
        assert!(!limiter.try_acquire(start));
        assert!(limiter.should_warn());
        assert!(!limiter.should_warn());

        // 100 tokens/s -> one token every 10ms
        assert!(limiter.try_acquire(start + Duration::from_millis(10)));
        assert!(!limiter.try_acquire(start + Duration::from_millis(10)));
    }
}
