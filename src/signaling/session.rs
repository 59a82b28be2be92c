#![forbid(unsafe_code)]

// Per-client media state: one upstream transport, producers by kind,
// one downstream transport per remote producer pair

use crate::media::retry::with_backoff;
use crate::media::{ConsumerInfo, MediaError, MediaResult, TransportInfo, WebRtcTransportConfig};
use crate::room::state::Forwarding;
use crate::room::{RoomHandle, Role};
use crate::signaling::protocol::TransportKind;
use mediasoup::prelude::*;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a consume request produced no consumer
#[derive(Error, Debug)]
pub enum ConsumeError {
    #[error("Router cannot consume producer {0} with the given capabilities")]
    CannotConsume(String),

    #[error(transparent)]
    Failed(#[from] MediaError),
}

/// Receive transport bound to one remote audio producer (and its video pair)
pub struct DownstreamTransport {
    pub transport: WebRtcTransport,
    pub audio_pid: String,
    pub video_pid: Option<String>,
    audio: Option<Consumer>,
    video: Option<Consumer>,
}

impl DownstreamTransport {
    fn new(transport: WebRtcTransport, audio_pid: String, video_pid: Option<String>) -> Self {
        Self {
            transport,
            audio_pid,
            video_pid,
            audio: None,
            video: None,
        }
    }

    fn serves(&self, kind: MediaKind, pid: &str) -> bool {
        match kind {
            MediaKind::Audio => self.audio_pid == pid,
            MediaKind::Video => self.video_pid.as_deref() == Some(pid),
        }
    }

    pub fn consumer(&self, kind: MediaKind) -> Option<&Consumer> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
    }

    fn set_consumer(&mut self, kind: MediaKind, consumer: Consumer) -> Option<Consumer> {
        match kind {
            MediaKind::Audio => self.audio.replace(consumer),
            MediaKind::Video => self.video.replace(consumer),
        }
    }

    fn consumer_count(&self) -> usize {
        usize::from(self.audio.is_some()) + usize::from(self.video.is_some())
    }

    /// Pauses or resumes both consumers of this pair
    async fn set_forwarding(&self, forward: bool) -> MediaResult<()> {
        for consumer in [&self.audio, &self.video].into_iter().flatten() {
            let result = if forward {
                consumer.resume().await
            } else {
                consumer.pause().await
            };
            result.map_err(|e| MediaError::Consumer(format!("Failed to update consumer {}: {e}", consumer.id())))?;
        }
        Ok(())
    }
}

/// A joined client. Everything it owns is released by [`ClientSession::close`].
pub struct ClientSession {
    channel_id: String,
    user_name: String,
    role: Role,
    room: RoomHandle,
    upstream: Option<WebRtcTransport>,
    audio_producer: Option<Producer>,
    video_producer: Option<Producer>,
    downstream: Vec<DownstreamTransport>,
    /// Remote audio pids the room stopped forwarding to this client
    withdrawn: HashSet<String>,
}

impl ClientSession {
    pub fn new(channel_id: String, user_name: String, role: Role, room: RoomHandle) -> Self {
        Self {
            channel_id,
            user_name,
            role,
            room,
            upstream: None,
            audio_producer: None,
            video_producer: None,
            downstream: Vec::new(),
            withdrawn: HashSet::new(),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn room(&self) -> &RoomHandle {
        &self.room
    }

    pub fn is_producing(&self) -> bool {
        self.audio_producer.is_some() || self.video_producer.is_some()
    }

    pub fn producer(&self, kind: MediaKind) -> Option<&Producer> {
        match kind {
            MediaKind::Audio => self.audio_producer.as_ref(),
            MediaKind::Video => self.video_producer.as_ref(),
        }
    }

    pub fn downstream(&self) -> &[DownstreamTransport] {
        &self.downstream
    }

    /// Creates a WebRTC transport on the room router
    pub async fn create_transport(&self, config: &WebRtcTransportConfig) -> MediaResult<WebRtcTransport> {
        let options = config.to_transport_options()?;
        let router = self.room.router();
        let transport = with_backoff("transport creation", || {
            router.create_webrtc_transport(options.clone())
        })
        .await
        .map_err(|e| MediaError::Transport(format!("Failed to create transport: {e}")))?;

        if let Some(bitrate) = config.max_incoming_bitrate {
            if let Err(e) = transport.set_max_incoming_bitrate(bitrate).await {
                warn!("Failed to set max incoming bitrate on transport {}: {}", transport.id(), e);
            }
        }

        self.setup_transport_handlers(&transport);
        Ok(transport)
    }

    /// Creates and binds a transport, returning what the client needs to
    /// connect it. A downstream transport must name the remote audio producer.
    pub async fn request_transport(
        &mut self,
        kind: TransportKind,
        audio_pid: Option<String>,
        video_pid: Option<String>,
        config: &WebRtcTransportConfig,
    ) -> MediaResult<TransportInfo> {
        if kind == TransportKind::Consumer && audio_pid.is_none() {
            return Err(MediaError::InvalidState(
                "A consumer transport needs the remote audio producer id".to_string(),
            ));
        }
        let transport = self.create_transport(config).await?;
        let info = TransportInfo::from(&transport);
        for closed in self.add_transport(kind, transport, audio_pid, video_pid)? {
            if let Err(e) = self.room.producer_removed(&self.channel_id, closed).await {
                warn!("Room did not drop {:?} producer of {}: {}", closed, self.channel_id, e);
            }
        }
        Ok(info)
    }

    /// Binds a transport. A second upstream transport, or a second record for
    /// the same remote audio producer, replaces and releases the old one.
    ///
    /// Returns the kinds of the producers that closed with a replaced
    /// upstream transport.
    pub fn add_transport(
        &mut self,
        kind: TransportKind,
        transport: WebRtcTransport,
        audio_pid: Option<String>,
        video_pid: Option<String>,
    ) -> MediaResult<Vec<MediaKind>> {
        let mut released = Vec::new();
        match kind {
            TransportKind::Producer => {
                info!("Created upstream transport {} for {}", transport.id(), self.channel_id);
                if let Some(old) = self.upstream.replace(transport) {
                    for (kind, producer) in [
                        (MediaKind::Audio, self.audio_producer.take()),
                        (MediaKind::Video, self.video_producer.take()),
                    ] {
                        if let Some(producer) = producer {
                            debug!("{:?} producer {} closes with its transport", kind, producer.id());
                            released.push(kind);
                        }
                    }
                    debug!("Released previous upstream transport {} for {}", old.id(), self.channel_id);
                }
            }
            TransportKind::Consumer => {
                let audio_pid = audio_pid.ok_or_else(|| {
                    MediaError::InvalidState("A consumer transport needs the remote audio producer id".to_string())
                })?;
                info!(
                    "Created downstream transport {} for {} (peer audio {})",
                    transport.id(),
                    self.channel_id,
                    audio_pid
                );
                if let Some(pos) = self.downstream.iter().position(|r| r.audio_pid == audio_pid) {
                    let old = self.downstream.remove(pos);
                    debug!(
                        "Released previous downstream transport {} for peer audio {}",
                        old.transport.id(),
                        audio_pid
                    );
                }
                self.downstream
                    .push(DownstreamTransport::new(transport, audio_pid, video_pid));
            }
        }
        Ok(released)
    }

    pub async fn connect_transport(
        &self,
        kind: TransportKind,
        audio_pid: Option<&str>,
        dtls_parameters: DtlsParameters,
    ) -> MediaResult<()> {
        let transport = match kind {
            TransportKind::Producer => self
                .upstream
                .as_ref()
                .ok_or_else(|| MediaError::NotFound("Upstream transport".to_string()))?,
            TransportKind::Consumer => {
                let pid = audio_pid.ok_or_else(|| {
                    MediaError::InvalidState("Connecting a consumer transport needs audioPid".to_string())
                })?;
                &self
                    .downstream
                    .iter()
                    .find(|r| r.audio_pid == pid)
                    .ok_or_else(|| MediaError::NotFound(format!("Downstream transport for {pid}")))?
                    .transport
            }
        };

        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| MediaError::Transport(format!("Failed to connect transport: {e}")))?;

        info!("Connected transport {} for {}", transport.id(), self.channel_id);
        Ok(())
    }

    /// Produces on the upstream transport and binds the producer under its kind
    pub async fn produce(&mut self, kind: MediaKind, rtp_parameters: RtpParameters) -> MediaResult<Producer> {
        let transport = self
            .upstream
            .as_ref()
            .ok_or_else(|| MediaError::NotFound("Upstream transport".to_string()))?;

        let producer = transport
            .produce(ProducerOptions::new(kind, rtp_parameters))
            .await
            .map_err(|e| MediaError::Producer(format!("Failed to create producer: {e}")))?;

        info!("Created {:?} producer {} for {}", kind, producer.id(), self.channel_id);
        self.add_producer(kind, producer.clone()).await;
        Ok(producer)
    }

    /// Binds a producer under `kind`, releasing any previous one. Audio
    /// producers are handed to the room's active-speaker observer.
    pub async fn add_producer(&mut self, kind: MediaKind, producer: Producer) {
        let channel_id = self.channel_id.clone();
        let producer_id = producer.id();
        producer
            .on_close(move || {
                debug!("Producer {} closed for {}", producer_id, channel_id);
            })
            .detach();

        if kind == MediaKind::Audio {
            if let Err(e) = self.room.observe_audio(producer.id()).await {
                warn!("Active speaker observer rejected {}: {}", producer.id(), e);
            }
        }

        let previous = match kind {
            MediaKind::Audio => self.audio_producer.replace(producer),
            MediaKind::Video => self.video_producer.replace(producer),
        };
        if let Some(old) = previous {
            debug!("Released previous {:?} producer {} for {}", kind, old.id(), self.channel_id);
        }
    }

    /// Creates a paused consumer for a remote producer on the transport
    /// bound to that producer.
    ///
    /// # Errors
    /// `CannotConsume` when the router rejects the capabilities; no consumer
    /// is created in that case.
    pub async fn consume(
        &mut self,
        rtp_capabilities: RtpCapabilities,
        pid: &str,
        kind: MediaKind,
    ) -> Result<ConsumerInfo, ConsumeError> {
        let producer_id: ProducerId = pid
            .parse()
            .map_err(|_| ConsumeError::CannotConsume(pid.to_string()))?;
        if !self.room.router().can_consume(&producer_id, &rtp_capabilities) {
            return Err(ConsumeError::CannotConsume(pid.to_string()));
        }

        let idx = self
            .downstream
            .iter()
            .position(|r| r.serves(kind, pid))
            .ok_or_else(|| MediaError::NotFound(format!("Downstream transport for {kind:?} producer {pid}")))?;

        let mut options = ConsumerOptions::new(producer_id, rtp_capabilities);
        options.paused = true;
        let record = &mut self.downstream[idx];
        let consumer = record
            .transport
            .consume(options)
            .await
            .map_err(|e| MediaError::Consumer(format!("Failed to create consumer: {e}")))?;

        let info = ConsumerInfo::from(&consumer);
        self.add_consumer(idx, kind, consumer);
        Ok(info)
    }

    /// Binds a consumer into the downstream record at `idx`
    pub fn add_consumer(&mut self, idx: usize, kind: MediaKind, consumer: Consumer) {
        let Some(record) = self.downstream.get_mut(idx) else {
            warn!("No downstream record {} for consumer {}", idx, consumer.id());
            return;
        };
        info!(
            "Created {:?} consumer {} for producer {} on {}",
            kind,
            consumer.id(),
            consumer.producer_id(),
            self.channel_id
        );
        if let Some(old) = record.set_consumer(kind, consumer) {
            debug!("Released previous consumer {}", old.id());
        }
    }

    /// Starts forwarding a consumer, unless the room has withdrawn its pair
    pub async fn unpause_consumer(&self, pid: &str, kind: MediaKind) -> MediaResult<()> {
        let record = self
            .downstream
            .iter()
            .find(|r| r.serves(kind, pid))
            .ok_or_else(|| MediaError::NotFound(format!("Downstream transport for {kind:?} producer {pid}")))?;
        let consumer = record
            .consumer(kind)
            .ok_or_else(|| MediaError::NotFound(format!("{kind:?} consumer for {pid}")))?;

        if self.withdrawn.contains(&record.audio_pid) {
            debug!("Consumer {} stays paused, {} is not forwarded", consumer.id(), record.audio_pid);
            return Ok(());
        }

        consumer
            .resume()
            .await
            .map_err(|e| MediaError::Consumer(format!("Failed to resume consumer: {e}")))?;
        debug!("Resumed consumer {} for {}", consumer.id(), self.channel_id);
        Ok(())
    }

    /// Applies a forwarding change from the room: consumers of paused pairs
    /// stop, consumers of resumed pairs start again.
    pub async fn apply_forwarding(&mut self, change: &Forwarding) {
        for (pids, forward) in [(&change.pause, false), (&change.resume, true)] {
            for pid in pids {
                if forward {
                    self.withdrawn.remove(pid);
                } else {
                    self.withdrawn.insert(pid.clone());
                }
                let Some(record) = self.downstream.iter().find(|r| &r.audio_pid == pid) else {
                    continue;
                };
                match record.set_forwarding(forward).await {
                    Ok(()) => debug!(
                        "{} pair {} for {}",
                        if forward { "Resumed" } else { "Paused" },
                        pid,
                        self.channel_id
                    ),
                    Err(e) => warn!("Forwarding change for {} on {} failed: {}", pid, self.channel_id, e),
                }
            }
        }
    }

    /// True if the room currently forwards the pair keyed by `audio_pid`
    pub fn is_forwarded(&self, audio_pid: &str) -> bool {
        !self.withdrawn.contains(audio_pid)
    }

    /// Pauses or resumes the local producer of `kind`
    pub async fn set_producer_paused(&self, kind: MediaKind, paused: bool) -> MediaResult<()> {
        let producer = self
            .producer(kind)
            .ok_or_else(|| MediaError::NotFound(format!("{kind:?} producer")))?;
        let result = if paused {
            producer.pause().await
        } else {
            producer.resume().await
        };
        result.map_err(|e| MediaError::Producer(format!("Failed to update producer {}: {e}", producer.id())))
    }

    /// Releases every consumer, downstream transport, producer and the
    /// upstream transport.
    pub fn close(mut self) {
        let consumers: usize = self.downstream.iter().map(DownstreamTransport::consumer_count).sum();
        let transports = self.downstream.len() + usize::from(self.upstream.is_some());
        let producers = usize::from(self.audio_producer.is_some()) + usize::from(self.video_producer.is_some());

        // Consumers and producers close when dropped, before their transports
        for record in self.downstream.iter_mut() {
            record.audio.take();
            record.video.take();
        }
        self.audio_producer.take();
        self.video_producer.take();
        self.downstream.clear();
        self.upstream.take();

        info!(
            "Closed session for {} ({}, {}) in room {} ({} consumers, {} producers, {} transports)",
            self.channel_id,
            self.user_name,
            self.role,
            self.room.name(),
            consumers,
            producers,
            transports
        );
    }

    fn setup_transport_handlers(&self, transport: &WebRtcTransport) {
        let transport_id = transport.id();

        transport
            .on_dtls_state_change({
                let channel_id = self.channel_id.clone();
                move |dtls_state| {
                    info!("DTLS state: {:?} for transport {} ({})", dtls_state, transport_id, channel_id);
                }
            })
            .detach();

        transport
            .on_ice_state_change({
                let channel_id = self.channel_id.clone();
                move |ice_state| {
                    debug!("ICE state: {:?} for transport {} ({})", ice_state, transport_id, channel_id);
                }
            })
            .detach();
    }
}
