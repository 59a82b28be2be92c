#![forbid(unsafe_code)]

// Room module - one router per room, membership and speaker list owned by a room task

pub mod registry;
pub mod roles;
pub mod speakers;
pub mod state;

use crate::media::retry::with_backoff;
use crate::media::{MediaConfig, MediaError, MediaResult, WorkerLease, WorkerPool};
use crate::signaling::protocol::ServerMessage;
use mediasoup::active_speaker_observer::{ActiveSpeakerObserver, ActiveSpeakerObserverOptions};
use mediasoup::prelude::*;
use mediasoup::rtp_observer::{RtpObserver, RtpObserverAddProducerOptions};
use state::{Audience, FanOut, Member, Notice, PeerInfo, RoomEvent, RoomState};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub use registry::SessionManager;
pub use roles::Role;

/// Commands queued per room; observer callbacks use the same queue
const ROOM_QUEUE_CAPACITY: usize = 256;

static NEXT_ROOM_ID: AtomicU64 = AtomicU64::new(1);

/// Run by the room task once the last member has left
pub type EvictionHook = Box<dyn FnOnce(u64) + Send>;

enum RoomCommand {
    Join {
        member: Member,
        reply: oneshot::Sender<FanOut>,
    },
    ProducerAdded {
        channel_id: String,
        kind: MediaKind,
        producer_id: String,
    },
    ProducerRemoved {
        channel_id: String,
        kind: MediaKind,
    },
    DominantSpeaker {
        producer_id: String,
    },
    Leave {
        channel_id: String,
        reply: oneshot::Sender<bool>,
    },
    PeerLookup {
        audio_pid: String,
        reply: oneshot::Sender<Option<PeerInfo>>,
    },
    Close,
}

/// Engine resources of a room. Dropping the last handle closes the router
/// and gives the worker slot back.
pub struct Room {
    id: u64,
    name: String,
    router: Router,
    observer: ActiveSpeakerObserver,
    commands: mpsc::Sender<RoomCommand>,
    participants: Arc<AtomicUsize>,
    lease: WorkerLease,
}

#[derive(Clone)]
pub struct RoomHandle {
    inner: Arc<Room>,
}

impl Room {
    /// Acquires a worker, creates the router and the active-speaker observer,
    /// and starts the room task.
    ///
    /// # Errors
    /// Returns an error if the router or observer cannot be created
    pub async fn create(
        name: &str,
        pool: &WorkerPool,
        config: &MediaConfig,
        on_empty: Option<EvictionHook>,
    ) -> MediaResult<RoomHandle> {
        let lease = pool.acquire_worker()?;
        let router = with_backoff("router creation", || {
            lease.worker().create_router(config.router_config.to_router_options())
        })
        .await
        .map_err(|e| MediaError::Router(format!("Failed to create router: {e}")))?;

        let mut options = ActiveSpeakerObserverOptions::default();
        options.interval = config.router_config.active_speaker_interval_ms;
        let observer = router
            .create_active_speaker_observer(options)
            .await
            .map_err(|e| MediaError::Router(format!("Failed to create active speaker observer: {e}")))?;

        let (tx, rx) = mpsc::channel(ROOM_QUEUE_CAPACITY);

        // Stale dominant-speaker events are fine to drop
        let weak_tx = tx.downgrade();
        observer
            .on_dominant_speaker(move |speaker| {
                if let Some(tx) = weak_tx.upgrade() {
                    let _ = tx.try_send(RoomCommand::DominantSpeaker {
                        producer_id: speaker.producer.id().to_string(),
                    });
                }
            })
            .detach();

        let id = NEXT_ROOM_ID.fetch_add(1, Ordering::Relaxed);
        let participants = Arc::new(AtomicUsize::new(0));
        info!(
            "Created room {} (id {}) with router {} on worker {}",
            name,
            id,
            router.id(),
            lease.worker_id()
        );

        tokio::spawn(run_room(
            id,
            RoomState::new(name),
            rx,
            router.rtp_capabilities().clone(),
            participants.clone(),
            on_empty,
        ));

        Ok(RoomHandle {
            inner: Arc::new(Room {
                id,
                name: name.to_string(),
                router,
                observer,
                commands: tx,
                participants,
                lease,
            }),
        })
    }
}

impl RoomHandle {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn rtp_capabilities(&self) -> RtpCapabilitiesFinalized {
        self.inner.router.rtp_capabilities()
    }

    pub fn worker_index(&self) -> usize {
        self.inner.lease.index()
    }

    pub fn participant_count(&self) -> usize {
        self.inner.participants.load(Ordering::Relaxed)
    }

    async fn send(&self, command: RoomCommand) -> MediaResult<()> {
        self.inner
            .commands
            .send(command)
            .await
            .map_err(|_| MediaError::RoomClosed(self.inner.name.clone()))
    }

    /// Registers a member and returns the producers it should consume now
    pub async fn join(&self, member: Member) -> MediaResult<FanOut> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Join { member, reply }).await?;
        rx.await.map_err(|_| MediaError::RoomClosed(self.inner.name.clone()))
    }

    /// Queues a producer for the active-speaker policy
    pub async fn producer_added(&self, channel_id: &str, kind: MediaKind, producer_id: &str) -> MediaResult<()> {
        self.send(RoomCommand::ProducerAdded {
            channel_id: channel_id.to_string(),
            kind,
            producer_id: producer_id.to_string(),
        })
        .await
    }

    /// Withdraws a member's closed producer from the speaker policy
    pub async fn producer_removed(&self, channel_id: &str, kind: MediaKind) -> MediaResult<()> {
        self.send(RoomCommand::ProducerRemoved {
            channel_id: channel_id.to_string(),
            kind,
        })
        .await
    }

    /// Removes a member; returns whether it was present
    pub async fn leave(&self, channel_id: &str) -> MediaResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Leave {
            channel_id: channel_id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| MediaError::RoomClosed(self.inner.name.clone()))
    }

    pub async fn peer_by_audio_pid(&self, audio_pid: &str) -> MediaResult<Option<PeerInfo>> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::PeerLookup {
            audio_pid: audio_pid.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| MediaError::RoomClosed(self.inner.name.clone()))
    }

    /// Lets the engine score an audio producer for dominant-speaker events
    pub async fn observe_audio(&self, producer_id: ProducerId) -> MediaResult<()> {
        self.inner
            .observer
            .add_producer(RtpObserverAddProducerOptions::new(producer_id))
            .await
            .map_err(|e| MediaError::Producer(format!("Failed to observe producer {producer_id}: {e}")))
    }

    /// Stops the room task; outstanding requests fail with `RoomClosed`
    pub async fn close(&self) -> MediaResult<()> {
        self.send(RoomCommand::Close).await
    }
}

async fn run_room(
    id: u64,
    mut state: RoomState,
    mut rx: mpsc::Receiver<RoomCommand>,
    capabilities: RtpCapabilitiesFinalized,
    participants: Arc<AtomicUsize>,
    mut on_empty: Option<EvictionHook>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            RoomCommand::Join { member, reply } => {
                let fan_out = state.join(member);
                participants.store(state.len(), Ordering::Relaxed);
                let _ = reply.send(fan_out);
            }
            RoomCommand::ProducerAdded {
                channel_id,
                kind,
                producer_id,
            } => {
                let notices = state.producer_added(&channel_id, kind, &producer_id);
                dispatch(&state, notices, &capabilities);
            }
            RoomCommand::ProducerRemoved { channel_id, kind } => {
                let notices = state.producer_removed(&channel_id, kind);
                dispatch(&state, notices, &capabilities);
            }
            RoomCommand::DominantSpeaker { producer_id } => {
                let notices = state.dominant_speaker(&producer_id);
                dispatch(&state, notices, &capabilities);
            }
            RoomCommand::Leave { channel_id, reply } => {
                let left = match state.leave(&channel_id) {
                    Some((member, notices)) => {
                        info!("{} left room {}", member.user_name, state.name());
                        dispatch(&state, notices, &capabilities);
                        true
                    }
                    None => false,
                };
                participants.store(state.len(), Ordering::Relaxed);
                let _ = reply.send(left);

                if state.is_empty() {
                    if let Some(hook) = on_empty.take() {
                        hook(id);
                        break;
                    }
                }
            }
            RoomCommand::PeerLookup { audio_pid, reply } => {
                let _ = reply.send(state.peer_by_audio_pid(&audio_pid));
            }
            RoomCommand::Close => break,
        }
    }
    debug!("Room task for {} (id {}) exited", state.name(), id);
}

/// Renders each notice once and hands it to its audience. Forwarding
/// changes go to the member's connection instead of its socket.
fn dispatch(state: &RoomState, notices: Vec<Notice>, capabilities: &RtpCapabilitiesFinalized) {
    for notice in notices {
        let message = match notice.event {
            RoomEvent::Forwarding(change) => {
                match &notice.audience {
                    Audience::Member(channel_id) => state.steer(channel_id, change),
                    Audience::All => warn!("Forwarding change without a member in room {}", state.name()),
                }
                continue;
            }
            RoomEvent::NewProducers {
                fan_out,
                active_speaker_list,
            } => ServerMessage::NewProducersToConsume {
                router_rtp_capabilities: capabilities.clone(),
                fan_out,
                active_speaker_list,
            },
            RoomEvent::ActiveSpeakers { active_speaker_list } => {
                ServerMessage::UpdateActiveSpeakers { active_speaker_list }
            }
            RoomEvent::UserLeft {
                user_name,
                channel_id,
                user_role,
            } => ServerMessage::UserLeft {
                user_name,
                channel_id,
                user_role,
            },
        };
        match serde_json::to_string(&message) {
            Ok(json) => state.deliver(&notice.audience, Arc::new(json)),
            Err(e) => warn!("Failed to serialize room notice: {}", e),
        }
    }
}
