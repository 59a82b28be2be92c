#![forbid(unsafe_code)]

// Room state - membership and active-speaker bookkeeping for one room.
// Never touches the engine or the network; every mutation returns the notices
// it produced and the room task delivers them.

use crate::room::roles::Role;
use crate::room::speakers::ActiveSpeakerList;
use mediasoup::prelude::MediaKind;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outbound queue of one signaling channel
pub type Outbound = mpsc::Sender<Arc<String>>;

/// Forwarding changes for one member's downstream consumers, by remote audio pid
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Forwarding {
    pub pause: Vec<String>,
    pub resume: Vec<String>,
}

impl Forwarding {
    pub fn is_empty(&self) -> bool {
        self.pause.is_empty() && self.resume.is_empty()
    }
}

/// Carries `Forwarding` changes to the connection that owns the consumers
pub type Steering = mpsc::UnboundedSender<Forwarding>;

#[derive(Clone)]
pub struct Member {
    pub channel_id: String,
    pub user_name: String,
    pub role: Role,
    pub sender: Outbound,
    pub audio_pid: Option<String>,
    pub video_pid: Option<String>,
    steering: Option<Steering>,
    /// Remote audio pid -> video pid it was announced with
    known: HashMap<String, Option<String>>,
    /// Known pids that fell out of this member's targets
    withdrawn: HashSet<String>,
}

impl Member {
    pub fn new(channel_id: String, user_name: String, role: Role, sender: Outbound) -> Self {
        Self {
            channel_id,
            user_name,
            role,
            sender,
            audio_pid: None,
            video_pid: None,
            steering: None,
            known: HashMap::new(),
            withdrawn: HashSet::new(),
        }
    }

    /// Routes forwarding changes for this member to `steering`
    pub fn with_steering(mut self, steering: Steering) -> Self {
        self.steering = Some(steering);
        self
    }

    pub fn knows(&self, audio_pid: &str) -> bool {
        self.known.contains_key(audio_pid)
    }

    /// True if the pid was announced and is currently forwarded
    pub fn forwards(&self, audio_pid: &str) -> bool {
        self.knows(audio_pid) && !self.withdrawn.contains(audio_pid)
    }
}

/// Remote producer pairs a client should start consuming, in parallel arrays
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FanOut {
    pub audio_pids_to_create: Vec<String>,
    pub video_pids_to_create: Vec<Option<String>>,
    pub associated_user_names: Vec<String>,
    pub associated_user_roles: Vec<Role>,
}

impl FanOut {
    pub fn is_empty(&self) -> bool {
        self.audio_pids_to_create.is_empty()
    }

    fn push(&mut self, audio_pid: String, owner: &Member) {
        self.audio_pids_to_create.push(audio_pid);
        self.video_pids_to_create.push(owner.video_pid.clone());
        self.associated_user_names.push(owner.user_name.clone());
        self.associated_user_roles.push(owner.role);
    }
}

/// Owner of an audio producer, as seen by a client opening a receive transport
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub channel_id: String,
    pub user_name: String,
    pub role: Role,
    pub video_pid: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Audience {
    Member(String),
    All,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    NewProducers {
        fan_out: FanOut,
        active_speaker_list: Vec<String>,
    },
    ActiveSpeakers {
        active_speaker_list: Vec<String>,
    },
    UserLeft {
        user_name: String,
        channel_id: String,
        user_role: Role,
    },
    /// Pause or resume consumers the member already holds
    Forwarding(Forwarding),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub audience: Audience,
    pub event: RoomEvent,
}

pub struct RoomState {
    name: String,
    members: Vec<Member>,
    speakers: ActiveSpeakerList,
}

impl RoomState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
            speakers: ActiveSpeakerList::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn active_speakers(&self) -> &[String] {
        self.speakers.as_slice()
    }

    pub fn member(&self, channel_id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.channel_id == channel_id)
    }

    fn owner_of(&self, audio_pid: &str) -> Option<&Member> {
        self.members
            .iter()
            .find(|m| m.audio_pid.as_deref() == Some(audio_pid))
    }

    /// Adds a member and returns the producers it should consume right away.
    /// Everything returned is recorded as known for the new member.
    pub fn join(&mut self, mut member: Member) -> FanOut {
        if let Some(pos) = self.members.iter().position(|m| m.channel_id == member.channel_id) {
            warn!(
                "Channel {} joined room {} twice, replacing the stale entry",
                member.channel_id, self.name
            );
            self.members.remove(pos);
        }

        let mut fan_out = FanOut::default();
        for pid in self.speakers.targets_for(None) {
            if let Some(owner) = self.owner_of(&pid) {
                fan_out.push(pid.clone(), owner);
                member.known.insert(pid, owner.video_pid.clone());
            }
        }

        debug!(
            "{} joined room {} ({} producers to consume)",
            member.user_name,
            self.name,
            fan_out.audio_pids_to_create.len()
        );
        self.members.push(member);
        fan_out
    }

    /// Records a new producer for a member and recomputes fan-out
    pub fn producer_added(&mut self, channel_id: &str, kind: MediaKind, producer_id: &str) -> Vec<Notice> {
        let Some(member) = self.members.iter_mut().find(|m| m.channel_id == channel_id) else {
            debug!("Producer {} from unknown channel {} ignored", producer_id, channel_id);
            return Vec::new();
        };

        match kind {
            MediaKind::Audio => {
                let previous = member.audio_pid.replace(producer_id.to_string());
                if let Some(previous) = previous.filter(|p| p != producer_id) {
                    self.forget_producer(&previous);
                }
                self.speakers.push(producer_id);
            }
            MediaKind::Video => {
                member.video_pid = Some(producer_id.to_string());
            }
        }
        self.recompute()
    }

    /// Drops a member's producer of `kind` after it was closed on the media side
    pub fn producer_removed(&mut self, channel_id: &str, kind: MediaKind) -> Vec<Notice> {
        let Some(member) = self.members.iter_mut().find(|m| m.channel_id == channel_id) else {
            return Vec::new();
        };
        match kind {
            MediaKind::Audio => {
                let Some(pid) = member.audio_pid.take() else {
                    return Vec::new();
                };
                debug!("Audio producer {} withdrawn from room {}", pid, self.name);
                self.forget_producer(&pid);
                self.recompute()
            }
            MediaKind::Video => {
                member.video_pid = None;
                Vec::new()
            }
        }
    }

    /// Handles a dominant-speaker report from the engine observer
    pub fn dominant_speaker(&mut self, producer_id: &str) -> Vec<Notice> {
        if self.owner_of(producer_id).is_none() {
            debug!("Dominant speaker {} has no owner in room {}", producer_id, self.name);
            return Vec::new();
        }
        if !self.speakers.promote_or_insert(producer_id) {
            return Vec::new();
        }
        self.recompute()
    }

    /// Removes a member. Survivors get a departure notice and a fresh fan-out.
    pub fn leave(&mut self, channel_id: &str) -> Option<(Member, Vec<Notice>)> {
        let pos = self.members.iter().position(|m| m.channel_id == channel_id)?;
        let member = self.members.remove(pos);

        if let Some(pid) = &member.audio_pid {
            self.forget_producer(pid);
        }

        let mut notices = vec![Notice {
            audience: Audience::All,
            event: RoomEvent::UserLeft {
                user_name: member.user_name.clone(),
                channel_id: member.channel_id.clone(),
                user_role: member.role,
            },
        }];
        if !self.members.is_empty() {
            notices.extend(self.recompute());
        }
        Some((member, notices))
    }

    pub fn peer_by_audio_pid(&self, audio_pid: &str) -> Option<PeerInfo> {
        self.owner_of(audio_pid).map(|owner| PeerInfo {
            channel_id: owner.channel_id.clone(),
            user_name: owner.user_name.clone(),
            role: owner.role,
            video_pid: owner.video_pid.clone(),
        })
    }

    /// Removing a listed producer lets the first waiting one move up
    fn forget_producer(&mut self, audio_pid: &str) {
        self.speakers.remove(audio_pid);
        for m in &mut self.members {
            m.known.remove(audio_pid);
            m.withdrawn.remove(audio_pid);
        }
    }

    /// Per-member delta against what each member already knows, followed by
    /// the current list for everyone.
    ///
    /// New targets are announced. A pid announced before its owner had a video
    /// producer (or with a since-replaced one) is announced again. Known pids
    /// that left the targets are paused, and resumed when they come back.
    fn recompute(&mut self) -> Vec<Notice> {
        let list = self.speakers.as_slice().to_vec();
        let mut deltas = Vec::new();

        for idx in 0..self.members.len() {
            let member = &self.members[idx];
            let targets = self.speakers.targets_for(member.audio_pid.as_deref());
            let mut fan_out = FanOut::default();
            let mut forwarding = Forwarding::default();

            for pid in &targets {
                let Some(owner) = self.owner_of(pid) else {
                    continue;
                };
                let stale = match member.known.get(pid) {
                    None => true,
                    Some(video) => owner.video_pid.is_some() && *video != owner.video_pid,
                };
                if stale {
                    fan_out.push(pid.clone(), owner);
                }
                if member.withdrawn.contains(pid) {
                    forwarding.resume.push(pid.clone());
                }
            }
            let mut dropped: Vec<String> = member
                .known
                .keys()
                .filter(|pid| !targets.contains(pid) && !member.withdrawn.contains(*pid))
                .cloned()
                .collect();
            dropped.sort();
            forwarding.pause = dropped;

            if !fan_out.is_empty() || !forwarding.is_empty() {
                deltas.push((idx, fan_out, forwarding));
            }
        }

        let mut notices = Vec::with_capacity(deltas.len() * 2 + 1);
        for (idx, fan_out, forwarding) in deltas {
            let member = &mut self.members[idx];
            for pid in &forwarding.pause {
                member.withdrawn.insert(pid.clone());
            }
            for pid in &forwarding.resume {
                member.withdrawn.remove(pid);
            }
            if !forwarding.is_empty() {
                debug!(
                    "Forwarding for {}: pause {:?}, resume {:?}",
                    member.channel_id, forwarding.pause, forwarding.resume
                );
                notices.push(Notice {
                    audience: Audience::Member(member.channel_id.clone()),
                    event: RoomEvent::Forwarding(forwarding),
                });
            }
            if fan_out.is_empty() {
                continue;
            }
            for (pid, video) in fan_out
                .audio_pids_to_create
                .iter()
                .zip(fan_out.video_pids_to_create.iter())
            {
                member.known.insert(pid.clone(), video.clone());
            }
            notices.push(Notice {
                audience: Audience::Member(member.channel_id.clone()),
                event: RoomEvent::NewProducers {
                    fan_out,
                    active_speaker_list: list.clone(),
                },
            });
        }
        notices.push(Notice {
            audience: Audience::All,
            event: RoomEvent::ActiveSpeakers {
                active_speaker_list: list,
            },
        });
        notices
    }

    /// Hands a forwarding change to the member's connection
    pub fn steer(&self, channel_id: &str, forwarding: Forwarding) {
        let Some(member) = self.member(channel_id) else {
            return;
        };
        match &member.steering {
            Some(steering) => {
                if steering.send(forwarding).is_err() {
                    debug!("Steering closed for {} in room {}", channel_id, self.name);
                }
            }
            None => debug!("{} in room {} takes no forwarding changes", channel_id, self.name),
        }
    }

    /// Sends a rendered notice to its audience without blocking the room
    pub fn deliver(&self, audience: &Audience, payload: Arc<String>) {
        for m in &self.members {
            let wanted = match audience {
                Audience::All => true,
                Audience::Member(id) => &m.channel_id == id,
            };
            if !wanted {
                continue;
            }
            match m.sender.try_send(payload.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Channel full for {} in room {}, dropping message", m.channel_id, self.name);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Channel closed for {} in room {} (disconnected)", m.channel_id, self.name);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::speakers::FAN_OUT_LIMIT;

    fn member(id: &str, role: Role) -> (Member, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(16);
        (Member::new(id.to_string(), format!("user-{id}"), role, tx), rx)
    }

    fn join(state: &mut RoomState, id: &str) -> FanOut {
        let (m, _rx) = member(id, Role::Candidate);
        state.join(m)
    }

    fn produce_pair(state: &mut RoomState, id: &str) -> Vec<Notice> {
        let mut notices = state.producer_added(id, MediaKind::Video, &format!("v-{id}"));
        notices.extend(state.producer_added(id, MediaKind::Audio, &format!("a-{id}")));
        notices
    }

    fn new_producers_for<'a>(notices: &'a [Notice], channel: &str) -> Vec<&'a FanOut> {
        notices
            .iter()
            .filter_map(|n| match (&n.audience, &n.event) {
                (Audience::Member(id), RoomEvent::NewProducers { fan_out, .. }) if id == channel => {
                    Some(fan_out)
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn first_member_gets_empty_bootstrap() {
        let mut state = RoomState::new("r");
        assert!(join(&mut state, "a").is_empty());
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn producer_announced_to_others_but_not_owner() {
        let mut state = RoomState::new("r");
        join(&mut state, "a");
        join(&mut state, "b");

        let notices = produce_pair(&mut state, "a");
        assert!(new_producers_for(&notices, "a").is_empty());
        let to_b = new_producers_for(&notices, "b");
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_b[0].audio_pids_to_create, vec!["a-a"]);
        assert_eq!(to_b[0].video_pids_to_create, vec![Some("v-a".to_string())]);
        assert_eq!(to_b[0].associated_user_names, vec!["user-a"]);
    }

    #[test]
    fn late_joiner_bootstraps_from_list() {
        let mut state = RoomState::new("r");
        join(&mut state, "a");
        produce_pair(&mut state, "a");

        let fan_out = join(&mut state, "b");
        assert_eq!(fan_out.audio_pids_to_create, vec!["a-a"]);
        assert!(state.member("b").unwrap().knows("a-a"));
    }

    #[test]
    fn known_pids_are_not_announced_twice() {
        let mut state = RoomState::new("r");
        join(&mut state, "a");
        join(&mut state, "b");
        produce_pair(&mut state, "a");

        let notices = state.dominant_speaker("a-a");
        assert!(new_producers_for(&notices, "b").is_empty());
    }

    #[test]
    fn audio_before_video_is_reannounced_with_video() {
        let mut state = RoomState::new("r");
        join(&mut state, "a");
        join(&mut state, "b");

        let first = state.producer_added("a", MediaKind::Audio, "a-a");
        assert_eq!(new_producers_for(&first, "b")[0].video_pids_to_create, vec![None]);

        let second = state.producer_added("a", MediaKind::Video, "v-a");
        let to_b = new_producers_for(&second, "b");
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_b[0].video_pids_to_create, vec![Some("v-a".to_string())]);
    }

    #[test]
    fn sixth_producer_waits_until_promoted() {
        let mut state = RoomState::new("r");
        for i in 0..7 {
            join(&mut state, &format!("m{i}"));
        }
        for i in 0..6 {
            produce_pair(&mut state, &format!("m{i}"));
        }
        assert_eq!(state.active_speakers().len(), FAN_OUT_LIMIT);
        assert!(!state.active_speakers().contains(&"a-m5".to_string()));

        let notices = state.dominant_speaker("a-m5");
        assert_eq!(state.active_speakers()[0], "a-m5");
        assert_eq!(state.active_speakers().len(), FAN_OUT_LIMIT);
        let to_m6 = new_producers_for(&notices, "m6");
        assert_eq!(to_m6[0].audio_pids_to_create, vec!["a-m5"]);
    }

    #[test]
    fn demoted_producer_is_paused_for_members_that_hold_it() {
        let mut state = RoomState::new("r");
        for i in 0..6 {
            join(&mut state, &format!("m{i}"));
            produce_pair(&mut state, &format!("m{i}"));
        }
        join(&mut state, "late");

        let notices = state.dominant_speaker("a-m5");
        let paused: Vec<_> = notices
            .iter()
            .filter_map(|n| match (&n.audience, &n.event) {
                (Audience::Member(id), RoomEvent::Forwarding(change)) if id == "late" => Some(change),
                _ => None,
            })
            .collect();
        assert_eq!(paused.len(), 1);
        assert_eq!(paused[0].pause, vec!["a-m4".to_string()]);
        assert!(paused[0].resume.is_empty());
        assert!(!state.member("late").unwrap().forwards("a-m4"));
        assert!(state.member("late").unwrap().forwards("a-m5"));
    }

    #[test]
    fn removed_audio_producer_leaves_the_list() {
        let mut state = RoomState::new("r");
        join(&mut state, "a");
        join(&mut state, "b");
        produce_pair(&mut state, "a");
        assert!(state.member("b").unwrap().knows("a-a"));

        let notices = state.producer_removed("a", MediaKind::Audio);
        assert!(state.active_speakers().is_empty());
        assert!(!state.member("b").unwrap().knows("a-a"));
        assert!(state.peer_by_audio_pid("a-a").is_none());
        assert!(matches!(
            notices.last().map(|n| &n.event),
            Some(RoomEvent::ActiveSpeakers { active_speaker_list }) if active_speaker_list.is_empty()
        ));
        assert!(state.producer_removed("a", MediaKind::Audio).is_empty());
    }

    #[test]
    fn replaced_video_is_announced_again() {
        let mut state = RoomState::new("r");
        join(&mut state, "a");
        join(&mut state, "b");
        produce_pair(&mut state, "a");

        assert!(state.producer_removed("a", MediaKind::Video).is_empty());
        let notices = state.producer_added("a", MediaKind::Video, "v-a2");
        let to_b = new_producers_for(&notices, "b");
        assert_eq!(to_b[0].video_pids_to_create, vec![Some("v-a2".to_string())]);
    }

    #[test]
    fn steer_reaches_the_members_connection() {
        let mut state = RoomState::new("r");
        let (steering, mut changes) = mpsc::unbounded_channel();
        let (m, _rx) = member("a", Role::Candidate);
        state.join(m.with_steering(steering));

        let change = Forwarding {
            pause: vec!["p1".into()],
            resume: Vec::new(),
        };
        state.steer("a", change.clone());
        state.steer("nobody", change.clone());
        assert_eq!(changes.try_recv().unwrap(), change);
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn dominant_speaker_without_owner_is_ignored() {
        let mut state = RoomState::new("r");
        join(&mut state, "a");
        assert!(state.dominant_speaker("ghost").is_empty());
        assert!(state.active_speakers().is_empty());
    }

    #[test]
    fn leave_removes_only_the_owners_producer() {
        let mut state = RoomState::new("r");
        for id in ["a", "b", "c"] {
            join(&mut state, id);
            produce_pair(&mut state, id);
        }
        let (gone, notices) = state.leave("b").unwrap();
        assert_eq!(gone.channel_id, "b");
        assert_eq!(state.active_speakers(), &["a-a".to_string(), "a-c".to_string()]);
        assert!(matches!(
            &notices[0].event,
            RoomEvent::UserLeft { channel_id, user_role: Role::Candidate, .. } if channel_id == "b"
        ));
        assert!(state.leave("b").is_none());
    }

    #[test]
    fn departure_frees_a_slot_for_a_waiting_producer() {
        let mut state = RoomState::new("r");
        for i in 0..6 {
            join(&mut state, &format!("m{i}"));
            produce_pair(&mut state, &format!("m{i}"));
        }
        let (_, notices) = state.leave("m0").unwrap();
        assert!(state.active_speakers().contains(&"a-m5".to_string()));
        assert_eq!(new_producers_for(&notices, "m1")[0].audio_pids_to_create, vec!["a-m5"]);
    }

    #[test]
    fn peer_lookup_by_audio_pid() {
        let mut state = RoomState::new("r");
        let (m, _rx) = member("a", Role::Interviewer);
        state.join(m);
        produce_pair(&mut state, "a");

        let peer = state.peer_by_audio_pid("a-a").unwrap();
        assert_eq!(peer.channel_id, "a");
        assert_eq!(peer.role, Role::Interviewer);
        assert_eq!(peer.video_pid.as_deref(), Some("v-a"));
        assert!(state.peer_by_audio_pid("v-a").is_none());
    }

    #[test]
    fn deliver_reaches_only_the_audience() {
        let mut state = RoomState::new("r");
        let (a, mut rx_a) = member("a", Role::Candidate);
        let (b, mut rx_b) = member("b", Role::Candidate);
        state.join(a);
        state.join(b);

        state.deliver(&Audience::Member("b".into()), Arc::new("hi".into()));
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap().as_str(), "hi");

        state.deliver(&Audience::All, Arc::new("all".into()));
        assert_eq!(rx_a.try_recv().unwrap().as_str(), "all");
        assert_eq!(rx_b.try_recv().unwrap().as_str(), "all");
    }
}
