use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use crate::metrics::{
    SFU_ACTIVE_SESSIONS, SFU_ACTIVE_TRACKS, SFU_CONVERGENCE_RESTARTS_TOTAL,
    SFU_KEYFRAMES_REQUESTED_TOTAL,
};
use crate::peer::PeerSession;
use crate::signal::{IdPayload, RosterPayload};

/// Reconciliation passes attempted before the engine releases the lock
/// and defers. A restart storm usually means an add/remove is waiting on
/// the lock, so backing off lets it land.
const MAX_SIGNAL_ATTEMPTS: u32 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserState {
    Listening,
    Speaking,
    Muted,
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub state: UserState,
}

/// Server-owned source that every other session subscribes to. Keyed in
/// the registry by the id the ingesting transport chose.
pub struct FanOutTrack {
    pub owner: Uuid,
    pub ssrc: u32,
    pub local: Arc<TrackLocalStaticRTP>,
}

#[derive(Debug)]
pub enum RoomError {
    /// Admission requires a non-empty display name.
    NameRequired,
    /// The welcome frame could not be delivered.
    ChannelClosed,
}

impl std::fmt::Display for RoomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoomError::NameRequired => write!(f, "display name is required"),
            RoomError::ChannelClosed => write!(f, "signaling channel closed"),
        }
    }
}

impl std::error::Error for RoomError {}

/// Everything the lock protects. The session list, users table, speaker
/// set, user-track map and track registry form one consistency domain;
/// any update touching them must leave the set of invariants intact
/// before the lock drops.
struct RoomInner {
    /// Peer sessions in insertion order.
    sessions: Vec<Arc<PeerSession>>,
    users: HashMap<Uuid, User>,
    speakers: HashSet<Uuid>,
    /// user_id -> track_id for users with a live fan-out track.
    user_tracks: HashMap<Uuid, String>,
    /// track_id -> fan-out track.
    tracks: HashMap<String, FanOutTrack>,
}

/// The conference room. One per process.
pub struct Room {
    state: RwLock<RoomInner>,
    /// Handle to ourselves for work deferred onto fresh tasks.
    weak_self: Weak<Room>,
}

enum PassOutcome {
    Complete,
    Restart,
}

impl Room {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            state: RwLock::new(RoomInner {
                sessions: Vec::new(),
                users: HashMap::new(),
                speakers: HashSet::new(),
                user_tracks: HashMap::new(),
                tracks: HashMap::new(),
            }),
            weak_self: weak_self.clone(),
        })
    }

    /// Registers a new user in LISTENING and delivers its welcome frame.
    /// The session is pushed into the session list only once the `id`
    /// frame is on the wire: until then no broadcast or convergence pass
    /// can reach it, so `id` is always the first thing a client sees.
    pub async fn add_user(&self, name: &str, session: Arc<PeerSession>) -> Result<(), RoomError> {
        if name.trim().is_empty() {
            return Err(RoomError::NameRequired);
        }

        let mut inner = self.state.write().await;
        let user = User {
            id: session.user_id,
            name: name.to_string(),
            state: UserState::Listening,
        };
        info!(user_id = %user.id, name = %user.name, "User admitted");
        inner.users.insert(user.id, user);

        let welcome = match serde_json::to_string(&IdPayload {
            id: session.user_id,
            users: roster(&inner),
        }) {
            Ok(welcome) => welcome,
            Err(e) => {
                warn!(user_id = %session.user_id, error = %e, "Failed to encode welcome");
                inner.users.remove(&session.user_id);
                return Err(RoomError::ChannelClosed);
            }
        };
        if session.signal.write("id", welcome).await.is_err() {
            inner.users.remove(&session.user_id);
            return Err(RoomError::ChannelClosed);
        }

        inner.sessions.push(session);
        SFU_ACTIVE_SESSIONS.inc();
        Ok(())
    }

    /// Removes the user and everything it owns: speaker entry, fan-out
    /// track, peer session. Broadcasts the new roster and converges.
    pub async fn remove_user(&self, user_id: Uuid) {
        let removed_session = {
            let mut guard = self.state.write().await;
            let inner = &mut *guard;

            let had_user = inner.users.remove(&user_id).is_some();
            inner.speakers.remove(&user_id);
            if let Some(track_id) = inner.user_tracks.remove(&user_id) {
                if inner.tracks.remove(&track_id).is_some() {
                    SFU_ACTIVE_TRACKS.dec();
                }
            }
            let removed_session = inner
                .sessions
                .iter()
                .position(|s| s.user_id == user_id)
                .map(|idx| {
                    SFU_ACTIVE_SESSIONS.dec();
                    inner.sessions.remove(idx)
                });

            if !had_user && removed_session.is_none() {
                return;
            }
            info!(user_id = %user_id, "User removed");
            broadcast_roster(inner).await;
            removed_session
        };

        if let Some(session) = removed_session {
            if let Err(e) = session.pc.close().await {
                warn!(user_id = %user_id, error = %e, "Error closing peer connection");
            }
        }
        self.converge().await;
    }

    /// Applies a validated state transition. Any transition out of
    /// SPEAKING drops the user's fan-out track. The updated roster is
    /// pushed to every session before the lock is released.
    pub async fn set_state(&self, user_id: Uuid, new_state: UserState) {
        let track_removed = {
            let mut guard = self.state.write().await;
            let inner = &mut *guard;

            let old_state = match inner.users.get_mut(&user_id) {
                Some(user) => {
                    let old = user.state;
                    user.state = new_state;
                    old
                }
                None => {
                    warn!(user_id = %user_id, "State change for unknown user");
                    return;
                }
            };
            if old_state == new_state {
                return;
            }

            if new_state == UserState::Speaking {
                inner.speakers.insert(user_id);
            } else {
                inner.speakers.remove(&user_id);
            }

            let mut track_removed = false;
            if old_state == UserState::Speaking {
                if let Some(track_id) = inner.user_tracks.remove(&user_id) {
                    if inner.tracks.remove(&track_id).is_some() {
                        SFU_ACTIVE_TRACKS.dec();
                        track_removed = true;
                    }
                }
            }

            info!(user_id = %user_id, from = ?old_state, to = ?new_state, "User state changed");
            broadcast_roster(inner).await;
            track_removed
        };

        if track_removed {
            self.converge().await;
        }
    }

    /// LISTENING and MUTED become SPEAKING; SPEAKING becomes LISTENING.
    pub async fn toggle_speaking(&self, user_id: Uuid) {
        let Some(current) = self.user_state(user_id).await else {
            warn!(user_id = %user_id, "Speaking toggle from unknown user");
            return;
        };
        let next = match current {
            UserState::Listening | UserState::Muted => UserState::Speaking,
            UserState::Speaking => UserState::Listening,
        };
        self.set_state(user_id, next).await;
    }

    /// Only meaningful while SPEAKING or MUTED; anything else is ignored.
    pub async fn toggle_mute(&self, user_id: Uuid) {
        let Some(current) = self.user_state(user_id).await else {
            warn!(user_id = %user_id, "Mute toggle from unknown user");
            return;
        };
        match current {
            UserState::Speaking => self.set_state(user_id, UserState::Muted).await,
            UserState::Muted => self.set_state(user_id, UserState::Speaking).await,
            UserState::Listening => {
                info!(user_id = %user_id, "Ignoring mute toggle from non-speaker");
            }
        }
    }

    /// Pushes the full user list to every session.
    pub async fn broadcast_roster(&self) {
        let inner = self.state.read().await;
        broadcast_roster(&inner).await;
    }

    /// Registers a fan-out track for a speaking user. Returns false if
    /// the user lost SPEAKING before the lock was taken. The short sleep
    /// while still holding the lock is a batching window: simultaneous
    /// ingests coalesce into one convergence pass.
    pub async fn publish_track(
        &self,
        owner: Uuid,
        track_id: String,
        ssrc: u32,
        local: Arc<TrackLocalStaticRTP>,
    ) -> bool {
        {
            let mut guard = self.state.write().await;
            let inner = &mut *guard;

            if !inner.speakers.contains(&owner) {
                debug!(user_id = %owner, track_id = %track_id, "Refusing track from non-speaking user");
                return false;
            }

            if let Some(previous) = inner.user_tracks.insert(owner, track_id.clone()) {
                if previous != track_id && inner.tracks.remove(&previous).is_some() {
                    SFU_ACTIVE_TRACKS.dec();
                }
            }
            if inner
                .tracks
                .insert(track_id.clone(), FanOutTrack { owner, ssrc, local })
                .is_none()
            {
                SFU_ACTIVE_TRACKS.inc();
            }
            info!(user_id = %owner, track_id = %track_id, "Registered fan-out track");

            let jitter = Duration::from_millis(rand::thread_rng().gen_range(100..=300));
            tokio::time::sleep(jitter).await;
        }
        self.converge().await;
        true
    }

    /// Drops a fan-out track, but only while it still belongs to `owner`
    /// (a colliding id may have been claimed by a later publisher).
    pub async fn retract_track(&self, owner: Uuid, track_id: &str) {
        let removed = {
            let mut guard = self.state.write().await;
            let inner = &mut *guard;

            if inner.user_tracks.get(&owner).map(String::as_str) == Some(track_id) {
                inner.user_tracks.remove(&owner);
            }
            match inner.tracks.get(track_id) {
                Some(fan_out) if fan_out.owner == owner => {
                    inner.tracks.remove(track_id);
                    SFU_ACTIVE_TRACKS.dec();
                    true
                }
                _ => false,
            }
        };

        if removed {
            info!(user_id = %owner, track_id = %track_id, "Removed fan-out track");
            self.converge().await;
        }
    }

    pub async fn is_speaking(&self, user_id: Uuid) -> bool {
        self.state.read().await.speakers.contains(&user_id)
    }

    pub async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    async fn user_state(&self, user_id: Uuid) -> Option<UserState> {
        self.state.read().await.users.get(&user_id).map(|u| u.state)
    }

    /// Reconciles every peer session's outbound senders with the track
    /// registry and pushes a fresh offer to each. Holds the room lock
    /// for the whole pass; a mutation observed mid-iteration restarts
    /// it. After 25 restarts the lock is released and a retry fires at a
    /// random 1-3s delay.
    pub async fn converge(&self) {
        let mut guard = self.state.write().await;
        let mut attempts: u32 = 0;
        loop {
            if attempts >= MAX_SIGNAL_ATTEMPTS {
                drop(guard);
                warn!("Convergence did not settle, deferring retry");
                if let Some(room) = self.weak_self.upgrade() {
                    schedule_retry(room);
                }
                return;
            }
            match self.signal_pass(&mut guard).await {
                PassOutcome::Complete => break,
                PassOutcome::Restart => {
                    SFU_CONVERGENCE_RESTARTS_TOTAL.inc();
                    attempts += 1;
                }
            }
        }

        // Fresh downstreams should not wait out the encoder's keyframe
        // cadence.
        dispatch_keyframes(&guard).await;
    }

    /// One reconciliation attempt over all sessions in insertion order.
    async fn signal_pass(&self, inner: &mut RoomInner) -> PassOutcome {
        let mut idx = 0;
        while idx < inner.sessions.len() {
            let session = Arc::clone(&inner.sessions[idx]);

            if session.pc.connection_state() == RTCPeerConnectionState::Closed {
                inner.sessions.remove(idx);
                SFU_ACTIVE_SESSIONS.dec();
                debug!(user_id = %session.user_id, "Reaped closed session");
                return PassOutcome::Restart;
            }

            // Track ids this transport already carries. The user's own
            // ingest track counts as present so it is never offered back.
            let mut existing: HashSet<String> = HashSet::new();
            if let Some(own) = inner.user_tracks.get(&session.user_id) {
                existing.insert(own.clone());
            }
            for sender in session.pc.get_senders().await {
                let Some(track) = sender.track().await else {
                    continue;
                };
                let track_id = track.id().to_string();
                // Id equality is not enough: a colliding publish replaces
                // the registry entry, and a sender still attached to the
                // superseded fan-out must be swapped onto the winner.
                let live = inner.tracks.get(&track_id).map_or(false, |fan_out| {
                    Arc::as_ptr(&track) as *const () == Arc::as_ptr(&fan_out.local) as *const ()
                });
                if live {
                    existing.insert(track_id);
                } else if let Err(e) = session.pc.remove_track(&sender).await {
                    warn!(user_id = %session.user_id, track_id = %track_id, error = %e, "Failed to remove stale sender");
                    return PassOutcome::Restart;
                }
            }

            for (track_id, fan_out) in &inner.tracks {
                if existing.contains(track_id) {
                    continue;
                }
                let local = Arc::clone(&fan_out.local) as Arc<dyn TrackLocal + Send + Sync>;
                if let Err(e) = session.pc.add_track(local).await {
                    warn!(user_id = %session.user_id, track_id = %track_id, error = %e, "Failed to add fan-out track");
                    return PassOutcome::Restart;
                }
                debug!(user_id = %session.user_id, track_id = %track_id, "Subscribed session to track");
            }

            let offer = match session.pc.create_offer(None).await {
                Ok(offer) => offer,
                Err(e) => {
                    warn!(user_id = %session.user_id, error = %e, "Failed to create offer");
                    return PassOutcome::Restart;
                }
            };
            if let Err(e) = session.pc.set_local_description(offer.clone()).await {
                warn!(user_id = %session.user_id, error = %e, "Failed to set local description");
                return PassOutcome::Restart;
            }
            let data = match serde_json::to_string(&offer) {
                Ok(data) => data,
                Err(e) => {
                    warn!(user_id = %session.user_id, error = %e, "Failed to encode offer");
                    return PassOutcome::Restart;
                }
            };
            if session.signal.write("offer", data).await.is_err() {
                warn!(user_id = %session.user_id, "Failed to push offer, channel closed");
                return PassOutcome::Restart;
            }

            idx += 1;
        }
        PassOutcome::Complete
    }

    /// Keyframe solicitation entry for the global ticker.
    pub async fn solicit_keyframes(&self) {
        let inner = self.state.read().await;
        dispatch_keyframes(&inner).await;
    }

    /// Closes every live transport and clears all room state.
    pub async fn shutdown(&self) {
        let sessions = {
            let mut guard = self.state.write().await;
            let inner = &mut *guard;
            inner.users.clear();
            inner.speakers.clear();
            inner.user_tracks.clear();
            inner.tracks.clear();
            SFU_ACTIVE_TRACKS.set(0);
            let sessions: Vec<_> = inner.sessions.drain(..).collect();
            SFU_ACTIVE_SESSIONS.set(0);
            sessions
        };

        info!(count = sessions.len(), "Closing active peer connections");
        for session in sessions {
            if let Err(e) = session.pc.close().await {
                warn!(user_id = %session.user_id, error = %e, "Error closing peer connection");
            }
        }
    }
}

fn roster(inner: &RoomInner) -> Vec<User> {
    inner.users.values().cloned().collect()
}

async fn broadcast_roster(inner: &RoomInner) {
    let payload = match serde_json::to_string(&RosterPayload {
        users: roster(inner),
    }) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "Failed to encode roster");
            return;
        }
    };
    for session in &inner.sessions {
        if let Err(e) = session.signal.write("user_states_updated", payload.clone()).await {
            warn!(user_id = %session.user_id, error = %e, "Failed to push roster");
        }
    }
}

/// Solicits a keyframe from every live source, on the source's own
/// ingress transport. Failures are swallowed.
async fn dispatch_keyframes(inner: &RoomInner) {
    for (track_id, fan_out) in &inner.tracks {
        let Some(session) = inner.sessions.iter().find(|s| s.user_id == fan_out.owner) else {
            continue;
        };
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc: fan_out.ssrc,
        };
        if let Err(e) = session.pc.write_rtcp(&[Box::new(pli)]).await {
            debug!(track_id = %track_id, error = %e, "Keyframe request failed");
        } else {
            SFU_KEYFRAMES_REQUESTED_TOTAL.inc();
        }
    }
}

/// Deadlock escape: re-run convergence on a fresh task after a
/// randomized delay, with the lock released in between.
fn schedule_retry(room: Arc<Room>) {
    tokio::spawn(async move {
        let delay = Duration::from_millis(rand::thread_rng().gen_range(1_000..=3_000));
        tokio::time::sleep(delay).await;
        room.converge().await;
    });
}

#[cfg(test)]
pub(crate) struct RoomSnapshot {
    pub users: HashMap<Uuid, UserState>,
    pub speakers: HashSet<Uuid>,
    pub user_tracks: HashMap<Uuid, String>,
    /// track_id -> owner
    pub tracks: HashMap<String, Uuid>,
    pub session_users: Vec<Uuid>,
}

#[cfg(test)]
impl Room {
    pub(crate) async fn snapshot(&self) -> RoomSnapshot {
        let inner = self.state.read().await;
        RoomSnapshot {
            users: inner.users.iter().map(|(id, u)| (*id, u.state)).collect(),
            speakers: inner.speakers.clone(),
            user_tracks: inner.user_tracks.clone(),
            tracks: inner.tracks.iter().map(|(id, t)| (id.clone(), t.owner)).collect(),
            session_users: inner.sessions.iter().map(|s| s.user_id).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_state_wire_names() {
        assert_eq!(serde_json::to_string(&UserState::Listening).unwrap(), "\"listening\"");
        assert_eq!(serde_json::to_string(&UserState::Speaking).unwrap(), "\"speaking\"");
        assert_eq!(serde_json::to_string(&UserState::Muted).unwrap(), "\"muted\"");
    }

    #[test]
    fn test_user_wire_shape() {
        let user = User {
            id: Uuid::nil(),
            name: "alice".to_string(),
            state: UserState::Listening,
        };
        let value: serde_json::Value = serde_json::to_value(&user).unwrap();
        assert_eq!(value["name"], "alice");
        assert_eq!(value["state"], "listening");
        assert_eq!(value["id"], "00000000-0000-0000-0000-000000000000");
    }
}
