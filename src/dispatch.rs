use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::peer::PeerSession;
use crate::room::Room;
use crate::signal::WsMessage;

/// Routes one inbound client frame. An error return is fatal for the
/// session: the wire contract was violated (or the transport rejected
/// the message) and the caller closes the channel.
pub async fn dispatch(room: &Arc<Room>, session: &Arc<PeerSession>, raw: &str) -> Result<()> {
    let msg: WsMessage = serde_json::from_str(raw).context("malformed signaling envelope")?;

    match msg.event.as_str() {
        "candidate" => {
            let candidate: RTCIceCandidateInit =
                serde_json::from_str(&msg.data).context("malformed ICE candidate")?;
            session
                .pc
                .add_ice_candidate(candidate)
                .await
                .context("failed to apply ICE candidate")?;
            debug!(user_id = %session.user_id, "Applied remote ICE candidate");
        }
        "answer" => {
            let answer: RTCSessionDescription =
                serde_json::from_str(&msg.data).context("malformed session description")?;
            session
                .pc
                .set_remote_description(answer)
                .await
                .context("failed to apply answer")?;
            debug!(user_id = %session.user_id, "Applied client answer");
        }
        "offer" => {
            // Client-initiated renegotiation gets answered outright. Our
            // own convergence offers stay authoritative, so there is no
            // glare handling here.
            let offer: RTCSessionDescription =
                serde_json::from_str(&msg.data).context("malformed session description")?;
            session
                .pc
                .set_remote_description(offer)
                .await
                .context("failed to apply offer")?;
            let answer = session
                .pc
                .create_answer(None)
                .await
                .context("failed to create answer")?;
            session
                .pc
                .set_local_description(answer.clone())
                .await
                .context("failed to set answer as local description")?;
            let data = serde_json::to_string(&answer).context("failed to encode answer")?;
            if session.signal.write("answer", data).await.is_err() {
                bail!("signaling channel closed");
            }
            info!(user_id = %session.user_id, "Answered client renegotiation offer");
        }
        "toggle_speaking" => room.toggle_speaking(session.user_id).await,
        "toggle_mute" => room.toggle_mute(session.user_id).await,
        other => {
            warn!(user_id = %session.user_id, event = %other, "Ignoring unknown event");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::UserState;
    use crate::tests::support;

    #[tokio::test]
    async fn test_malformed_envelope_is_fatal() {
        let room = Room::new();
        let (session, _rx) = support::test_session(&room).await;
        room.add_user("alice", session.clone()).await.unwrap();

        let result = dispatch(&room, &session, "{not json").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_malformed_candidate_data_is_fatal() {
        let room = Room::new();
        let (session, _rx) = support::test_session(&room).await;
        room.add_user("alice", session.clone()).await.unwrap();

        let raw = serde_json::to_string(&WsMessage {
            event: "candidate".to_string(),
            data: "not a candidate".to_string(),
        })
        .unwrap();
        assert!(dispatch(&room, &session, &raw).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_event_is_ignored() {
        let room = Room::new();
        let (session, _rx) = support::test_session(&room).await;
        room.add_user("alice", session.clone()).await.unwrap();

        let raw = serde_json::to_string(&WsMessage {
            event: "wave_hands".to_string(),
            data: String::new(),
        })
        .unwrap();
        assert!(dispatch(&room, &session, &raw).await.is_ok());
    }

    #[tokio::test]
    async fn test_toggle_speaking_routes_to_room() {
        let room = Room::new();
        let (session, _rx) = support::test_session(&room).await;
        room.add_user("alice", session.clone()).await.unwrap();

        let raw = serde_json::to_string(&WsMessage {
            event: "toggle_speaking".to_string(),
            data: String::new(),
        })
        .unwrap();
        dispatch(&room, &session, &raw).await.unwrap();

        let snapshot = room.snapshot().await;
        assert_eq!(snapshot.users[&session.user_id], UserState::Speaking);
        assert!(snapshot.speakers.contains(&session.user_id));
    }
}
