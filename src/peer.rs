use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::Attributes;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

use crate::metrics::SFU_PACKETS_FORWARDED_TOTAL;
use crate::room::Room;
use crate::signal::SignalSender;

/// One participant's server-side session: the peer transport plus the
/// serialized signaling channel back to the client. Exactly one per
/// user; their lifetimes coincide.
pub struct PeerSession {
    pub user_id: Uuid,
    pub pc: Arc<RTCPeerConnection>,
    pub signal: Arc<SignalSender>,
}

/// Inbound media source, abstracted so the forwarding loop can be driven
/// without a live DTLS session.
#[async_trait]
pub trait IngestSource: Send + Sync {
    fn id(&self) -> String;
    fn stream_id(&self) -> String;
    fn ssrc(&self) -> u32;
    fn codec_capability(&self) -> RTCRtpCodecCapability;
    async fn read_rtp(&self) -> Result<(Packet, Attributes)>;
}

#[async_trait]
impl IngestSource for TrackRemote {
    fn id(&self) -> String {
        self.id()
    }
    fn stream_id(&self) -> String {
        self.stream_id()
    }
    fn ssrc(&self) -> u32 {
        self.ssrc()
    }
    fn codec_capability(&self) -> RTCRtpCodecCapability {
        self.codec().capability.clone()
    }
    async fn read_rtp(&self) -> Result<(Packet, Attributes)> {
        self.read_rtp().await.map_err(|e| e.into())
    }
}

impl PeerSession {
    /// Builds the transport for one participant: two pre-declared
    /// receive-only transceivers, with candidate, connection-state and
    /// track callbacks wired into the room.
    pub async fn connect(
        api: &API,
        config: RTCConfiguration,
        user_id: Uuid,
        signal: Arc<SignalSender>,
        room: &Arc<Room>,
    ) -> Result<Arc<Self>> {
        let pc = Arc::new(api.new_peer_connection(config).await?);

        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        }

        register_ice_candidate_handler(&pc, user_id, signal.clone());
        register_state_handler(&pc, user_id, room);
        register_track_handler(&pc, user_id, room);

        Ok(Arc::new(Self {
            user_id,
            pc,
            signal,
        }))
    }
}

fn register_ice_candidate_handler(
    pc: &Arc<RTCPeerConnection>,
    user_id: Uuid,
    signal: Arc<SignalSender>,
) {
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let signal = signal.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            let init = match candidate.to_json() {
                Ok(init) => init,
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Failed to serialize ICE candidate");
                    return;
                }
            };
            let data = match serde_json::to_string(&init) {
                Ok(data) => data,
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Failed to encode ICE candidate");
                    return;
                }
            };
            if signal.write("candidate", data).await.is_err() {
                debug!(user_id = %user_id, "Dropping candidate, signaling channel closed");
            }
        })
    }));
}

fn register_state_handler(pc: &Arc<RTCPeerConnection>, user_id: Uuid, room: &Arc<Room>) {
    let pc_weak = Arc::downgrade(pc);
    let room_weak = Arc::downgrade(room);

    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let pc_weak = pc_weak.clone();
        let room_weak = room_weak.clone();
        Box::pin(async move {
            debug!(user_id = %user_id, state = %state, "Peer connection state changed");
            match state {
                RTCPeerConnectionState::Failed => {
                    // Drive the transport to Closed; convergence reaps it
                    // from there.
                    if let Some(pc) = pc_weak.upgrade() {
                        if let Err(e) = pc.close().await {
                            warn!(user_id = %user_id, error = %e, "Error closing failed transport");
                        }
                    }
                }
                RTCPeerConnectionState::Closed => {
                    if let Some(room) = room_weak.upgrade() {
                        tokio::spawn(async move { room.converge().await });
                    }
                }
                _ => {}
            }
        })
    }));
}

fn register_track_handler(pc: &Arc<RTCPeerConnection>, user_id: Uuid, room: &Arc<Room>) {
    let room_weak = Arc::downgrade(room);

    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let room_weak = room_weak.clone();
        Box::pin(async move {
            let Some(room) = room_weak.upgrade() else {
                return;
            };
            tokio::spawn(run_ingest(room, user_id, track as Arc<dyn IngestSource>));
        })
    }));
}

/// Extension ids are only meaningful on the ingress transport, so they
/// never travel into the fan-out.
pub fn scrub_header_extensions(packet: &mut Packet) {
    packet.header.extension = false;
    packet.header.extension_profile = 0;
    packet.header.extensions.clear();
}

/// Media ingest for one inbound track: gate on SPEAKING, register the
/// fan-out, forward packets, and unregister on the way out no matter how
/// the loop ends.
pub(crate) async fn run_ingest(room: Arc<Room>, user_id: Uuid, track: Arc<dyn IngestSource>) {
    let track_id = track.id();

    if !room.is_speaking(user_id).await {
        info!(user_id = %user_id, track_id = %track_id, "Dropping track from non-speaking user");
        return;
    }

    let capability = track.codec_capability();
    let media_type = if capability.mime_type.to_lowercase().starts_with("audio") {
        "audio"
    } else {
        "video"
    };
    let fan_out = Arc::new(TrackLocalStaticRTP::new(
        capability,
        track_id.clone(),
        track.stream_id(),
    ));

    if !room
        .publish_track(user_id, track_id.clone(), track.ssrc(), fan_out.clone())
        .await
    {
        // Lost the speaker state while the first packet was in flight.
        return;
    }

    info!(user_id = %user_id, track_id = %track_id, "Forwarding ingest");
    loop {
        match track.read_rtp().await {
            Ok((mut packet, _)) => {
                scrub_header_extensions(&mut packet);
                if let Err(e) = fan_out.write_rtp(&packet).await {
                    debug!(track_id = %track_id, error = %e, "Fan-out write failed");
                } else {
                    SFU_PACKETS_FORWARDED_TOTAL
                        .with_label_values(&[media_type])
                        .inc();
                }
            }
            Err(e) => {
                debug!(track_id = %track_id, error = %e, "Ingest read loop finished");
                break;
            }
        }
    }

    room.retract_track(user_id, &track_id).await;
}
