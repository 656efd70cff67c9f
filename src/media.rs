use anyhow::{Context, Result};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability, RTPCodecType,
};

/// Public STUN server used when no TURN infrastructure is deployed.
const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Codecs the room negotiates: Opus for voice, VP8 and H264 so browser
/// and native publishers can both send video without transcoding.
fn codecs() -> Vec<(RTCRtpCodecParameters, RTPCodecType)> {
    vec![
        (
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: "audio/opus".to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                    ..Default::default()
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        ),
        (
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: "video/VP8".to_owned(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                payload_type: 96,
                ..Default::default()
            },
            RTPCodecType::Video,
        ),
        (
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: "video/H264".to_owned(),
                    clock_rate: 90000,
                    sdp_fmtp_line:
                        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                            .to_owned(),
                    ..Default::default()
                },
                payload_type: 102,
                ..Default::default()
            },
            RTPCodecType::Video,
        ),
    ]
}

/// Header extensions offered on ingress. The fan-out strips every
/// extension before forwarding, so only what the ingest side itself
/// consumes is negotiated: mid for bundle demux, audio level for the
/// voice path, send time and transport-cc for the default interceptors.
fn header_extensions() -> Vec<(&'static str, Vec<RTPCodecType>)> {
    vec![
        (
            "urn:ietf:params:rtp-hdrext:sdes:mid",
            vec![RTPCodecType::Audio, RTPCodecType::Video],
        ),
        (
            "urn:ietf:params:rtp-hdrext:ssrc-audio-level",
            vec![RTPCodecType::Audio],
        ),
        (
            "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
            vec![RTPCodecType::Audio, RTPCodecType::Video],
        ),
        (
            "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01",
            vec![RTPCodecType::Audio, RTPCodecType::Video],
        ),
    ]
}

/// Builds the process-wide WebRTC API: the room's media engine plus the
/// default interceptor set.
pub fn build_api() -> Result<API> {
    let mut media_engine = MediaEngine::default();

    for (params, kind) in codecs() {
        let mime_type = params.capability.mime_type.clone();
        media_engine
            .register_codec(params, kind)
            .with_context(|| format!("failed to register {} codec", mime_type))?;
    }

    for (uri, kinds) in header_extensions() {
        for kind in kinds {
            media_engine
                .register_header_extension(
                    RTCRtpHeaderExtensionCapability {
                        uri: uri.to_string(),
                    },
                    kind,
                    None,
                )
                .with_context(|| format!("failed to register header extension {}", uri))?;
        }
    }

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .context("failed to register default interceptors")?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Transport configuration handed to every peer session.
pub fn rtc_config() -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![STUN_SERVER.to_string()],
            ..Default::default()
        }],
        bundle_policy: RTCBundlePolicy::MaxBundle,
        ..Default::default()
    }
}
