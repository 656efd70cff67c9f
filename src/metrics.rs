use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

lazy_static! {
    pub static ref SFU_ACTIVE_SESSIONS: IntGauge =
        register_int_gauge!("sfu_active_sessions", "Number of currently active peer sessions").unwrap();
    pub static ref SFU_ACTIVE_TRACKS: IntGauge =
        register_int_gauge!("sfu_active_tracks", "Number of live fan-out tracks").unwrap();
    pub static ref SFU_PACKETS_FORWARDED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sfu_packets_forwarded_total",
        "Total number of RTP packets forwarded",
        &["media_type"] // "video" or "audio"
    )
    .unwrap();
    pub static ref SFU_KEYFRAMES_REQUESTED_TOTAL: IntCounter = register_int_counter!(
        "sfu_keyframes_requested_total",
        "Total number of PLIs (Keyframe requests) sent to sources"
    )
    .unwrap();
    pub static ref SFU_CONVERGENCE_RESTARTS_TOTAL: IntCounter = register_int_counter!(
        "sfu_convergence_restarts_total",
        "Total number of restarted signaling reconciliation passes"
    )
    .unwrap();
    pub static ref SFU_SESSIONS_OPENED_TOTAL: IntCounter = register_int_counter!(
        "sfu_sessions_opened_total",
        "Total number of peer sessions admitted"
    )
    .unwrap();
    pub static ref SFU_ADMISSION_REJECTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sfu_admission_rejected_total",
        "Total number of rejected channel upgrades",
        &["reason"] // "rate_limited", "at_capacity"
    )
    .unwrap();
}

pub fn register_metrics() {
    // Force initialization of lazy_statics
    let _ = SFU_ACTIVE_SESSIONS.get();
    let _ = SFU_ACTIVE_TRACKS.get();
    let _ = SFU_PACKETS_FORWARDED_TOTAL
        .with_label_values(&["video"])
        .get();
    let _ = SFU_KEYFRAMES_REQUESTED_TOTAL.get();
    let _ = SFU_CONVERGENCE_RESTARTS_TOTAL.get();
    let _ = SFU_SESSIONS_OPENED_TOTAL.get();
    let _ = SFU_ADMISSION_REJECTED_TOTAL
        .with_label_values(&["rate_limited"])
        .get();
}
