use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::ws::{WebSocket, Ws};
use warp::{Filter, Rejection, Reply};
use webrtc::api::API;
use webrtc::peer_connection::configuration::RTCConfiguration;

use crate::admission::{self, AdmissionLimiter};
use crate::dispatch;
use crate::metrics::{SFU_ADMISSION_REJECTED_TOTAL, SFU_SESSIONS_OPENED_TOTAL};
use crate::peer::PeerSession;
use crate::room::Room;
use crate::signal::SignalSender;

/// Shared handles every connection needs.
#[derive(Clone)]
pub struct ServerContext {
    pub room: Arc<Room>,
    pub limiter: Arc<AdmissionLimiter>,
    pub api: Arc<API>,
    pub rtc_config: RTCConfiguration,
    pub max_connections: usize,
}

/// Full route set: the signaling upgrade, Prometheus metrics, liveness.
pub fn routes(
    ctx: ServerContext,
) -> impl Filter<Extract = impl Reply + Send, Error = Rejection> + Clone + Send + Sync + 'static {
    let ctx_filter = warp::any().map(move || ctx.clone());

    let websocket = warp::path("websocket")
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::ws())
        .and(ctx_filter)
        .and_then(handle_upgrade);

    let metrics = warp::path("metrics").and(warp::get()).map(render_metrics);
    let healthz = warp::path("healthz").and(warp::get()).map(|| "ok");

    websocket.or(metrics).or(healthz)
}

async fn handle_upgrade(
    query: HashMap<String, String>,
    ws: Ws,
    ctx: ServerContext,
) -> Result<warp::reply::Response, Infallible> {
    if let Err(e) = ctx.limiter.try_admit().await {
        SFU_ADMISSION_REJECTED_TOTAL
            .with_label_values(&["rate_limited"])
            .inc();
        warn!(error = %e, "Rejecting upgrade");
        return Ok(
            warp::reply::with_status("upgrade rate limit exceeded", StatusCode::TOO_MANY_REQUESTS)
                .into_response(),
        );
    }

    let live = ctx.room.session_count().await;
    if let Err(e) = admission::check_capacity(live, ctx.max_connections) {
        SFU_ADMISSION_REJECTED_TOTAL
            .with_label_values(&["at_capacity"])
            .inc();
        warn!(live, max = ctx.max_connections, error = %e, "Rejecting upgrade");
        return Ok(
            warp::reply::with_status("session capacity reached", StatusCode::SERVICE_UNAVAILABLE)
                .into_response(),
        );
    }

    let name = query.get("name").cloned().unwrap_or_default();
    Ok(ws
        .on_upgrade(move |socket| client_session(ctx, name, socket))
        .into_response())
}

/// Lifetime of one signaling channel: admission, welcome, convergence,
/// then the dispatch loop until the channel dies. Teardown reverses the
/// registration and reconverges the room.
async fn client_session(ctx: ServerContext, name: String, socket: WebSocket) {
    let (sink, mut reader) = socket.split();
    let signal = Arc::new(SignalSender::new(sink));

    if name.trim().is_empty() {
        warn!("Closing channel: display name is required");
        return;
    }

    let user_id = Uuid::new_v4();
    let session = match PeerSession::connect(
        &ctx.api,
        ctx.rtc_config.clone(),
        user_id,
        signal.clone(),
        &ctx.room,
    )
    .await
    {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "Failed to build peer transport");
            return;
        }
    };

    // add_user delivers the `id` frame before the session is visible to
    // broadcasts and convergence
    if let Err(e) = ctx.room.add_user(&name, session.clone()).await {
        warn!(error = %e, "Closing channel");
        if let Err(e) = session.pc.close().await {
            warn!(error = %e, "Error closing peer connection");
        }
        return;
    }
    SFU_SESSIONS_OPENED_TOTAL.inc();

    ctx.room.broadcast_roster().await;
    // Offer whatever the registry holds right now.
    ctx.room.converge().await;

    while let Some(frame) = reader.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                debug!(user_id = %user_id, error = %e, "Signaling read failed");
                break;
            }
        };
        if msg.is_close() {
            break;
        }
        let Ok(text) = msg.to_str() else {
            continue; // non-text frames carry nothing for us
        };
        if let Err(e) = dispatch::dispatch(&ctx.room, &session, text).await {
            warn!(user_id = %user_id, error = %e, "Terminating session");
            break;
        }
    }

    ctx.room.remove_user(user_id).await;
    info!(user_id = %user_id, "Session closed");
}

/// Every three seconds, ask all live sources for a keyframe.
pub fn spawn_keyframe_ticker(room: Arc<Room>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3));
        loop {
            ticker.tick().await;
            room.solicit_keyframes().await;
        }
    })
}

fn render_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = vec![];
    let metric_families = prometheus::gather();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
