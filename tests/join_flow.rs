use std::sync::Arc;
use std::time::Duration;

use roomcast::admission::AdmissionLimiter;
use roomcast::media;
use roomcast::room::Room;
use roomcast::server::{routes, ServerContext};
use roomcast::signal::WsMessage;
use warp::test::WsClient;
use webrtc::peer_connection::configuration::RTCConfiguration;

fn test_context(max_connections: usize) -> ServerContext {
    ServerContext {
        room: Room::new(),
        limiter: Arc::new(AdmissionLimiter::new()),
        api: Arc::new(media::build_api().expect("media engine")),
        rtc_config: RTCConfiguration::default(),
        max_connections,
    }
}

async fn recv_frame(client: &mut WsClient) -> WsMessage {
    let frame = tokio::time::timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("timed out waiting for signaling frame")
        .expect("signaling frame");
    serde_json::from_str(frame.to_str().unwrap()).expect("valid envelope")
}

#[tokio::test]
async fn test_join_receives_id_then_offer() {
    let api = routes(test_context(8));

    let mut client = warp::test::ws()
        .path("/websocket?name=bruceWayne")
        .handshake(api)
        .await
        .expect("websocket handshake");

    // we expect an id message first
    let welcome = recv_frame(&mut client).await;
    assert_eq!(welcome.event, "id");
    let data: serde_json::Value = serde_json::from_str(&welcome.data).unwrap();
    assert!(data["id"].as_str().is_some());
    let users = data["users"].as_array().unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0]["name"], "bruceWayne");
    assert_eq!(users[0]["state"], "listening");

    // convergence follows with an offer; a roster push may interleave
    loop {
        let msg = recv_frame(&mut client).await;
        if msg.event == "offer" {
            let desc: serde_json::Value = serde_json::from_str(&msg.data).unwrap();
            assert_eq!(desc["type"], "offer");
            break;
        }
    }
}

#[tokio::test]
async fn test_empty_name_channel_closes_without_id() {
    let api = routes(test_context(8));

    let mut client = warp::test::ws()
        .path("/websocket")
        .handshake(api)
        .await
        .expect("websocket handshake");

    match client.recv().await {
        Ok(msg) => assert!(msg.is_close(), "expected no signaling frame, got {:?}", msg),
        Err(_) => {}
    }
}

#[tokio::test]
async fn test_upgrade_rejected_at_capacity() {
    let api = routes(test_context(0));

    let result = warp::test::ws()
        .path("/websocket?name=carol")
        .handshake(api)
        .await;
    assert!(result.is_err(), "upgrade should be refused at capacity");
}

#[tokio::test]
async fn test_capacity_frees_after_disconnect() {
    let ctx = test_context(2);
    let api = routes(ctx.clone());

    let alice = warp::test::ws()
        .path("/websocket?name=alice")
        .handshake(api.clone())
        .await
        .expect("alice handshake");
    let _bob = warp::test::ws()
        .path("/websocket?name=bob")
        .handshake(api.clone())
        .await
        .expect("bob handshake");

    wait_for_session_count(&ctx, 2).await;
    let rejected = warp::test::ws()
        .path("/websocket?name=carol")
        .handshake(api.clone())
        .await;
    assert!(rejected.is_err(), "third upgrade must hit the session cap");

    drop(alice);
    wait_for_session_count(&ctx, 1).await;
    let admitted = warp::test::ws()
        .path("/websocket?name=carol")
        .handshake(api)
        .await;
    assert!(admitted.is_ok(), "freed slot should admit carol");
}

async fn wait_for_session_count(ctx: &ServerContext, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if ctx.room.session_count().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("room never reached {} sessions", expected));
}

#[tokio::test]
async fn test_upgrade_burst_is_rate_limited() {
    let api = routes(test_context(100));

    let mut admitted = Vec::new();
    let mut rejected = 0;
    for i in 0..15 {
        let result = warp::test::ws()
            .path(&format!("/websocket?name=user{}", i))
            .handshake(api.clone())
            .await;
        match result {
            Ok(client) => admitted.push(client),
            Err(_) => rejected += 1,
        }
    }

    assert!(admitted.len() >= 10, "the full bucket admits ten upgrades");
    assert!(rejected >= 1, "a burst of 15 upgrades must trip the limiter");
}
