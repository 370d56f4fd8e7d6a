use serde_json::Value;

use crate::fixtures::TestApp;
use crate::fixtures::media::audio_rtp_parameters;

#[tokio::test]
async fn room_get_requires_pinned_origin() {
    let app = TestApp::spawn().await;

    let resp = app
        .client
        .get(app.url("/rooms/r1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);
    let body = resp.text().await.unwrap();
    assert!(body.starts_with("Forbidden"), "got body: {body}");

    let resp = app
        .client
        .get(app.url("/rooms/r1"))
        .header("Origin", "https://evil.example")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);
}

#[tokio::test]
async fn room_get_creates_and_returns_capabilities() {
    let app = TestApp::spawn().await;

    let resp = app.origin_get("/rooms/caps").send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let json: Value = resp.json().await.unwrap();
    assert!(json["routerRtpCapabilities"]["codecs"].is_array());
    assert_eq!(app.rooms.room_count(), 1);
}

#[tokio::test]
async fn broadcaster_requires_existing_room() {
    let app = TestApp::spawn().await;

    let resp = app
        .origin_post("/rooms/missing/broadcasters")
        .json(&serde_json::json!({
            "peerId": "bc1",
            "displayName": "Broadcaster",
            "device": { "name": "gstreamer" },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
    let body = resp.text().await.unwrap();
    assert!(body.starts_with("NotFound"), "got body: {body}");
}

#[tokio::test]
async fn broadcaster_lifecycle_produce_and_consume() {
    let app = TestApp::spawn().await;

    // Create the room.
    let resp = app.origin_get("/rooms/live").send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let caps: Value = resp.json().await.unwrap();
    let router_caps = caps["routerRtpCapabilities"].clone();

    // Register the sending broadcaster.
    let resp = app
        .origin_post("/rooms/live/broadcasters")
        .json(&serde_json::json!({
            "peerId": "sender",
            "displayName": "Sender",
            "device": { "name": "gstreamer" },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    assert!(
        resp.headers()
            .get("location")
            .unwrap()
            .to_str()
            .unwrap()
            .ends_with("/rooms/live/broadcasters/sender")
    );

    // Duplicate ids are rejected.
    let resp = app
        .origin_post("/rooms/live/broadcasters")
        .json(&serde_json::json!({
            "peerId": "sender",
            "displayName": "Clone",
            "device": {},
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 409);

    // A transport can exist before join, but producing cannot.
    let resp = app
        .origin_post("/rooms/live/broadcasters/sender/transports")
        .json(&serde_json::json!({ "direction": "send", "comedia": false }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    let transport: Value = resp.json().await.unwrap();
    let transport_id = transport["transportId"].as_str().unwrap().to_string();
    assert!(transport["port"].as_u64().unwrap() > 0);

    let resp = app
        .origin_post("/rooms/live/broadcasters/sender/producers")
        .json(&serde_json::json!({
            "transportId": transport_id,
            "kind": "audio",
            "rtpParameters": audio_rtp_parameters(1111_1111),
            "appData": { "source": "audio" },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 409);

    // Join, connect the transport, produce.
    let resp = app
        .origin_post("/rooms/live/broadcasters/sender/join")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let resp = app
        .origin_post(&format!(
            "/rooms/live/broadcasters/sender/transports/{transport_id}/connect"
        ))
        .json(&serde_json::json!({ "ip": "127.0.0.1", "port": 9875 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let resp = app
        .origin_post("/rooms/live/broadcasters/sender/producers")
        .json(&serde_json::json!({
            "transportId": transport_id,
            "kind": "audio",
            "rtpParameters": audio_rtp_parameters(1111_1111),
            "appData": { "source": "audio" },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    let produced: Value = resp.json().await.unwrap();
    let producer_id = produced["producerId"].as_str().unwrap().to_string();

    // A second broadcaster consumes the stream over its own plain transport.
    let resp = app
        .origin_post("/rooms/live/broadcasters")
        .json(&serde_json::json!({
            "peerId": "viewer",
            "displayName": "Viewer",
            "device": {},
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    let created: Value = resp.json().await.unwrap();
    assert!(
        created["peers"]
            .as_array()
            .unwrap()
            .iter()
            .any(|peer| peer["id"] == "sender")
    );

    app.origin_post("/rooms/live/broadcasters/viewer/join")
        .send()
        .await
        .unwrap();

    let resp = app
        .origin_post("/rooms/live/broadcasters/viewer/transports")
        .json(&serde_json::json!({ "direction": "recv", "comedia": false, "rtcpMux": false }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    let viewer_transport: Value = resp.json().await.unwrap();
    let viewer_transport_id = viewer_transport["transportId"].as_str().unwrap();

    let resp = app
        .origin_post("/rooms/live/broadcasters/viewer/consumers")
        .json(&serde_json::json!({
            "transportId": viewer_transport_id,
            "producerId": producer_id,
            "paused": true,
            "rtpCapabilities": router_caps,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    let consumer: Value = resp.json().await.unwrap();
    let consumer_id = consumer["consumerId"].as_str().unwrap();

    let resp = app
        .origin_post(&format!(
            "/rooms/live/broadcasters/viewer/consumers/{consumer_id}/resume"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    // Tear down.
    let resp = app
        .origin_delete("/rooms/live/broadcasters/viewer")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 204);

    let resp = app
        .origin_delete("/rooms/live/broadcasters/viewer")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}

#[tokio::test]
async fn consuming_an_unknown_producer_is_not_found() {
    let app = TestApp::spawn().await;

    let resp = app.origin_get("/rooms/nf").send().await.unwrap();
    let caps: Value = resp.json().await.unwrap();

    app.origin_post("/rooms/nf/broadcasters")
        .json(&serde_json::json!({
            "peerId": "bc",
            "displayName": "B",
            "device": {},
        }))
        .send()
        .await
        .unwrap();
    app.origin_post("/rooms/nf/broadcasters/bc/join")
        .send()
        .await
        .unwrap();

    let resp = app
        .origin_post("/rooms/nf/broadcasters/bc/transports")
        .json(&serde_json::json!({ "direction": "recv", "comedia": false }))
        .send()
        .await
        .unwrap();
    let transport: Value = resp.json().await.unwrap();

    let resp = app
        .origin_post("/rooms/nf/broadcasters/bc/consumers")
        .json(&serde_json::json!({
            "transportId": transport["transportId"],
            "producerId": uuid::Uuid::new_v4().to_string(),
            "rtpCapabilities": caps["routerRtpCapabilities"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}
