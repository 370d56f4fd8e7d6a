use std::collections::VecDeque;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::ClientRequestBuilder;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::fixtures::TestApp;
use crate::fixtures::media::{audio_rtp_parameters, sctp_capabilities};

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimal signaling client speaking the request/response/notification
/// envelopes.
struct WsClient {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    buffered: VecDeque<Value>,
    next_id: u32,
}

impl WsClient {
    async fn connect(app: &TestApp, query: &str) -> Self {
        let uri: Uri = app.ws_url(query).parse().unwrap();
        let request =
            ClientRequestBuilder::new(uri).with_header("Origin", app.settings.app.domain.clone());
        let (socket, _) = connect_async(request).await.expect("ws connect failed");
        Self {
            socket,
            buffered: VecDeque::new(),
            next_id: 1,
        }
    }

    async fn recv_raw(&mut self) -> Option<Value> {
        loop {
            let message = tokio::time::timeout(RECV_TIMEOUT, self.socket.next())
                .await
                .expect("timed out waiting for a frame")?;
            match message.ok()? {
                Message::Text(text) => {
                    return Some(serde_json::from_str(text.as_str()).unwrap());
                }
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    async fn recv(&mut self) -> Option<Value> {
        if let Some(frame) = self.buffered.pop_front() {
            return Some(frame);
        }
        self.recv_raw().await
    }

    async fn request(&mut self, method: &str, data: Value) -> Result<Value, (u16, String)> {
        let id = self.next_id;
        self.next_id += 1;
        let frame = json!({ "request": true, "id": id, "method": method, "data": data });
        self.socket
            .send(Message::text(frame.to_string()))
            .await
            .expect("send failed");

        loop {
            let frame = self
                .recv_raw()
                .await
                .expect("socket closed while awaiting response");
            if frame["response"] == true && frame["id"] == id {
                if frame["ok"] == true {
                    return Ok(frame["data"].clone());
                }
                return Err((
                    frame["errorCode"].as_u64().unwrap_or(500) as u16,
                    frame["errorReason"].as_str().unwrap_or_default().to_string(),
                ));
            }
            self.buffered.push_back(frame);
        }
    }

    /// Reads until a notification with the given method arrives, discarding
    /// everything else.
    async fn expect_notification(&mut self, method: &str) -> Value {
        loop {
            let frame = self
                .recv()
                .await
                .unwrap_or_else(|| panic!("socket closed while waiting for \"{method}\""));
            if frame["notification"] == true && frame["method"] == method {
                return frame["data"].clone();
            }
        }
    }

    /// Reads until a server-initiated request with the given method arrives.
    async fn expect_request(&mut self, method: &str) -> (u64, Value) {
        loop {
            let frame = self
                .recv()
                .await
                .unwrap_or_else(|| panic!("socket closed while waiting for \"{method}\""));
            if frame["request"] == true && frame["method"] == method {
                return (frame["id"].as_u64().unwrap(), frame["data"].clone());
            }
        }
    }

    async fn respond_ok(&mut self, id: u64, data: Value) {
        let frame = json!({ "response": true, "id": id, "ok": true, "data": data });
        self.socket
            .send(Message::text(frame.to_string()))
            .await
            .expect("send failed");
    }

    async fn join(&mut self, display_name: &str, extra: Value) -> Result<Value, (u16, String)> {
        let mut data = json!({
            "displayName": display_name,
            "device": { "name": "test-client" },
        });
        if let (Some(data_obj), Some(extra_obj)) = (data.as_object_mut(), extra.as_object()) {
            for (key, value) in extra_obj {
                data_obj.insert(key.clone(), value.clone());
            }
        }
        self.request("join", data).await
    }
}

#[tokio::test]
async fn upgrade_rejects_wrong_origin() {
    let app = TestApp::spawn().await;

    let uri: Uri = app.ws_url("roomId=r&peerId=p").parse().unwrap();
    let request = ClientRequestBuilder::new(uri).with_header("Origin", "https://evil.example");
    let result = connect_async(request).await;
    assert!(result.is_err(), "upgrade must be rejected");
}

#[tokio::test]
async fn join_returns_snapshot_and_broadcasts_new_peer() {
    let app = TestApp::spawn().await;

    let mut alice = WsClient::connect(&app, "roomId=main&peerId=alice").await;
    let joined = alice.join("Alice", json!({})).await.unwrap();
    assert_eq!(joined["peers"].as_array().unwrap().len(), 0);

    let mut bob = WsClient::connect(&app, "roomId=main&peerId=bob").await;
    let joined = bob.join("Bob", json!({})).await.unwrap();
    let peers = joined["peers"].as_array().unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0]["id"], "alice");
    assert_eq!(peers[0]["displayName"], "Alice");

    let new_peer = alice.expect_notification("newPeer").await;
    assert_eq!(new_peer["id"], "bob");
    assert_eq!(new_peer["displayName"], "Bob");
}

#[tokio::test]
async fn join_twice_is_rejected_as_invalid_state() {
    let app = TestApp::spawn().await;

    let mut alice = WsClient::connect(&app, "roomId=twice&peerId=alice").await;
    alice.join("Alice", json!({})).await.unwrap();
    let (code, reason) = alice.join("Alice", json!({})).await.unwrap_err();
    assert_eq!(code, 409);
    assert!(!reason.is_empty());
}

#[tokio::test]
async fn new_producer_fans_out_and_resumes_after_ack() {
    let app = TestApp::spawn().await;

    // Alice declares receive capabilities and a receive transport, so she is
    // consume-capable for Bob's audio.
    let mut alice = WsClient::connect(&app, "roomId=media&peerId=alice").await;
    let caps = alice
        .request("getRouterRtpCapabilities", json!({}))
        .await
        .unwrap();
    alice
        .request("createWebRtcTransport", json!({ "direction": "recv" }))
        .await
        .unwrap();
    alice
        .join("Alice", json!({ "rtpCapabilities": caps }))
        .await
        .unwrap();

    let mut bob = WsClient::connect(&app, "roomId=media&peerId=bob").await;
    bob.join("Bob", json!({})).await.unwrap();
    let transport = bob
        .request("createWebRtcTransport", json!({ "direction": "send" }))
        .await
        .unwrap();
    let produced = bob
        .request(
            "produce",
            json!({
                "transportId": transport["id"],
                "kind": "audio",
                "rtpParameters": audio_rtp_parameters(2222_2222),
                "appData": { "source": "audio" },
            }),
        )
        .await
        .unwrap();
    let producer_id = produced["id"].as_str().unwrap();

    // The room asks Alice to provision the receiving endpoint; only after
    // her acknowledgement is the engine consumer resumed, observable as the
    // score push that follows the resume.
    let (request_id, data) = alice.expect_request("newConsumer").await;
    assert_eq!(data["producerId"].as_str().unwrap(), producer_id);
    assert_eq!(data["peerId"], "bob");
    assert_eq!(data["kind"], "audio");
    assert_eq!(data["appData"]["source"], "audio");
    let consumer_id = data["id"].as_str().unwrap().to_string();

    alice.respond_ok(request_id, json!({})).await;

    let score = alice.expect_notification("consumerScore").await;
    assert_eq!(score["consumerId"].as_str().unwrap(), consumer_id);
}

#[tokio::test]
async fn joining_with_sctp_receives_the_bot_stream() {
    let app = TestApp::spawn().await;

    let mut alice = WsClient::connect(&app, "roomId=bot&peerId=alice").await;
    let caps = alice
        .request("getRouterRtpCapabilities", json!({}))
        .await
        .unwrap();
    alice
        .request(
            "createWebRtcTransport",
            json!({ "direction": "recv", "sctpCapabilities": sctp_capabilities() }),
        )
        .await
        .unwrap();
    alice
        .join(
            "Alice",
            json!({ "rtpCapabilities": caps, "sctpCapabilities": sctp_capabilities() }),
        )
        .await
        .unwrap();

    let (request_id, data) = alice.expect_request("newDataConsumer").await;
    assert_eq!(data["label"], "bot");
    assert!(data["peerId"].is_null());
    assert_eq!(data["appData"]["channel"], "bot");
    alice.respond_ok(request_id, json!({})).await;
}

#[tokio::test]
async fn join_timeout_closes_the_channel_without_broadcast() {
    let app = TestApp::spawn_with_settings(|settings| {
        settings.room.join_timeout_secs = 1;
    })
    .await;

    let mut watcher = WsClient::connect(&app, "roomId=slow&peerId=watcher").await;
    watcher.join("Watcher", json!({})).await.unwrap();

    let mut idler = WsClient::connect(&app, "roomId=slow&peerId=idler").await;

    // The idler never joins; its channel closes on timer expiry.
    let mut closed = false;
    for _ in 0..20 {
        match idler.recv().await {
            Some(_) => continue,
            None => {
                closed = true;
                break;
            }
        }
    }
    assert!(closed, "idler channel should have been closed");

    // No newPeer was ever broadcast for the idler.
    let joined = watcher.join("Watcher", json!({})).await;
    assert!(joined.is_err(), "sanity: watcher already joined");
    assert!(
        watcher.buffered.iter().all(|frame| frame["method"] != "newPeer"),
        "no newPeer may be announced for a peer that never joined"
    );
}

#[tokio::test]
async fn disconnect_broadcasts_peer_closed_and_empties_the_room() {
    let app = TestApp::spawn().await;

    let mut alice = WsClient::connect(&app, "roomId=bye&peerId=alice").await;
    alice.join("Alice", json!({})).await.unwrap();
    let mut bob = WsClient::connect(&app, "roomId=bye&peerId=bob").await;
    bob.join("Bob", json!({})).await.unwrap();
    alice.expect_notification("newPeer").await;

    drop(bob);
    let closed = alice.expect_notification("peerClosed").await;
    assert_eq!(closed["peerId"], "bob");

    drop(alice);
    let mut empty = false;
    for _ in 0..50 {
        if app.rooms.room_count() == 0 {
            empty = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(empty, "room must close after its last peer leaves");
}

#[tokio::test]
async fn same_peer_id_supersedes_the_previous_session() {
    let app = TestApp::spawn().await;

    let mut watcher = WsClient::connect(&app, "roomId=dup&peerId=watcher").await;
    watcher.join("Watcher", json!({})).await.unwrap();

    let mut first = WsClient::connect(&app, "roomId=dup&peerId=twin").await;
    first.join("Twin", json!({})).await.unwrap();
    watcher.expect_notification("newPeer").await;

    let mut second = WsClient::connect(&app, "roomId=dup&peerId=twin").await;

    // The first session is closed out and announced as such.
    let closed = watcher.expect_notification("peerClosed").await;
    assert_eq!(closed["peerId"], "twin");
    assert!(first.recv().await.is_none(), "first session must be closed");

    // The superseding session is fully functional.
    second.join("Twin II", json!({})).await.unwrap();
    let new_peer = watcher.expect_notification("newPeer").await;
    assert_eq!(new_peer["displayName"], "Twin II");
}

#[tokio::test]
async fn throttle_request_with_wrong_secret_is_forbidden() {
    let app = TestApp::spawn().await;

    let mut alice = WsClient::connect(&app, "roomId=throttle&peerId=alice").await;
    alice.join("Alice", json!({})).await.unwrap();

    let (code, reason) = alice
        .request(
            "applyNetworkThrottle",
            json!({ "secret": "wrong", "uplink": 1000, "downlink": 1000, "rtt": 50 }),
        )
        .await
        .unwrap_err();
    assert_eq!(code, 403);
    assert!(!reason.is_empty());
    assert!(!app.rooms.throttle().is_enabled().await);

    let (code, _) = alice
        .request("stopNetworkThrottle", json!({ "secret": "wrong" }))
        .await
        .unwrap_err();
    assert_eq!(code, 403);
}
