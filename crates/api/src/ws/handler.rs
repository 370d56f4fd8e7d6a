use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, header};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use mediasoup::consumer::ConsumerLayers;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use confab_services::error::{MediaError, MediaResult};
use confab_services::media::room::{Room, WeakRoom};
use confab_services::media::Peer;
use confab_services::signal::envelope::{NotificationEnvelope, RequestEnvelope};
use confab_services::signal::{
    Envelope, Outbound, PeerChannel, PeerNotification, PeerRequest, ServerNotification,
};

use crate::state::AppState;

/// Upgrade framing limits: maximum received message size and outbound
/// fragmentation threshold.
const MAX_WS_MESSAGE_SIZE: usize = 960_000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsParams {
    pub room_id: String,
    pub peer_id: String,
    #[serde(default)]
    pub consumer_replicas: u32,
    #[serde(default)]
    pub use_pipe_transports: bool,
}

pub async fn ws_upgrade(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    if headers.get(header::HOST).is_none() {
        return Response::builder()
            .status(400)
            .body("TypeError: missing Host header".into())
            .unwrap();
    }
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if origin != Some(state.settings.app.domain.as_str()) {
        return Response::builder()
            .status(403)
            .body("Forbidden: origin not allowed".into())
            .unwrap();
    }

    ws.max_message_size(MAX_WS_MESSAGE_SIZE)
        .max_frame_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, params, addr))
}

async fn handle_socket(socket: WebSocket, state: AppState, params: WsParams, addr: SocketAddr) {
    info!(room_id = %params.room_id, peer_id = %params.peer_id, %addr, "signaling session connected");

    let room = match state
        .rooms
        .get_or_create_room(
            params.room_id.clone(),
            params.consumer_replicas,
            params.use_pipe_transports,
        )
        .await
    {
        Ok(room) => room,
        Err(err) => {
            warn!(room_id = %params.room_id, %err, "failed to resolve room");
            let mut socket = socket;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let (channel, mut outbound_rx) = PeerChannel::new();
    let peer = Peer::new(params.peer_id.clone(), addr.to_string(), channel.clone());
    if let Err(err) = room.add_peer(peer.clone()) {
        warn!(room_id = %params.room_id, peer_id = %params.peer_id, %err, "peer admission failed");
        let mut socket = socket;
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    channel.notify(&ServerNotification::MediasoupVersion {
        version: confab_services::ENGINE_VERSION.to_string(),
    });

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            match outbound {
                Outbound::Frame(text) => {
                    if sink.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Long-lived references stay weak: the supervisor owns the room.
    let weak_room = room.downgrade();
    drop(room);

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                handle_frame(&state, &weak_room, &peer, &channel, text.as_str()).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(peer_id = %peer.id(), %err, "signaling socket error");
                break;
            }
        }
    }

    if let Some(room) = weak_room.upgrade() {
        room.remove_peer(&peer);
    } else {
        peer.close();
    }
    writer.abort();
    info!(peer_id = %peer.id(), "signaling session ended");
}

async fn handle_frame(
    state: &AppState,
    weak_room: &WeakRoom,
    peer: &Peer,
    channel: &PeerChannel,
    text: &str,
) {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(peer_id = %peer.id(), %err, "discarding malformed frame");
            return;
        }
    };

    match envelope {
        Envelope::Request(request) => {
            let id = request.id;
            match dispatch_request(state, weak_room, peer, request).await {
                Ok(Dispatched::Reply(data)) => channel.send(&Envelope::success(id, data)),
                Ok(Dispatched::JoinAccepted { data, room }) => {
                    // The reply is the continuation carrying the snapshot;
                    // fan-out starts only after it went out, on its own task
                    // so this read loop keeps serving acknowledgements.
                    channel.send(&Envelope::success(id, data));
                    let peer = peer.clone();
                    tokio::spawn(async move {
                        room.after_peer_join(&peer).await;
                    });
                }
                Err(err) => {
                    debug!(peer_id = %peer.id(), %err, "request rejected");
                    channel.send(&Envelope::error(id, err.status(), err.to_string()));
                }
            }
        }
        Envelope::Response(response) => channel.handle_response(
            response.id,
            response.ok,
            response.data,
            response.error_code,
            response.error_reason,
        ),
        Envelope::Notification(notification) => {
            dispatch_notification(weak_room, peer, notification).await;
        }
    }
}

enum Dispatched {
    Reply(Value),
    JoinAccepted { data: Value, room: Room },
}

async fn dispatch_request(
    state: &AppState,
    weak_room: &WeakRoom,
    peer: &Peer,
    request: RequestEnvelope,
) -> MediaResult<Dispatched> {
    let room = weak_room
        .upgrade()
        .ok_or_else(|| MediaError::InvalidState("room is closed".into()))?;

    let parsed: PeerRequest = serde_json::from_value(json!({
        "method": request.method,
        "data": request.data.unwrap_or_else(|| json!({})),
    }))
    .map_err(|err| MediaError::BadRequest(format!("invalid request: {err}")))?;

    match parsed {
        PeerRequest::GetRouterRtpCapabilities {} => {
            Ok(Dispatched::Reply(room.router_rtp_capabilities()))
        }
        PeerRequest::Join(data) => {
            let peers = room.join_peer(peer, data)?;
            Ok(Dispatched::JoinAccepted {
                data: json!({ "peers": peers }),
                room,
            })
        }
        PeerRequest::CreateWebRtcTransport(data) => Ok(Dispatched::Reply(
            room.create_webrtc_transport(
                peer,
                data.direction,
                data.force_tcp,
                data.sctp_capabilities.as_ref(),
            )
            .await?,
        )),
        PeerRequest::ConnectWebRtcTransport {
            transport_id,
            dtls_parameters,
        } => {
            room.connect_webrtc_transport(peer, transport_id, dtls_parameters)
                .await?;
            Ok(Dispatched::Reply(json!({})))
        }
        PeerRequest::RestartIce { transport_id } => {
            Ok(Dispatched::Reply(room.restart_ice(peer, transport_id).await?))
        }
        PeerRequest::Produce(data) => {
            let id = room.produce(peer, data).await?;
            Ok(Dispatched::Reply(json!({ "id": id })))
        }
        PeerRequest::ProduceData(data) => {
            let id = room.produce_data(peer, data).await?;
            Ok(Dispatched::Reply(json!({ "id": id })))
        }
        PeerRequest::GetTransportStats { transport_id } => {
            let entry = peer
                .transport(&transport_id)
                .ok_or_else(|| MediaError::not_found("transport", transport_id.to_string()))?;
            let stats = entry
                .transport
                .get_stats()
                .await
                .map_err(MediaError::engine)?;
            Ok(Dispatched::Reply(
                serde_json::to_value(stats).map_err(MediaError::engine)?,
            ))
        }
        PeerRequest::GetProducerStats { producer_id } => {
            let producer = peer
                .producer(&producer_id)
                .ok_or_else(|| MediaError::not_found("producer", producer_id.to_string()))?;
            let stats = producer.get_stats().await.map_err(MediaError::engine)?;
            Ok(Dispatched::Reply(
                serde_json::to_value(stats).map_err(MediaError::engine)?,
            ))
        }
        PeerRequest::GetConsumerStats { consumer_id } => {
            let consumer = peer
                .consumer(&consumer_id)
                .ok_or_else(|| MediaError::not_found("consumer", consumer_id.to_string()))?;
            let stats = consumer.get_stats().await.map_err(MediaError::engine)?;
            Ok(Dispatched::Reply(
                serde_json::to_value(stats).map_err(MediaError::engine)?,
            ))
        }
        PeerRequest::GetDataProducerStats { data_producer_id } => {
            let data_producer = peer.data_producer(&data_producer_id).ok_or_else(|| {
                MediaError::not_found("dataProducer", data_producer_id.to_string())
            })?;
            let stats = data_producer
                .get_stats()
                .await
                .map_err(MediaError::engine)?;
            Ok(Dispatched::Reply(
                serde_json::to_value(stats).map_err(MediaError::engine)?,
            ))
        }
        PeerRequest::GetDataConsumerStats { data_consumer_id } => {
            let data_consumer = peer.data_consumer(&data_consumer_id).ok_or_else(|| {
                MediaError::not_found("dataConsumer", data_consumer_id.to_string())
            })?;
            let stats = data_consumer
                .get_stats()
                .await
                .map_err(MediaError::engine)?;
            Ok(Dispatched::Reply(
                serde_json::to_value(stats).map_err(MediaError::engine)?,
            ))
        }
        PeerRequest::ApplyNetworkThrottle(data) => {
            state.rooms.throttle().apply(room.id(), &data).await?;
            Ok(Dispatched::Reply(json!({})))
        }
        PeerRequest::StopNetworkThrottle { secret } => {
            state.rooms.throttle().stop(secret.as_deref()).await?;
            Ok(Dispatched::Reply(json!({})))
        }
    }
}

/// Notifications are fire-and-forget: failures are logged and never surfaced
/// back to the peer.
async fn dispatch_notification(
    weak_room: &WeakRoom,
    peer: &Peer,
    notification: NotificationEnvelope,
) {
    let Some(room) = weak_room.upgrade() else {
        return;
    };
    let parsed: PeerNotification = match serde_json::from_value(json!({
        "method": notification.method,
        "data": notification.data.unwrap_or_else(|| json!({})),
    })) {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!(peer_id = %peer.id(), %err, "discarding malformed notification");
            return;
        }
    };

    match parsed {
        PeerNotification::CloseProducer { producer_id } => {
            room.close_peer_producer(peer, &producer_id);
        }
        PeerNotification::PauseProducer { producer_id } => {
            if let Some(producer) = peer.producer(&producer_id) {
                if let Err(err) = producer.pause().await {
                    warn!(%producer_id, %err, "pause producer failed");
                }
            }
        }
        PeerNotification::ResumeProducer { producer_id } => {
            if let Some(producer) = peer.producer(&producer_id) {
                if let Err(err) = producer.resume().await {
                    warn!(%producer_id, %err, "resume producer failed");
                }
            }
        }
        PeerNotification::PauseConsumer { consumer_id } => {
            if let Some(consumer) = peer.consumer(&consumer_id) {
                if let Err(err) = consumer.pause().await {
                    warn!(%consumer_id, %err, "pause consumer failed");
                }
            }
        }
        PeerNotification::ResumeConsumer { consumer_id } => {
            if let Some(consumer) = peer.consumer(&consumer_id) {
                if let Err(err) = consumer.resume().await {
                    warn!(%consumer_id, %err, "resume consumer failed");
                }
            }
        }
        PeerNotification::SetConsumerPreferredLayers {
            consumer_id,
            spatial_layer,
            temporal_layer,
        } => {
            if let Some(consumer) = peer.consumer(&consumer_id) {
                let layers = ConsumerLayers {
                    spatial_layer,
                    temporal_layer,
                };
                if let Err(err) = consumer.set_preferred_layers(layers).await {
                    warn!(%consumer_id, %err, "set preferred layers failed");
                }
            }
        }
        PeerNotification::SetConsumerPriority {
            consumer_id,
            priority,
        } => {
            if let Some(consumer) = peer.consumer(&consumer_id) {
                if let Err(err) = consumer.set_priority(priority).await {
                    warn!(%consumer_id, %err, "set consumer priority failed");
                }
            }
        }
        PeerNotification::RequestConsumerKeyFrame { consumer_id } => {
            if let Some(consumer) = peer.consumer(&consumer_id) {
                if let Err(err) = consumer.request_key_frame().await {
                    warn!(%consumer_id, %err, "request key frame failed");
                }
            }
        }
        PeerNotification::ChangeDisplayName { display_name } => {
            room.change_display_name(peer, display_name);
        }
    }
}
