use std::net::IpAddr;
use std::str::FromStr;

use axum::extract::{Json, Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use confab_services::media::types::{MediaSource, TransportDirection};
use mediasoup::consumer::ConsumerId;
use mediasoup::plain_transport::PlainTransportRemoteParameters;
use mediasoup::prelude::*;
use mediasoup::producer::ProducerId;
use mediasoup::rtp_parameters::{MediaKind, RtpCapabilities, RtpParameters};
use mediasoup::transport::TransportId;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::ApiError;
use crate::extractors::origin::RequireOrigin;
use crate::state::AppState;

use confab_services::media::Room;

fn resolve_room(state: &AppState, room_id: &str) -> Result<Room, ApiError> {
    state
        .rooms
        .room(&room_id.to_string())
        .ok_or_else(|| ApiError::not_found("room", room_id))
}

/// GET /rooms/{roomId} — resolves (creating on demand) and returns the RTP
/// capabilities consumers negotiate against.
pub async fn get_room(
    State(state): State<AppState>,
    _origin: RequireOrigin,
    Path(room_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let room = state.rooms.get_or_create_room(room_id, 0, false).await?;
    Ok(Json(json!({
        "routerRtpCapabilities": room.router_rtp_capabilities(),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBroadcasterRequest {
    pub peer_id: String,
    pub display_name: String,
    #[serde(default)]
    pub device: Value,
}

pub async fn create_broadcaster(
    State(state): State<AppState>,
    _origin: RequireOrigin,
    Path(room_id): Path<String>,
    Json(body): Json<CreateBroadcasterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let room = resolve_room(&state, &room_id)?;
    let peers = room.create_broadcaster(body.peer_id.clone(), body.display_name, body.device)?;
    let location = format!("/rooms/{room_id}/broadcasters/{}", body.peer_id);
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        Json(json!({ "peers": peers })),
    ))
}

pub async fn delete_broadcaster(
    State(state): State<AppState>,
    _origin: RequireOrigin,
    Path((room_id, peer_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let room = resolve_room(&state, &room_id)?;
    room.remove_broadcaster(&peer_id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn join_broadcaster(
    State(state): State<AppState>,
    _origin: RequireOrigin,
    Path((room_id, peer_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let room = resolve_room(&state, &room_id)?;
    room.join_broadcaster(&peer_id)?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportRequest {
    pub direction: TransportDirection,
    #[serde(default)]
    pub comedia: Option<bool>,
    #[serde(default)]
    pub rtcp_mux: Option<bool>,
}

pub async fn create_broadcaster_transport(
    State(state): State<AppState>,
    _origin: RequireOrigin,
    Path((room_id, peer_id)): Path<(String, String)>,
    Json(body): Json<CreateTransportRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let room = resolve_room(&state, &room_id)?;
    let transport = room
        .broadcaster_create_transport(
            &peer_id,
            body.direction,
            body.comedia.unwrap_or(true),
            body.rtcp_mux.unwrap_or(false),
        )
        .await?;

    let response = json!({
        "transportId": transport.id(),
        "ip": state.settings.plain_transport.announced_ip,
        "port": transport.tuple().local_port(),
        "rtcpPort": transport.rtcp_tuple().map(|tuple| tuple.local_port()),
    });
    Ok((StatusCode::CREATED, Json(response)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub ip: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub rtcp_port: Option<u16>,
}

pub async fn connect_broadcaster_transport(
    State(state): State<AppState>,
    _origin: RequireOrigin,
    Path((room_id, peer_id, transport_id)): Path<(String, String, String)>,
    Json(body): Json<ConnectTransportRequest>,
) -> Result<StatusCode, ApiError> {
    let room = resolve_room(&state, &room_id)?;
    let transport_id = TransportId::from_str(&transport_id)
        .map_err(|_| ApiError::bad_request("invalid transport id"))?;
    room.broadcaster_connect_transport(
        &peer_id,
        transport_id,
        PlainTransportRemoteParameters {
            ip: Some(body.ip),
            port: Some(body.port),
            rtcp_port: body.rtcp_port,
            srtp_parameters: None,
        },
    )
    .await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProducerRequest {
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub app_data: ProducerAppDataBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerAppDataBody {
    pub source: MediaSource,
}

pub async fn create_broadcaster_producer(
    State(state): State<AppState>,
    _origin: RequireOrigin,
    Path((room_id, peer_id)): Path<(String, String)>,
    Json(body): Json<CreateProducerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let room = resolve_room(&state, &room_id)?;
    let transport_id = TransportId::from_str(&body.transport_id)
        .map_err(|_| ApiError::bad_request("invalid transport id"))?;
    let producer_id = room
        .broadcaster_produce(
            &peer_id,
            transport_id,
            body.kind,
            body.rtp_parameters,
            body.app_data.source,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "producerId": producer_id }))))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConsumerRequest {
    pub transport_id: String,
    pub producer_id: String,
    #[serde(default)]
    pub paused: bool,
    pub rtp_capabilities: RtpCapabilities,
}

pub async fn create_broadcaster_consumer(
    State(state): State<AppState>,
    _origin: RequireOrigin,
    Path((room_id, peer_id)): Path<(String, String)>,
    Json(body): Json<CreateConsumerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let room = resolve_room(&state, &room_id)?;
    let transport_id = TransportId::from_str(&body.transport_id)
        .map_err(|_| ApiError::bad_request("invalid transport id"))?;
    let producer_id = ProducerId::from_str(&body.producer_id)
        .map_err(|_| ApiError::bad_request("invalid producer id"))?;
    let consumer_id = room
        .broadcaster_consume(
            &peer_id,
            transport_id,
            producer_id,
            body.rtp_capabilities,
            body.paused,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "consumerId": consumer_id }))))
}

pub async fn resume_broadcaster_consumer(
    State(state): State<AppState>,
    _origin: RequireOrigin,
    Path((room_id, peer_id, consumer_id)): Path<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
    let room = resolve_room(&state, &room_id)?;
    let consumer_id = ConsumerId::from_str(&consumer_id)
        .map_err(|_| ApiError::bad_request("invalid consumer id"))?;
    room.broadcaster_resume_consumer(&peer_id, consumer_id)
        .await?;
    Ok(StatusCode::OK)
}
