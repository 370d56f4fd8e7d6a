pub mod error;
pub mod extractors;
pub mod routes;
pub mod state;
pub mod ws;

use axum::{
    Router,
    routing::{delete, get, post},
};
use state::AppState;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Broadcaster flows (under a room)
    let broadcaster_routes = Router::new()
        .route("/", post(routes::rooms::create_broadcaster))
        .route("/{peer_id}", delete(routes::rooms::delete_broadcaster))
        .route("/{peer_id}/join", post(routes::rooms::join_broadcaster))
        .route(
            "/{peer_id}/transports",
            post(routes::rooms::create_broadcaster_transport),
        )
        .route(
            "/{peer_id}/transports/{transport_id}/connect",
            post(routes::rooms::connect_broadcaster_transport),
        )
        .route(
            "/{peer_id}/producers",
            post(routes::rooms::create_broadcaster_producer),
        )
        .route(
            "/{peer_id}/consumers",
            post(routes::rooms::create_broadcaster_consumer),
        )
        .route(
            "/{peer_id}/consumers/{consumer_id}/resume",
            post(routes::rooms::resume_broadcaster_consumer),
        );

    let room_routes = Router::new()
        .route("/{room_id}", get(routes::rooms::get_room))
        .nest("/{room_id}/broadcasters", broadcaster_routes);

    // Health check
    let health = Router::new().route("/health", get(health_check));

    Router::new()
        .nest("/rooms", room_routes)
        .merge(health)
        .route("/ws", get(ws::handler::ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
