use std::net::SocketAddr;

use confab_api::{build_router, state::AppState};
use confab_config::Settings;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "confab_api=debug,confab_services=debug,tower_http=debug".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load config
    let settings = Settings::load()?;
    info!(
        "Starting Confab API on {}:{}",
        settings.app.host, settings.app.port
    );

    // Build app state (async: spawns mediasoup workers)
    let app_state = AppState::new(settings.clone()).await?;
    let mut fatal = app_state.rooms.subscribe_fatal();

    // Build router
    let app = build_router(app_state);

    // Start server
    let addr = format!("{}:{}", settings.app.host, settings.app.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );

    tokio::select! {
        result = server => {
            result?;
        }
        _ = fatal.changed() => {
            anyhow::bail!("mediasoup worker died, shutting down");
        }
    }

    Ok(())
}
