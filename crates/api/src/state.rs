use std::sync::Arc;

use confab_config::Settings;
use confab_services::RoomManager;

#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub rooms: Arc<RoomManager>,
}

impl AppState {
    /// Builds app state (async: spawns the mediasoup workers).
    pub async fn new(settings: Settings) -> anyhow::Result<Self> {
        let rooms = Arc::new(RoomManager::new(settings.clone()).await?);
        Ok(Self { settings, rooms })
    }
}
