use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use confab_api::{build_router, state::AppState};
use confab_config::Settings;
use confab_services::RoomManager;
use tokio::net::TcpListener;

/// Each spawned app gets a disjoint port slice so tests can run in parallel
/// without the per-worker WebRTC servers or RTC port ranges colliding.
static APP_SEQ: AtomicU16 = AtomicU16::new(0);

/// A running test application listening on a random local port.
pub struct TestApp {
    pub addr: SocketAddr,
    pub base_url: String,
    pub settings: Settings,
    pub rooms: Arc<RoomManager>,
    pub client: reqwest::Client,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with_settings(|_| {}).await
    }

    /// Spawn a test server with customized settings.
    ///
    /// The `mutator` closure receives a `&mut Settings` after the test
    /// defaults are applied, allowing tests to tweak specific fields (e.g.,
    /// the join timeout or the worker count).
    pub async fn spawn_with_settings(mutator: impl FnOnce(&mut Settings)) -> Self {
        let mut settings = test_settings();
        mutator(&mut settings);

        let app_state = AppState::new(settings.clone())
            .await
            .expect("failed to create AppState");
        let rooms = app_state.rooms.clone();
        let app = build_router(app_state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind to random port");
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        let base_url = format!("http://{addr}");
        let client = reqwest::Client::new();

        Self {
            addr,
            base_url,
            settings,
            rooms,
            client,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET carrying the pinned origin.
    pub fn origin_get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(self.url(path))
            .header("Origin", &self.settings.app.domain)
    }

    pub fn origin_post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(self.url(path))
            .header("Origin", &self.settings.app.domain)
    }

    pub fn origin_delete(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .delete(self.url(path))
            .header("Origin", &self.settings.app.domain)
    }

    pub fn ws_url(&self, query: &str) -> String {
        format!("ws://{}/ws?{}", self.addr, query)
    }
}

pub fn test_settings() -> Settings {
    let seq = APP_SEQ.fetch_add(1, Ordering::Relaxed) % 50;
    let slice = (std::process::id() as u16 % 10) * 50 + seq;

    Settings {
        app: confab_config::AppSettings {
            host: "127.0.0.1".to_string(),
            port: 0,
            domain: "http://localhost:4443".to_string(),
        },
        mediasoup: confab_config::MediasoupSettings {
            num_workers: 1,
            log_level: "error".to_string(),
            log_tags: vec![],
            rtc_min_port: 40000 + slice * 40,
            rtc_max_port: 40000 + slice * 40 + 39,
            listen_ip: "127.0.0.1".to_string(),
            announced_ip: "127.0.0.1".to_string(),
            webrtc_server_base_port: 20000 + slice * 4,
        },
        webrtc_transport: confab_config::WebRtcTransportSettings {
            initial_available_outgoing_bitrate: 1_000_000,
            max_sctp_message_size: 262_144,
            max_incoming_bitrate: 1_500_000,
        },
        plain_transport: confab_config::PlainTransportSettings {
            listen_ip: "127.0.0.1".to_string(),
            announced_ip: "127.0.0.1".to_string(),
        },
        room: confab_config::RoomSettings {
            join_timeout_secs: 10,
        },
        throttle: confab_config::ThrottleSettings {
            secret: Some("test-throttle-secret".to_string()),
        },
    }
}
