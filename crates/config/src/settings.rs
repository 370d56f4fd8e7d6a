use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub app: AppSettings,
    pub mediasoup: MediasoupSettings,
    pub webrtc_transport: WebRtcTransportSettings,
    pub plain_transport: PlainTransportSettings,
    pub room: RoomSettings,
    pub throttle: ThrottleSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppSettings {
    pub host: String,
    pub port: u16,
    /// Expected `Origin` header value on the WebSocket upgrade and on every
    /// broadcaster HTTP request. Requests from any other origin are rejected.
    pub domain: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MediasoupSettings {
    /// Number of mediasoup workers to launch. 0 means one per CPU.
    pub num_workers: u32,
    pub log_level: String,
    pub log_tags: Vec<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub listen_ip: String,
    pub announced_ip: String,
    /// Worker slot `i` gets a WebRTC server listening on `base_port + i`.
    pub webrtc_server_base_port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebRtcTransportSettings {
    pub initial_available_outgoing_bitrate: u32,
    pub max_sctp_message_size: u32,
    /// Applied with `set_max_incoming_bitrate` after transport creation.
    /// 0 disables the cap.
    pub max_incoming_bitrate: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlainTransportSettings {
    pub listen_ip: String,
    pub announced_ip: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoomSettings {
    /// Seconds an attached peer has to send `join` before it is closed.
    pub join_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ThrottleSettings {
    /// Shared secret gating the network-throttle endpoints. Populated from
    /// the NETWORK_THROTTLE_SECRET environment variable; absent means the
    /// throttle surface is disabled.
    pub secret: Option<String>,
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .add_source(File::with_name("config/default").required(false));

        if let Ok(path) = std::env::var("CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&path));
        }

        let config = builder
            .add_source(Environment::default().separator("__").prefix("CONFAB"))
            .set_default("app.host", "0.0.0.0")?
            .set_default("app.port", 4443)?
            .set_default("app.domain", "http://localhost:4443")?
            .set_default("mediasoup.num_workers", 0)?
            .set_default("mediasoup.log_level", "warn")?
            .set_default(
                "mediasoup.log_tags",
                vec!["info", "ice", "dtls", "rtp", "srtp", "rtcp", "sctp"],
            )?
            .set_default("mediasoup.rtc_min_port", 40000)?
            .set_default("mediasoup.rtc_max_port", 49999)?
            .set_default("mediasoup.listen_ip", "0.0.0.0")?
            .set_default("mediasoup.announced_ip", "127.0.0.1")?
            .set_default("mediasoup.webrtc_server_base_port", 44440)?
            .set_default("webrtc_transport.initial_available_outgoing_bitrate", 1_000_000)?
            .set_default("webrtc_transport.max_sctp_message_size", 262_144)?
            .set_default("webrtc_transport.max_incoming_bitrate", 1_500_000)?
            .set_default("plain_transport.listen_ip", "0.0.0.0")?
            .set_default("plain_transport.announced_ip", "127.0.0.1")?
            .set_default("room.join_timeout_secs", 10)?
            .set_default("throttle.secret", None::<String>)?
            .build()?;

        let mut settings: Settings = config.try_deserialize()?;

        // Out-of-band secret wins over file/env-tree configuration.
        if let Ok(secret) = std::env::var("NETWORK_THROTTLE_SECRET")
            && !secret.is_empty()
        {
            settings.throttle.secret = Some(secret);
        }

        Ok(settings)
    }
}
