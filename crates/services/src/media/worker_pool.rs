use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use confab_config::MediasoupSettings;
use mediasoup::prelude::*;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag, WorkerSettings};
use mediasoup::worker_manager::WorkerManager;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// One engine worker plus the WebRTC server bound to its slot port.
pub struct WorkerSlot {
    pub index: usize,
    pub worker: Worker,
    pub webrtc_server: WebRtcServer,
}

/// Fixed pool of mediasoup workers with a rotating hand-out cursor. Slot `i`
/// listens on `webrtc_server_base_port + i`.
pub struct WorkerPool {
    slots: Vec<WorkerSlot>,
    cursor: AtomicUsize,
}

impl WorkerPool {
    pub async fn new(settings: &MediasoupSettings) -> anyhow::Result<Self> {
        let num_workers = if settings.num_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            settings.num_workers as usize
        };

        let listen_ip: IpAddr = settings
            .listen_ip
            .parse()
            .unwrap_or_else(|_| "0.0.0.0".parse().unwrap());
        let announced_ip = if settings.announced_ip.is_empty() {
            None
        } else {
            Some(settings.announced_ip.clone())
        };

        let worker_manager = WorkerManager::new();
        let mut slots = Vec::with_capacity(num_workers);

        for index in 0..num_workers {
            let mut worker_settings = WorkerSettings::default();
            worker_settings.log_level = parse_log_level(&settings.log_level);
            worker_settings.log_tags = parse_log_tags(&settings.log_tags);
            worker_settings.rtc_port_range = settings.rtc_min_port..=settings.rtc_max_port;

            let worker = worker_manager
                .create_worker(worker_settings)
                .await
                .map_err(|e| anyhow::anyhow!("failed to create mediasoup worker {index}: {e}"))?;

            let port = settings.webrtc_server_base_port + index as u16;
            let webrtc_server = worker
                .create_webrtc_server(WebRtcServerOptions::new(webrtc_server_listen_infos(
                    listen_ip,
                    announced_ip.clone(),
                    port,
                )))
                .await
                .map_err(|e| {
                    anyhow::anyhow!("failed to create WebRTC server on port {port}: {e}")
                })?;

            info!(worker_id = %worker.id(), index, port, "mediasoup worker created");
            slots.push(WorkerSlot {
                index,
                worker,
                webrtc_server,
            });
        }

        Ok(Self {
            slots,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Advances the cursor one slot and returns it, wrapping at the end.
    pub fn next_slot(&self) -> &WorkerSlot {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        &self.slots[idx]
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Reports the index of any worker that dies on the given channel. A
    /// worker death is fatal for the whole server; the supervisor reacts by
    /// closing every room.
    pub fn watch_deaths(&self, deaths: mpsc::UnboundedSender<usize>) {
        for slot in &self.slots {
            let index = slot.index;
            let worker_id = slot.worker.id();
            let deaths = deaths.clone();
            slot.worker
                .on_dead(move |reason| {
                    error!(?reason, %worker_id, index, "mediasoup worker died");
                    let _ = deaths.send(index);
                })
                .detach();
        }
    }
}

fn webrtc_server_listen_infos(
    ip: IpAddr,
    announced_address: Option<String>,
    port: u16,
) -> WebRtcServerListenInfos {
    let udp = ListenInfo {
        protocol: Protocol::Udp,
        ip,
        announced_address: announced_address.clone(),
        port: Some(port),
        port_range: None,
        flags: None,
        send_buffer_size: None,
        recv_buffer_size: None,
        expose_internal_ip: false,
    };
    let tcp = ListenInfo {
        protocol: Protocol::Tcp,
        ip,
        announced_address,
        port: Some(port),
        port_range: None,
        flags: None,
        send_buffer_size: None,
        recv_buffer_size: None,
        expose_internal_ip: false,
    };
    WebRtcServerListenInfos::new(udp).insert(tcp)
}

fn parse_log_level(level: &str) -> WorkerLogLevel {
    match level {
        "debug" => WorkerLogLevel::Debug,
        "warn" => WorkerLogLevel::Warn,
        "error" => WorkerLogLevel::Error,
        "none" => WorkerLogLevel::None,
        other => {
            warn!(level = other, "unknown worker log level, using \"warn\"");
            WorkerLogLevel::Warn
        }
    }
}

fn parse_log_tags(tags: &[String]) -> Vec<WorkerLogTag> {
    tags.iter()
        .filter_map(|tag| match tag.as_str() {
            "info" => Some(WorkerLogTag::Info),
            "ice" => Some(WorkerLogTag::Ice),
            "dtls" => Some(WorkerLogTag::Dtls),
            "rtp" => Some(WorkerLogTag::Rtp),
            "srtp" => Some(WorkerLogTag::Srtp),
            "rtcp" => Some(WorkerLogTag::Rtcp),
            "rtx" => Some(WorkerLogTag::Rtx),
            "bwe" => Some(WorkerLogTag::Bwe),
            "score" => Some(WorkerLogTag::Score),
            "simulcast" => Some(WorkerLogTag::Simulcast),
            "svc" => Some(WorkerLogTag::Svc),
            "sctp" => Some(WorkerLogTag::Sctp),
            "message" => Some(WorkerLogTag::Message),
            other => {
                warn!(tag = other, "unknown worker log tag, skipping");
                None
            }
        })
        .collect()
}
