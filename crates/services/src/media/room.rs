use std::collections::HashMap;
use std::num::NonZero;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use confab_config::Settings;
use futures::future::join_all;
use mediasoup::prelude::*;
use mediasoup::router::{
    PipeDataProducerToRouterPair, PipeProducerToRouterPair, PipeToRouterOptions, RouterId,
};
use mediasoup::rtp_observer::RtpObserverAddProducerOptions;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::error::{MediaError, MediaResult};
use crate::signal::messages::{
    JoinData, NewConsumerData, NewDataConsumerData, PeerVolume, ProduceData, ProduceDataData,
};
use crate::signal::ServerNotification;

use super::bot::Bot;
use super::broadcaster::Broadcaster;
use super::codecs::media_codecs;
use super::peer::Peer;
use super::types::{
    ConsumerAppData, DataChannel, DataConsumerAppData, DataProducerAppData, MediaSource, PeerId,
    PeerInfo, ProducerAppData, RoomId, TransportDirection,
};
use super::worker_pool::WorkerPool;

/// Lifecycle notifications the room sends to its supervisor. `PeerLeft`
/// prompts the empty-room check on the supervisor's next turn; `RouterClosed`
/// triggers the close cascade; `Closed` asks for removal from the room map.
#[derive(Debug)]
pub(crate) enum RoomEvent {
    PeerLeft(RoomId),
    RouterClosed(RoomId),
    Closed(RoomId),
}

/// One conference room: a pair of routers (identical unless pipe mode is on),
/// the audio observers, the participant registries and the fan-out engine.
///
/// The supervisor's room map holds the long-lived strong handle; signaling
/// sessions keep a `WeakRoom` so that removing the map entry releases the
/// routers and everything beneath them.
#[derive(Clone)]
pub struct Room {
    inner: Arc<RoomInner>,
}

#[derive(Clone)]
pub struct WeakRoom {
    inner: Weak<RoomInner>,
}

struct RoomInner {
    id: RoomId,
    created_at: Instant,
    settings: Arc<Settings>,
    consumer_replicas: u32,
    pipe_mode: bool,
    producer_router: Router,
    consumer_router: Router,
    producer_webrtc_server: WebRtcServer,
    consumer_webrtc_server: WebRtcServer,
    audio_level_observer: AudioLevelObserver,
    active_speaker_observer: ActiveSpeakerObserver,
    bot: Bot,
    closed: AtomicBool,
    state: Mutex<RoomState>,
    events: mpsc::UnboundedSender<RoomEvent>,
}

struct RoomState {
    joining_peers: HashMap<PeerId, Peer>,
    peers: HashMap<PeerId, Peer>,
    joining_broadcasters: HashMap<PeerId, Broadcaster>,
    broadcasters: HashMap<PeerId, Broadcaster>,
    /// Every producer alive in this room with its app metadata, pruned when
    /// the engine reports the producer closed.
    observed_producers: HashMap<ProducerId, ProducerAppData>,
    /// Pipe pairs keeping producer-router streams alive on the consumer
    /// router while pipe mode is on.
    pipe_producers: HashMap<ProducerId, PipeProducerToRouterPair>,
    pipe_data_producers: HashMap<DataProducerId, PipeDataProducerToRouterPair>,
}

impl Room {
    pub(crate) async fn create(
        id: RoomId,
        consumer_replicas: u32,
        pipe_mode: bool,
        pool: &WorkerPool,
        settings: Arc<Settings>,
        events: mpsc::UnboundedSender<RoomEvent>,
    ) -> MediaResult<Room> {
        if pipe_mode && pool.len() < 2 {
            return Err(MediaError::InvalidState(
                "pipe transports require at least two workers".into(),
            ));
        }

        let producer_slot = pool.next_slot();
        let producer_router = producer_slot
            .worker
            .create_router(RouterOptions::new(media_codecs()))
            .await
            .map_err(MediaError::engine)?;
        let producer_webrtc_server = producer_slot.webrtc_server.clone();

        let (consumer_router, consumer_webrtc_server) = if pipe_mode {
            let consumer_slot = pool.next_slot();
            let router = consumer_slot
                .worker
                .create_router(RouterOptions::new(media_codecs()))
                .await
                .map_err(MediaError::engine)?;
            (router, consumer_slot.webrtc_server.clone())
        } else {
            (producer_router.clone(), producer_webrtc_server.clone())
        };

        // Observers live on the producer router; capabilities are always
        // surfaced from the consumer router.
        let mut audio_level_options = AudioLevelObserverOptions::default();
        audio_level_options.max_entries = NonZero::new(16).unwrap();
        audio_level_options.threshold = -80;
        audio_level_options.interval = 800;
        let audio_level_observer = producer_router
            .create_audio_level_observer(audio_level_options)
            .await
            .map_err(MediaError::engine)?;

        let mut active_speaker_options = ActiveSpeakerObserverOptions::default();
        active_speaker_options.interval = 300;
        let active_speaker_observer = producer_router
            .create_active_speaker_observer(active_speaker_options)
            .await
            .map_err(MediaError::engine)?;

        let bot = Bot::new(&consumer_router).await?;

        let room = Room {
            inner: Arc::new(RoomInner {
                id: id.clone(),
                created_at: Instant::now(),
                settings,
                consumer_replicas,
                pipe_mode,
                producer_router,
                consumer_router,
                producer_webrtc_server,
                consumer_webrtc_server,
                audio_level_observer,
                active_speaker_observer,
                bot,
                closed: AtomicBool::new(false),
                state: Mutex::new(RoomState {
                    joining_peers: HashMap::new(),
                    peers: HashMap::new(),
                    joining_broadcasters: HashMap::new(),
                    broadcasters: HashMap::new(),
                    observed_producers: HashMap::new(),
                    pipe_producers: HashMap::new(),
                    pipe_data_producers: HashMap::new(),
                }),
                events,
            }),
        };

        room.wire_rtp_observers();
        room.wire_router_close();

        info!(room_id = %id, pipe_mode, consumer_replicas, "room created");
        Ok(room)
    }

    pub fn id(&self) -> &RoomId {
        &self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn pipe_mode(&self) -> bool {
        self.inner.pipe_mode
    }

    pub fn downgrade(&self) -> WeakRoom {
        WeakRoom {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Identity check for scheduler tests.
    pub fn same(&self, other: &Room) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Capabilities clients negotiate against. In pipe mode consumers
    /// negotiate with the consumer router, never the producer one.
    pub fn router_rtp_capabilities(&self) -> Value {
        serde_json::to_value(self.inner.consumer_router.rtp_capabilities())
            .unwrap_or(Value::Null)
    }

    pub fn producer_router_id(&self) -> RouterId {
        self.inner.producer_router.id()
    }

    pub fn consumer_router_id(&self) -> RouterId {
        self.inner.consumer_router.id()
    }

    // ---- interactive peer admission & lifecycle -------------------------

    /// Admits a freshly attached peer into the joining registry, superseding
    /// any participant already using the same id, and arms its join timer.
    pub fn add_peer(&self, peer: Peer) -> MediaResult<()> {
        if self.is_closed() {
            return Err(MediaError::InvalidState("room is closed".into()));
        }

        let superseded = {
            let mut state = self.inner.state.lock();
            let existing = remove_any_participant(&mut state, peer.id());
            state.joining_peers.insert(peer.id().clone(), peer.clone());
            existing
        };
        if let Some(superseded) = superseded {
            debug!(room_id = %self.inner.id, peer_id = %peer.id(), "superseding existing participant");
            superseded.close(self);
        }

        let timeout = Duration::from_secs(self.inner.settings.room.join_timeout_secs);
        let weak_room = self.downgrade();
        let timer_peer = peer.clone();
        peer.store_join_timer(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(room) = weak_room.upgrade() {
                room.expire_join(&timer_peer);
            }
        }));
        Ok(())
    }

    /// Join-timer expiry: the peer never joined, so it is closed without any
    /// room-level broadcast.
    fn expire_join(&self, peer: &Peer) {
        let removed = {
            let mut state = self.inner.state.lock();
            match state.joining_peers.get(peer.id()) {
                Some(current) if current.same(peer) => {
                    state.joining_peers.remove(peer.id());
                    true
                }
                _ => false,
            }
        };
        if removed {
            debug!(room_id = %self.inner.id, peer_id = %peer.id(), "join timeout, closing peer");
            peer.close();
            let _ = self.inner.events.send(RoomEvent::PeerLeft(self.inner.id.clone()));
        }
    }

    /// Promotes a joining peer. Returns the snapshot of everyone already
    /// joined, which the caller sends as the join response before starting
    /// the fan-out.
    pub fn join_peer(&self, peer: &Peer, data: JoinData) -> MediaResult<Vec<PeerInfo>> {
        if self.is_closed() {
            return Err(MediaError::InvalidState("room is closed".into()));
        }

        {
            let mut state = self.inner.state.lock();
            match state.joining_peers.get(peer.id()) {
                Some(current) if current.same(peer) => {
                    state.joining_peers.remove(peer.id());
                }
                _ => {
                    return Err(MediaError::InvalidState(
                        "peer is not in the joining state".into(),
                    ));
                }
            }
        }

        if let Err(err) = peer.join(
            data.display_name,
            data.device,
            data.rtp_capabilities,
            data.sctp_capabilities,
        ) {
            let mut state = self.inner.state.lock();
            state.joining_peers.insert(peer.id().clone(), peer.clone());
            return Err(err);
        }

        let mut state = self.inner.state.lock();
        state.peers.insert(peer.id().clone(), peer.clone());
        let snapshot = state
            .peers
            .values()
            .filter(|other| !other.same(peer))
            .map(Peer::info)
            .chain(state.broadcasters.values().map(Broadcaster::info))
            .collect();
        Ok(snapshot)
    }

    /// Runs after the join response went out: announces the new peer and
    /// synthesizes consumers for everything already live in the room.
    pub async fn after_peer_join(&self, peer: &Peer) {
        self.notify_joined_except(peer.id(), &ServerNotification::NewPeer(peer.info()));

        let (other_peers, broadcasters) = {
            let state = self.inner.state.lock();
            (
                state
                    .peers
                    .values()
                    .filter(|other| !other.same(peer))
                    .cloned()
                    .collect::<Vec<_>>(),
                state.broadcasters.values().cloned().collect::<Vec<_>>(),
            )
        };

        // Media producers of every other participant.
        let mut producers = Vec::new();
        for other in &other_peers {
            producers.extend(other.producers());
        }
        for broadcaster in &broadcasters {
            producers.extend(broadcaster.producers());
        }
        join_all(
            producers
                .iter()
                .map(|producer| self.create_consumers_for(peer, producer)),
        )
        .await;

        // Chat data producers of every other peer.
        let mut data_producers = Vec::new();
        for other in &other_peers {
            for data_producer in other.data_producers() {
                if data_producer_app_data(&data_producer).channel == DataChannel::Chat {
                    data_producers.push((other.id().clone(), data_producer));
                }
            }
        }
        join_all(data_producers.iter().map(|(owner, data_producer)| {
            self.create_data_consumer_for(peer, data_producer, Some(owner.clone()))
        }))
        .await;

        // And finally the bot stream.
        self.create_data_consumer_for(peer, self.inner.bot.data_producer(), None)
            .await;
    }

    /// Detaches a peer. The engine-side release happens first, then the
    /// room-level broadcast (for peers that had been visible), then the
    /// liveness check on the supervisor's next turn.
    pub fn remove_peer(&self, peer: &Peer) {
        let was_joined = {
            let mut state = self.inner.state.lock();
            match state.joining_peers.get(peer.id()) {
                Some(current) if current.same(peer) => {
                    state.joining_peers.remove(peer.id());
                    Some(false)
                }
                _ => match state.peers.get(peer.id()) {
                    Some(current) if current.same(peer) => {
                        state.peers.remove(peer.id());
                        Some(true)
                    }
                    _ => None,
                },
            }
        };
        let Some(was_joined) = was_joined else {
            peer.close();
            return;
        };

        peer.close();
        if was_joined {
            self.notify_joined(&ServerNotification::PeerClosed {
                peer_id: peer.id().clone(),
            });
        }
        let _ = self
            .inner
            .events
            .send(RoomEvent::PeerLeft(self.inner.id.clone()));
    }

    pub fn change_display_name(&self, peer: &Peer, display_name: String) {
        if !peer.is_joined() {
            return;
        }
        let old_display_name = peer.set_display_name(display_name.clone());
        self.notify_joined_except(
            peer.id(),
            &ServerNotification::PeerDisplayNameChanged {
                peer_id: peer.id().clone(),
                display_name,
                old_display_name,
            },
        );
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<Peer> {
        let state = self.inner.state.lock();
        state
            .peers
            .get(peer_id)
            .or_else(|| state.joining_peers.get(peer_id))
            .cloned()
    }

    pub fn joined_peer_count(&self) -> usize {
        self.inner.state.lock().peers.len()
    }

    // ---- peer transport & producer operations ---------------------------

    /// Creates a WebRTC transport for the given direction. Send transports
    /// live on the producer router, receive transports on the consumer
    /// router, each anchored to its slot's WebRTC server.
    pub async fn create_webrtc_transport(
        &self,
        peer: &Peer,
        direction: TransportDirection,
        force_tcp: bool,
        sctp_capabilities: Option<&super::types::SctpCapabilities>,
    ) -> MediaResult<Value> {
        let (router, webrtc_server) = match direction {
            TransportDirection::Send => (
                &self.inner.producer_router,
                &self.inner.producer_webrtc_server,
            ),
            TransportDirection::Recv => (
                &self.inner.consumer_router,
                &self.inner.consumer_webrtc_server,
            ),
        };

        let transport_settings = &self.inner.settings.webrtc_transport;
        let mut options = WebRtcTransportOptions::new_with_server(webrtc_server.clone());
        options.enable_udp = !force_tcp;
        options.enable_tcp = true;
        options.prefer_udp = true;
        options.initial_available_outgoing_bitrate =
            transport_settings.initial_available_outgoing_bitrate;
        if let Some(caps) = sctp_capabilities {
            options.enable_sctp = true;
            options.num_sctp_streams = caps.num_streams;
            options.max_sctp_message_size = transport_settings.max_sctp_message_size;
        }

        let transport = router
            .create_webrtc_transport(options)
            .await
            .map_err(MediaError::engine)?;

        if transport_settings.max_incoming_bitrate > 0 {
            let _ = transport
                .set_max_incoming_bitrate(transport_settings.max_incoming_bitrate)
                .await;
        }

        self.wire_transport_watchers(peer, &transport, direction);
        peer.add_transport(transport.clone(), direction);

        Ok(serde_json::json!({
            "id": transport.id(),
            "iceParameters": transport.ice_parameters(),
            "iceCandidates": transport.ice_candidates(),
            "dtlsParameters": transport.dtls_parameters(),
            "sctpParameters": transport.sctp_parameters(),
        }))
    }

    /// A failed or closed consumer-direction transport is fatal for the
    /// peer, as is a dead producer-direction DTLS session.
    fn wire_transport_watchers(
        &self,
        peer: &Peer,
        transport: &WebRtcTransport,
        direction: TransportDirection,
    ) {
        let transport_id = transport.id();

        {
            let weak_peer = peer.downgrade();
            transport
                .on_close(Box::new(move || {
                    if let Some(peer) = weak_peer.upgrade() {
                        peer.remove_transport(&transport_id);
                    }
                }))
                .detach();
        }

        if direction == TransportDirection::Recv {
            let weak_room = self.downgrade();
            let weak_peer = peer.downgrade();
            transport
                .on_ice_state_change(move |ice_state| {
                    if matches!(ice_state, IceState::Disconnected | IceState::Closed) {
                        let (Some(room), Some(peer)) = (weak_room.upgrade(), weak_peer.upgrade())
                        else {
                            return;
                        };
                        warn!(peer_id = %peer.id(), ?ice_state, "receive transport ICE failed, closing peer");
                        room.remove_peer(&peer);
                    }
                })
                .detach();
        }

        let weak_room = self.downgrade();
        let weak_peer = peer.downgrade();
        transport
            .on_dtls_state_change(move |dtls_state| {
                if matches!(dtls_state, DtlsState::Failed | DtlsState::Closed) {
                    let (Some(room), Some(peer)) = (weak_room.upgrade(), weak_peer.upgrade())
                    else {
                        return;
                    };
                    warn!(peer_id = %peer.id(), ?dtls_state, ?direction, "transport DTLS failed, closing peer");
                    room.remove_peer(&peer);
                }
            })
            .detach();
    }

    pub async fn connect_webrtc_transport(
        &self,
        peer: &Peer,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> MediaResult<()> {
        let entry = peer
            .transport(&transport_id)
            .ok_or_else(|| MediaError::not_found("transport", transport_id.to_string()))?;
        entry
            .transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(MediaError::engine)
    }

    pub async fn restart_ice(&self, peer: &Peer, transport_id: TransportId) -> MediaResult<Value> {
        let entry = peer
            .transport(&transport_id)
            .ok_or_else(|| MediaError::not_found("transport", transport_id.to_string()))?;
        let ice_parameters = entry
            .transport
            .restart_ice()
            .await
            .map_err(MediaError::engine)?;
        Ok(serde_json::json!({ "iceParameters": ice_parameters }))
    }

    /// Creates a producer for a joined peer and fans it out to the rest of
    /// the room in the background.
    pub async fn produce(&self, peer: &Peer, data: ProduceData) -> MediaResult<ProducerId> {
        if !peer.is_joined() {
            return Err(MediaError::InvalidState(
                "peer must join before producing".into(),
            ));
        }
        let entry = peer
            .transport(&data.transport_id)
            .ok_or_else(|| MediaError::not_found("transport", data.transport_id.to_string()))?;

        let mut options = ProducerOptions::new(data.kind, data.rtp_parameters);
        options.app_data = AppData::new(ProducerAppData {
            peer_id: peer.id().clone(),
            source: data.app_data.source,
        });
        let producer = entry
            .transport
            .produce(options)
            .await
            .map_err(MediaError::engine)?;
        peer.add_producer(producer.clone());

        {
            let channel = peer.channel().clone();
            let producer_id = producer.id();
            producer
                .on_score(move |score| {
                    channel.notify(&ServerNotification::ProducerScore {
                        producer_id,
                        score: score.to_vec(),
                    });
                })
                .detach();
        }
        {
            let weak_peer = peer.downgrade();
            let producer_id = producer.id();
            producer
                .on_transport_close(move || {
                    if let Some(peer) = weak_peer.upgrade() {
                        peer.remove_producer(&producer_id);
                    }
                })
                .detach();
        }

        let producer_id = producer.id();
        self.spawn_producer_fanout(peer.id().clone(), producer);
        Ok(producer_id)
    }

    /// Creates a data producer for a joined peer. Chat streams fan out to
    /// every other peer; bot streams are consumed by the room bot.
    pub async fn produce_data(
        &self,
        peer: &Peer,
        data: ProduceDataData,
    ) -> MediaResult<DataProducerId> {
        if !peer.is_joined() {
            return Err(MediaError::InvalidState(
                "peer must join before producing".into(),
            ));
        }
        let entry = peer
            .transport(&data.transport_id)
            .ok_or_else(|| MediaError::not_found("transport", data.transport_id.to_string()))?;

        let channel = data.app_data.channel;
        let mut options = DataProducerOptions::new_sctp(data.sctp_stream_parameters);
        options.label = data.label;
        options.protocol = data.protocol;
        options.app_data = AppData::new(DataProducerAppData {
            peer_id: Some(peer.id().clone()),
            channel,
        });
        let data_producer = entry
            .transport
            .produce_data(options)
            .await
            .map_err(MediaError::engine)?;
        peer.add_data_producer(data_producer.clone());

        {
            let weak_peer = peer.downgrade();
            let data_producer_id = data_producer.id();
            data_producer
                .on_transport_close(move || {
                    if let Some(peer) = weak_peer.upgrade() {
                        peer.remove_data_producer(&data_producer_id);
                    }
                })
                .detach();
        }

        let data_producer_id = data_producer.id();
        let room = self.clone();
        let source_peer = peer.clone();
        tokio::spawn(async move {
            room.fan_out_data_producer(&source_peer, data_producer, channel)
                .await;
        });
        Ok(data_producer_id)
    }

    pub fn close_peer_producer(&self, peer: &Peer, producer_id: &ProducerId) {
        if let Some(producer) = peer.remove_producer(producer_id) {
            drop(producer);
        }
    }

    // ---- broadcaster operations -----------------------------------------

    pub fn create_broadcaster(
        &self,
        id: PeerId,
        display_name: String,
        device: Value,
    ) -> MediaResult<Vec<PeerInfo>> {
        if self.is_closed() {
            return Err(MediaError::InvalidState("room is closed".into()));
        }
        let mut state = self.inner.state.lock();
        if state.joining_peers.contains_key(&id)
            || state.peers.contains_key(&id)
            || state.joining_broadcasters.contains_key(&id)
            || state.broadcasters.contains_key(&id)
        {
            return Err(MediaError::InvalidState(format!(
                "participant with id \"{id}\" already exists"
            )));
        }
        let broadcaster = Broadcaster::new(id.clone(), display_name, device);
        state.joining_broadcasters.insert(id, broadcaster);
        Ok(state
            .peers
            .values()
            .map(Peer::info)
            .chain(state.broadcasters.values().map(Broadcaster::info))
            .collect())
    }

    pub fn join_broadcaster(&self, id: &PeerId) -> MediaResult<()> {
        let broadcaster = {
            let mut state = self.inner.state.lock();
            if state.broadcasters.contains_key(id) {
                return Err(MediaError::InvalidState(
                    "broadcaster already joined".into(),
                ));
            }
            state
                .joining_broadcasters
                .remove(id)
                .ok_or_else(|| MediaError::not_found("broadcaster", id.clone()))?
        };
        broadcaster.join()?;
        self.inner
            .state
            .lock()
            .broadcasters
            .insert(id.clone(), broadcaster);
        Ok(())
    }

    pub fn remove_broadcaster(&self, id: &PeerId) -> MediaResult<()> {
        let broadcaster = {
            let mut state = self.inner.state.lock();
            state
                .joining_broadcasters
                .remove(id)
                .or_else(|| state.broadcasters.remove(id))
                .ok_or_else(|| MediaError::not_found("broadcaster", id.clone()))?
        };
        broadcaster.close();
        Ok(())
    }

    pub fn broadcaster(&self, id: &PeerId) -> MediaResult<Broadcaster> {
        let state = self.inner.state.lock();
        state
            .broadcasters
            .get(id)
            .or_else(|| state.joining_broadcasters.get(id))
            .cloned()
            .ok_or_else(|| MediaError::not_found("broadcaster", id.clone()))
    }

    /// Creates a plain transport for a broadcaster. Send transports live on
    /// the producer router, receive transports on the consumer router.
    pub async fn broadcaster_create_transport(
        &self,
        id: &PeerId,
        direction: TransportDirection,
        comedia: bool,
        rtcp_mux: bool,
    ) -> MediaResult<PlainTransport> {
        let broadcaster = self.broadcaster(id)?;
        let router = match direction {
            TransportDirection::Send => &self.inner.producer_router,
            TransportDirection::Recv => &self.inner.consumer_router,
        };

        let plain_settings = &self.inner.settings.plain_transport;
        let listen_ip = plain_settings
            .listen_ip
            .parse()
            .unwrap_or_else(|_| "0.0.0.0".parse().unwrap());
        let announced_address = if plain_settings.announced_ip.is_empty() {
            None
        } else {
            Some(plain_settings.announced_ip.clone())
        };

        let mut options = PlainTransportOptions::new(ListenInfo {
            protocol: Protocol::Udp,
            ip: listen_ip,
            announced_address,
            port: None,
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        });
        options.comedia = comedia;
        options.rtcp_mux = rtcp_mux;

        let transport = router
            .create_plain_transport(options)
            .await
            .map_err(MediaError::engine)?;
        broadcaster.add_transport(transport.clone(), direction);
        Ok(transport)
    }

    pub async fn broadcaster_connect_transport(
        &self,
        id: &PeerId,
        transport_id: TransportId,
        remote: PlainTransportRemoteParameters,
    ) -> MediaResult<()> {
        let broadcaster = self.broadcaster(id)?;
        let entry = broadcaster
            .transport(&transport_id)
            .ok_or_else(|| MediaError::not_found("transport", transport_id.to_string()))?;
        entry
            .transport
            .connect(remote)
            .await
            .map_err(MediaError::engine)
    }

    /// Broadcaster-side produce: fans out to every joined peer.
    pub async fn broadcaster_produce(
        &self,
        id: &PeerId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        source: MediaSource,
    ) -> MediaResult<ProducerId> {
        let broadcaster = self.broadcaster(id)?;
        if !broadcaster.is_joined() {
            return Err(MediaError::InvalidState(
                "broadcaster must join before producing".into(),
            ));
        }
        let entry = broadcaster
            .transport(&transport_id)
            .ok_or_else(|| MediaError::not_found("transport", transport_id.to_string()))?;

        let mut options = ProducerOptions::new(kind, rtp_parameters);
        options.app_data = AppData::new(ProducerAppData {
            peer_id: id.clone(),
            source,
        });
        let producer = entry
            .transport
            .produce(options)
            .await
            .map_err(MediaError::engine)?;
        broadcaster.add_producer(producer.clone());

        {
            let weak_broadcaster = broadcaster.downgrade();
            let producer_id = producer.id();
            producer
                .on_transport_close(move || {
                    if let Some(broadcaster) = weak_broadcaster.upgrade() {
                        broadcaster.remove_producer(&producer_id);
                    }
                })
                .detach();
        }

        let producer_id = producer.id();
        self.spawn_producer_fanout(id.clone(), producer);
        Ok(producer_id)
    }

    pub async fn broadcaster_consume(
        &self,
        id: &PeerId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> MediaResult<ConsumerId> {
        let broadcaster = self.broadcaster(id)?;
        {
            let state = self.inner.state.lock();
            if !state.observed_producers.contains_key(&producer_id) {
                return Err(MediaError::not_found("producer", producer_id.to_string()));
            }
        }
        if !self
            .inner
            .consumer_router
            .can_consume(&producer_id, &rtp_capabilities)
        {
            return Err(MediaError::Unsupported(
                "cannot consume this producer with the given capabilities".into(),
            ));
        }
        let entry = broadcaster
            .transport(&transport_id)
            .ok_or_else(|| MediaError::not_found("transport", transport_id.to_string()))?;

        let mut options = ConsumerOptions::new(producer_id, rtp_capabilities);
        options.paused = paused;
        let consumer = entry
            .transport
            .consume(options)
            .await
            .map_err(MediaError::engine)?;
        let consumer_id = consumer.id();
        broadcaster.add_consumer(consumer);
        Ok(consumer_id)
    }

    pub async fn broadcaster_resume_consumer(
        &self,
        id: &PeerId,
        consumer_id: ConsumerId,
    ) -> MediaResult<()> {
        let broadcaster = self.broadcaster(id)?;
        let consumer = broadcaster
            .consumer(&consumer_id)
            .ok_or_else(|| MediaError::not_found("consumer", consumer_id.to_string()))?;
        consumer.resume().await.map_err(MediaError::engine)
    }

    // ---- fan-out engine --------------------------------------------------

    /// Background continuation of a produce call: registers the producer with
    /// the room observers, pipes it in pipe mode, then synthesizes consumers
    /// on every other joined peer. Per-target failures never fail the whole
    /// fan-out.
    fn spawn_producer_fanout(&self, source_peer_id: PeerId, producer: Producer) {
        // Registered before the produce response goes out so an immediate
        // consume call can already see the producer.
        self.register_observed_producer(&producer);

        let room = self.clone();
        tokio::spawn(async move {
            room.register_audio_producer(&producer).await;

            if room.inner.pipe_mode {
                if let Err(err) = room.pipe_producer_to_consumer_router(producer.id()).await {
                    warn!(
                        room_id = %room.inner.id,
                        producer_id = %producer.id(),
                        %err,
                        "failed to pipe producer, skipping fan-out"
                    );
                    return;
                }
            }

            let targets: Vec<Peer> = {
                let state = room.inner.state.lock();
                state
                    .peers
                    .values()
                    .filter(|peer| peer.id() != &source_peer_id)
                    .cloned()
                    .collect()
            };
            join_all(
                targets
                    .iter()
                    .map(|target| room.create_consumers_for(target, &producer)),
            )
            .await;
        });
    }

    async fn fan_out_data_producer(
        &self,
        source_peer: &Peer,
        data_producer: DataProducer,
        channel: DataChannel,
    ) {
        if self.inner.pipe_mode {
            if let Err(err) = self
                .pipe_data_producer_to_consumer_router(data_producer.id())
                .await
            {
                warn!(
                    room_id = %self.inner.id,
                    data_producer_id = %data_producer.id(),
                    %err,
                    "failed to pipe data producer, skipping fan-out"
                );
                return;
            }
        }

        match channel {
            DataChannel::Chat => {
                let targets: Vec<Peer> = {
                    let state = self.inner.state.lock();
                    state
                        .peers
                        .values()
                        .filter(|peer| !peer.same(source_peer))
                        .cloned()
                        .collect()
                };
                join_all(targets.iter().map(|target| {
                    self.create_data_consumer_for(
                        target,
                        &data_producer,
                        Some(source_peer.id().clone()),
                    )
                }))
                .await;
            }
            DataChannel::Bot => {
                if let Err(err) = self
                    .inner
                    .bot
                    .handle_peer_data_producer(data_producer.id(), source_peer)
                    .await
                {
                    warn!(
                        room_id = %self.inner.id,
                        data_producer_id = %data_producer.id(),
                        %err,
                        "bot failed to consume data producer"
                    );
                }
            }
        }
    }

    /// Creates `1 + consumer_replicas` consumers of `producer` on the target
    /// peer, skipping silently when the target has no receive transport or
    /// its capabilities reject the stream.
    async fn create_consumers_for(&self, target: &Peer, producer: &Producer) {
        let Some(transport) = target.consumer_transport() else {
            return;
        };
        let Some(rtp_capabilities) = target.rtp_capabilities() else {
            return;
        };
        if !self
            .inner
            .consumer_router
            .can_consume(&producer.id(), &rtp_capabilities)
        {
            return;
        }

        let copies = 1 + self.inner.consumer_replicas;
        join_all((0..copies).map(|_| async {
            if let Err(err) = self
                .create_one_consumer(target, producer, &transport, &rtp_capabilities)
                .await
            {
                warn!(
                    room_id = %self.inner.id,
                    peer_id = %target.id(),
                    producer_id = %producer.id(),
                    %err,
                    "consumer creation failed"
                );
            }
        }))
        .await;
    }

    /// The delicate part: the consumer is created paused and only resumed
    /// after the client acknowledged `newConsumer`. Resuming earlier drops
    /// the first RTP window on the client side.
    async fn create_one_consumer(
        &self,
        target: &Peer,
        producer: &Producer,
        transport: &WebRtcTransport,
        rtp_capabilities: &RtpCapabilities,
    ) -> MediaResult<()> {
        let producer_app = producer_app_data(producer);

        let mut options = ConsumerOptions::new(producer.id(), rtp_capabilities.clone());
        options.paused = true;
        options.enable_rtx = Some(true);
        options.ignore_dtx = true;
        options.app_data = AppData::new(ConsumerAppData {
            peer_id: producer_app.peer_id.clone(),
            source: producer_app.source,
        });

        let consumer = transport
            .consume(options)
            .await
            .map_err(MediaError::engine)?;
        target.add_consumer(consumer.clone());
        self.wire_consumer_observers(target, &consumer);

        let payload = NewConsumerData {
            peer_id: producer_app.peer_id.clone(),
            producer_id: producer.id(),
            id: consumer.id(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters().clone(),
            r#type: consumer.r#type(),
            app_data: ConsumerAppData {
                peer_id: producer_app.peer_id,
                source: producer_app.source,
            },
            producer_paused: consumer.producer_paused(),
        };
        let payload = serde_json::to_value(payload).map_err(MediaError::engine)?;

        match target.channel().request("newConsumer", payload).await {
            Ok(_) => {
                consumer.resume().await.map_err(MediaError::engine)?;
                target.notify(&ServerNotification::ConsumerScore {
                    consumer_id: consumer.id(),
                    score: consumer.score(),
                });
                Ok(())
            }
            Err(err) => {
                // Leave the engine consumer paused; the close chain reclaims
                // it when the transport or the peer goes away.
                Err(MediaError::engine(format!(
                    "newConsumer not acknowledged: {err}"
                )))
            }
        }
    }

    fn wire_consumer_observers(&self, target: &Peer, consumer: &Consumer) {
        let consumer_id = consumer.id();

        {
            let weak_peer = target.downgrade();
            consumer
                .on_transport_close(move || {
                    if let Some(peer) = weak_peer.upgrade() {
                        peer.remove_consumer(&consumer_id);
                    }
                })
                .detach();
        }
        {
            let weak_peer = target.downgrade();
            let channel = target.channel().clone();
            consumer
                .on_producer_close(move || {
                    if let Some(peer) = weak_peer.upgrade() {
                        peer.remove_consumer(&consumer_id);
                    }
                    channel.notify(&ServerNotification::ConsumerClosed { consumer_id });
                })
                .detach();
        }
        {
            let channel = target.channel().clone();
            consumer
                .on_producer_pause(move || {
                    channel.notify(&ServerNotification::ConsumerPaused { consumer_id });
                })
                .detach();
        }
        {
            let channel = target.channel().clone();
            consumer
                .on_producer_resume(move || {
                    channel.notify(&ServerNotification::ConsumerResumed { consumer_id });
                })
                .detach();
        }
        {
            let channel = target.channel().clone();
            consumer
                .on_score(move |score| {
                    channel.notify(&ServerNotification::ConsumerScore {
                        consumer_id,
                        score: score.clone(),
                    });
                })
                .detach();
        }
        {
            let channel = target.channel().clone();
            consumer
                .on_layers_change(move |layers| {
                    let layers = layers.clone();
                    channel.notify(&ServerNotification::ConsumerLayersChanged {
                        consumer_id,
                        spatial_layer: layers.map(|l| l.spatial_layer),
                        temporal_layer: layers.and_then(|l| l.temporal_layer),
                    });
                })
                .detach();
        }
    }

    /// Data consumers have no pause/resume step; the target just needs SCTP
    /// capabilities and a receive transport.
    async fn create_data_consumer_for(
        &self,
        target: &Peer,
        data_producer: &DataProducer,
        from_peer_id: Option<PeerId>,
    ) {
        if let Err(err) = self
            .create_one_data_consumer(target, data_producer, from_peer_id)
            .await
        {
            warn!(
                room_id = %self.inner.id,
                peer_id = %target.id(),
                data_producer_id = %data_producer.id(),
                %err,
                "data consumer creation failed"
            );
        }
    }

    async fn create_one_data_consumer(
        &self,
        target: &Peer,
        data_producer: &DataProducer,
        from_peer_id: Option<PeerId>,
    ) -> MediaResult<()> {
        if target.sctp_capabilities().is_none() {
            return Ok(());
        }
        let Some(transport) = target.consumer_transport() else {
            return Ok(());
        };

        let app = data_producer_app_data(data_producer);
        let mut options = DataConsumerOptions::new_sctp(data_producer.id());
        options.app_data = AppData::new(DataConsumerAppData {
            peer_id: from_peer_id.clone(),
            channel: app.channel,
        });
        let data_consumer = transport
            .consume_data(options)
            .await
            .map_err(MediaError::engine)?;
        target.add_data_consumer(data_consumer.clone());

        let data_consumer_id = data_consumer.id();
        {
            let weak_peer = target.downgrade();
            let channel = target.channel().clone();
            data_consumer
                .on_data_producer_close(move || {
                    if let Some(peer) = weak_peer.upgrade() {
                        peer.remove_data_consumer(&data_consumer_id);
                    }
                    channel.notify(&ServerNotification::DataConsumerClosed { data_consumer_id });
                })
                .detach();
        }
        {
            let weak_peer = target.downgrade();
            data_consumer
                .on_close(move || {
                    if let Some(peer) = weak_peer.upgrade() {
                        peer.remove_data_consumer(&data_consumer_id);
                    }
                })
                .detach();
        }

        let payload = NewDataConsumerData {
            peer_id: from_peer_id,
            data_producer_id: data_producer.id(),
            id: data_consumer.id(),
            sctp_stream_parameters: data_consumer.sctp_stream_parameters(),
            label: data_consumer.label().clone(),
            protocol: data_consumer.protocol().clone(),
            app_data: DataConsumerAppData {
                peer_id: None,
                channel: app.channel,
            },
        };
        let payload = serde_json::to_value(payload).map_err(MediaError::engine)?;

        target
            .channel()
            .request("newDataConsumer", payload)
            .await
            .map_err(|err| MediaError::engine(format!("newDataConsumer not acknowledged: {err}")))?;
        Ok(())
    }

    // ---- piping (pipe mode only) ----------------------------------------

    async fn pipe_producer_to_consumer_router(&self, producer_id: ProducerId) -> MediaResult<()> {
        let pair = self
            .inner
            .producer_router
            .pipe_producer_to_router(
                producer_id,
                PipeToRouterOptions::new(self.inner.consumer_router.clone()),
            )
            .await
            .map_err(MediaError::engine)?;

        {
            let weak_room = self.downgrade();
            pair.pipe_consumer
                .on_producer_close(move || {
                    if let Some(room) = weak_room.upgrade() {
                        room.inner.state.lock().pipe_producers.remove(&producer_id);
                    }
                })
                .detach();
        }
        self.inner
            .state
            .lock()
            .pipe_producers
            .insert(producer_id, pair);
        trace!(room_id = %self.inner.id, %producer_id, "producer piped to consumer router");
        Ok(())
    }

    async fn pipe_data_producer_to_consumer_router(
        &self,
        data_producer_id: DataProducerId,
    ) -> MediaResult<()> {
        let pair = self
            .inner
            .producer_router
            .pipe_data_producer_to_router(
                data_producer_id,
                PipeToRouterOptions::new(self.inner.consumer_router.clone()),
            )
            .await
            .map_err(MediaError::engine)?;

        {
            let weak_room = self.downgrade();
            pair.pipe_data_consumer
                .on_data_producer_close(move || {
                    if let Some(room) = weak_room.upgrade() {
                        room.inner
                            .state
                            .lock()
                            .pipe_data_producers
                            .remove(&data_producer_id);
                    }
                })
                .detach();
        }
        self.inner
            .state
            .lock()
            .pipe_data_producers
            .insert(data_producer_id, pair);
        trace!(room_id = %self.inner.id, %data_producer_id, "data producer piped to consumer router");
        Ok(())
    }

    // ---- observers & broadcast ------------------------------------------

    fn register_observed_producer(&self, producer: &Producer) {
        let app = producer_app_data(producer);
        trace!(
            room_id = %self.inner.id,
            producer_id = %producer.id(),
            peer_id = %app.peer_id,
            ?app.source,
            "producer observed"
        );
        self.inner
            .state
            .lock()
            .observed_producers
            .insert(producer.id(), app);

        let weak_room = self.downgrade();
        let producer_id = producer.id();
        producer
            .on_close(move || {
                if let Some(room) = weak_room.upgrade() {
                    room.inner
                        .state
                        .lock()
                        .observed_producers
                        .remove(&producer_id);
                }
            })
            .detach();
    }

    /// Audio producers feed the level and dominant-speaker observers. The
    /// observer layer tolerates duplicates and missing entries, so failures
    /// here are logged and swallowed.
    async fn register_audio_producer(&self, producer: &Producer) {
        if producer.kind() != MediaKind::Audio {
            return;
        }
        if let Err(err) = self
            .inner
            .audio_level_observer
            .add_producer(RtpObserverAddProducerOptions::new(producer.id()))
            .await
        {
            debug!(producer_id = %producer.id(), %err, "audio level observer add failed");
        }
        if let Err(err) = self
            .inner
            .active_speaker_observer
            .add_producer(RtpObserverAddProducerOptions::new(producer.id()))
            .await
        {
            debug!(producer_id = %producer.id(), %err, "active speaker observer add failed");
        }
    }

    fn wire_rtp_observers(&self) {
        {
            let weak_room = self.downgrade();
            self.inner
                .audio_level_observer
                .on_volumes(move |volumes| {
                    let Some(room) = weak_room.upgrade() else {
                        return;
                    };
                    let peer_volumes = {
                        let state = room.inner.state.lock();
                        volumes
                            .iter()
                            .filter_map(|entry| {
                                let app = state.observed_producers.get(&entry.producer.id())?;
                                Some(PeerVolume {
                                    peer_id: app.peer_id.clone(),
                                    volume: entry.volume,
                                })
                            })
                            .collect()
                    };
                    room.notify_joined(&ServerNotification::SpeakingPeers { peer_volumes });
                })
                .detach();
        }
        {
            let weak_room = self.downgrade();
            self.inner
                .audio_level_observer
                .on_silence(move || {
                    let Some(room) = weak_room.upgrade() else {
                        return;
                    };
                    room.notify_joined(&ServerNotification::SpeakingPeers {
                        peer_volumes: Vec::new(),
                    });
                    room.notify_joined(&ServerNotification::ActiveSpeaker { peer_id: None });
                })
                .detach();
        }
        {
            let weak_room = self.downgrade();
            self.inner
                .active_speaker_observer
                .on_dominant_speaker(move |speaker| {
                    let Some(room) = weak_room.upgrade() else {
                        return;
                    };
                    let peer_id = {
                        let state = room.inner.state.lock();
                        state
                            .observed_producers
                            .get(&speaker.producer.id())
                            .map(|app| app.peer_id.clone())
                    };
                    room.notify_joined(&ServerNotification::ActiveSpeaker { peer_id });
                })
                .detach();
        }
    }

    /// Either router closing closes the room, covering worker death and
    /// media-server loss on both sides of the pipe.
    fn wire_router_close(&self) {
        for router in [&self.inner.producer_router, &self.inner.consumer_router] {
            let events = self.inner.events.clone();
            let room_id = self.inner.id.clone();
            router
                .on_close(move || {
                    let _ = events.send(RoomEvent::RouterClosed(room_id));
                })
                .detach();
        }
    }

    fn notify_joined(&self, notification: &ServerNotification) {
        let peers: Vec<Peer> = {
            let state = self.inner.state.lock();
            state.peers.values().cloned().collect()
        };
        for peer in peers {
            peer.notify(notification);
        }
    }

    fn notify_joined_except(&self, except: &PeerId, notification: &ServerNotification) {
        let peers: Vec<Peer> = {
            let state = self.inner.state.lock();
            state
                .peers
                .values()
                .filter(|peer| peer.id() != except)
                .cloned()
                .collect()
        };
        for peer in peers {
            peer.notify(notification);
        }
    }

    // ---- close cascade ---------------------------------------------------

    /// Invoked from the supervisor's turn after a peer left; a room with no
    /// joining or joined interactive peers closes itself.
    pub(crate) fn close_if_empty(&self) {
        let empty = {
            let state = self.inner.state.lock();
            state.joining_peers.is_empty() && state.peers.is_empty()
        };
        if empty {
            self.close();
        }
    }

    /// Terminal transition: closes every participant and asks the supervisor
    /// to drop the map entry, which releases the routers and observers.
    pub(crate) fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            room_id = %self.inner.id,
            lived_secs = self.inner.created_at.elapsed().as_secs(),
            "closing room"
        );

        let (joining, peers, joining_broadcasters, broadcasters, pipes, data_pipes) = {
            let mut state = self.inner.state.lock();
            (
                std::mem::take(&mut state.joining_peers),
                std::mem::take(&mut state.peers),
                std::mem::take(&mut state.joining_broadcasters),
                std::mem::take(&mut state.broadcasters),
                std::mem::take(&mut state.pipe_producers),
                std::mem::take(&mut state.pipe_data_producers),
            )
        };
        for peer in joining.values().chain(peers.values()) {
            peer.close();
        }
        for broadcaster in joining_broadcasters.values().chain(broadcasters.values()) {
            broadcaster.close();
        }
        drop((pipes, data_pipes));

        let _ = self
            .inner
            .events
            .send(RoomEvent::Closed(self.inner.id.clone()));
    }
}

impl WeakRoom {
    pub fn upgrade(&self) -> Option<Room> {
        let inner = self.inner.upgrade()?;
        Some(Room { inner })
    }
}

impl Drop for RoomInner {
    fn drop(&mut self) {
        debug!(room_id = %self.id, "room dropped");
    }
}

/// Participant removal that spans both peer kinds, used for supersession.
enum AnyParticipant {
    Peer(Peer),
    Broadcaster(Broadcaster),
}

impl AnyParticipant {
    fn close(self, room: &Room) {
        match self {
            AnyParticipant::Peer(peer) => {
                let was_joined = peer.is_joined();
                peer.close();
                if was_joined {
                    room.notify_joined(&ServerNotification::PeerClosed {
                        peer_id: peer.id().clone(),
                    });
                }
            }
            AnyParticipant::Broadcaster(broadcaster) => broadcaster.close(),
        }
    }
}

fn remove_any_participant(state: &mut RoomState, id: &PeerId) -> Option<AnyParticipant> {
    if let Some(peer) = state.joining_peers.remove(id) {
        return Some(AnyParticipant::Peer(peer));
    }
    if let Some(peer) = state.peers.remove(id) {
        return Some(AnyParticipant::Peer(peer));
    }
    if let Some(broadcaster) = state.joining_broadcasters.remove(id) {
        return Some(AnyParticipant::Broadcaster(broadcaster));
    }
    if let Some(broadcaster) = state.broadcasters.remove(id) {
        return Some(AnyParticipant::Broadcaster(broadcaster));
    }
    None
}

fn producer_app_data(producer: &Producer) -> ProducerAppData {
    producer
        .app_data()
        .downcast_ref::<ProducerAppData>()
        .cloned()
        .unwrap_or(ProducerAppData {
            peer_id: String::new(),
            source: match producer.kind() {
                MediaKind::Audio => MediaSource::Audio,
                MediaKind::Video => MediaSource::Video,
            },
        })
}

fn data_producer_app_data(data_producer: &DataProducer) -> DataProducerAppData {
    data_producer
        .app_data()
        .downcast_ref::<DataProducerAppData>()
        .cloned()
        .unwrap_or(DataProducerAppData {
            peer_id: None,
            channel: DataChannel::Chat,
        })
}
