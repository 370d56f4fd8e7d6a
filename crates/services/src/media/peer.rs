use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use mediasoup::prelude::*;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::{MediaError, MediaResult};
use crate::signal::{PeerChannel, ServerNotification};

use super::types::{PeerId, PeerInfo, SctpCapabilities, TransportDirection};

/// Interactive participant attached through a signaling channel.
///
/// The room owns the only long-lived strong handles; everything else keeps a
/// `WeakPeer` so that dropping the registry entry releases the engine objects
/// in the ledgers.
#[derive(Clone)]
pub struct Peer {
    shared: Arc<Shared>,
}

#[derive(Clone)]
pub struct WeakPeer {
    shared: Weak<Shared>,
}

struct Shared {
    id: PeerId,
    remote_addr: String,
    channel: PeerChannel,
    joined: AtomicBool,
    closed: AtomicBool,
    state: Mutex<State>,
    join_timer: Mutex<Option<JoinHandle<()>>>,
}

struct State {
    display_name: String,
    device: Value,
    rtp_capabilities: Option<RtpCapabilities>,
    sctp_capabilities: Option<SctpCapabilities>,
    transports: HashMap<TransportId, PeerTransport>,
    producers: HashMap<ProducerId, Producer>,
    consumers: HashMap<ConsumerId, Consumer>,
    data_producers: HashMap<DataProducerId, DataProducer>,
    data_consumers: HashMap<DataConsumerId, DataConsumer>,
}

#[derive(Clone)]
pub struct PeerTransport {
    pub transport: WebRtcTransport,
    pub direction: TransportDirection,
}

impl Peer {
    pub fn new(id: PeerId, remote_addr: String, channel: PeerChannel) -> Self {
        trace!(peer_id = %id, %remote_addr, "+peer");
        Self {
            shared: Arc::new(Shared {
                id,
                remote_addr,
                channel,
                joined: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                state: Mutex::new(State {
                    display_name: String::new(),
                    device: Value::Null,
                    rtp_capabilities: None,
                    sctp_capabilities: None,
                    transports: HashMap::new(),
                    producers: HashMap::new(),
                    consumers: HashMap::new(),
                    data_producers: HashMap::new(),
                    data_consumers: HashMap::new(),
                }),
                join_timer: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.shared.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.shared.remote_addr
    }

    pub fn channel(&self) -> &PeerChannel {
        &self.shared.channel
    }

    pub fn notify(&self, notification: &ServerNotification) {
        self.shared.channel.notify(notification);
    }

    pub fn is_joined(&self) -> bool {
        self.shared.joined.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Identity comparison; registries may have been re-populated with a
    /// superseding peer under the same id.
    pub fn same(&self, other: &Peer) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn downgrade(&self) -> WeakPeer {
        WeakPeer {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Promotes the peer to joined, storing what it declared. Rejected if it
    /// already joined on this channel.
    pub fn join(
        &self,
        display_name: String,
        device: Value,
        rtp_capabilities: Option<RtpCapabilities>,
        sctp_capabilities: Option<SctpCapabilities>,
    ) -> MediaResult<()> {
        if self.shared.joined.swap(true, Ordering::SeqCst) {
            return Err(MediaError::InvalidState("peer already joined".into()));
        }
        self.clear_join_timer();
        let mut state = self.shared.state.lock();
        state.display_name = display_name;
        state.device = device;
        state.rtp_capabilities = rtp_capabilities;
        state.sctp_capabilities = sctp_capabilities;
        Ok(())
    }

    pub fn store_join_timer(&self, handle: JoinHandle<()>) {
        let mut timer = self.shared.join_timer.lock();
        if let Some(old) = timer.replace(handle) {
            old.abort();
        }
    }

    fn clear_join_timer(&self) {
        if let Some(timer) = self.shared.join_timer.lock().take() {
            timer.abort();
        }
    }

    pub fn display_name(&self) -> String {
        self.shared.state.lock().display_name.clone()
    }

    /// Returns the previous name.
    pub fn set_display_name(&self, display_name: String) -> String {
        let mut state = self.shared.state.lock();
        std::mem::replace(&mut state.display_name, display_name)
    }

    pub fn device(&self) -> Value {
        self.shared.state.lock().device.clone()
    }

    pub fn rtp_capabilities(&self) -> Option<RtpCapabilities> {
        self.shared.state.lock().rtp_capabilities.clone()
    }

    pub fn sctp_capabilities(&self) -> Option<SctpCapabilities> {
        self.shared.state.lock().sctp_capabilities.clone()
    }

    pub fn info(&self) -> PeerInfo {
        let state = self.shared.state.lock();
        PeerInfo {
            id: self.shared.id.clone(),
            display_name: state.display_name.clone(),
            device: state.device.clone(),
        }
    }

    pub fn add_transport(&self, transport: WebRtcTransport, direction: TransportDirection) {
        let mut state = self.shared.state.lock();
        trace!(peer_id = %self.shared.id, transport_id = %transport.id(), ?direction, "+transport");
        state.transports.insert(
            transport.id(),
            PeerTransport {
                transport,
                direction,
            },
        );
    }

    pub fn transport(&self, id: &TransportId) -> Option<PeerTransport> {
        self.shared.state.lock().transports.get(id).cloned()
    }

    /// The transport consumers are created on, if the client has set one up.
    pub fn consumer_transport(&self) -> Option<WebRtcTransport> {
        let state = self.shared.state.lock();
        state
            .transports
            .values()
            .find(|entry| entry.direction == TransportDirection::Recv)
            .map(|entry| entry.transport.clone())
    }

    pub fn remove_transport(&self, id: &TransportId) {
        self.shared.state.lock().transports.remove(id);
    }

    pub fn add_producer(&self, producer: Producer) {
        trace!(peer_id = %self.shared.id, producer_id = %producer.id(), "+producer");
        self.shared
            .state
            .lock()
            .producers
            .insert(producer.id(), producer);
    }

    pub fn producer(&self, id: &ProducerId) -> Option<Producer> {
        self.shared.state.lock().producers.get(id).cloned()
    }

    pub fn producers(&self) -> Vec<Producer> {
        self.shared.state.lock().producers.values().cloned().collect()
    }

    pub fn remove_producer(&self, id: &ProducerId) -> Option<Producer> {
        self.shared.state.lock().producers.remove(id)
    }

    pub fn add_consumer(&self, consumer: Consumer) {
        trace!(peer_id = %self.shared.id, consumer_id = %consumer.id(), "+consumer");
        self.shared
            .state
            .lock()
            .consumers
            .insert(consumer.id(), consumer);
    }

    pub fn consumer(&self, id: &ConsumerId) -> Option<Consumer> {
        self.shared.state.lock().consumers.get(id).cloned()
    }

    pub fn consumers(&self) -> Vec<Consumer> {
        self.shared.state.lock().consumers.values().cloned().collect()
    }

    pub fn remove_consumer(&self, id: &ConsumerId) {
        self.shared.state.lock().consumers.remove(id);
    }

    pub fn add_data_producer(&self, data_producer: DataProducer) {
        trace!(peer_id = %self.shared.id, data_producer_id = %data_producer.id(), "+data producer");
        self.shared
            .state
            .lock()
            .data_producers
            .insert(data_producer.id(), data_producer);
    }

    pub fn data_producer(&self, id: &DataProducerId) -> Option<DataProducer> {
        self.shared.state.lock().data_producers.get(id).cloned()
    }

    pub fn data_producers(&self) -> Vec<DataProducer> {
        self.shared
            .state
            .lock()
            .data_producers
            .values()
            .cloned()
            .collect()
    }

    pub fn remove_data_producer(&self, id: &DataProducerId) {
        self.shared.state.lock().data_producers.remove(id);
    }

    pub fn add_data_consumer(&self, data_consumer: DataConsumer) {
        trace!(peer_id = %self.shared.id, data_consumer_id = %data_consumer.id(), "+data consumer");
        self.shared
            .state
            .lock()
            .data_consumers
            .insert(data_consumer.id(), data_consumer);
    }

    pub fn data_consumer(&self, id: &DataConsumerId) -> Option<DataConsumer> {
        self.shared.state.lock().data_consumers.get(id).cloned()
    }

    pub fn remove_data_consumer(&self, id: &DataConsumerId) {
        self.shared.state.lock().data_consumers.remove(id);
    }

    /// Terminal transition. Releases every owned engine object and hangs up
    /// the signaling channel; safe to call more than once.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.clear_join_timer();
        self.shared.channel.close();

        // Engine-close handlers fire while the objects drop; move them out of
        // the lock first so those handlers can re-enter the ledgers.
        let dropped = {
            let mut state = self.shared.state.lock();
            (
                std::mem::take(&mut state.consumers),
                std::mem::take(&mut state.data_consumers),
                std::mem::take(&mut state.producers),
                std::mem::take(&mut state.data_producers),
                std::mem::take(&mut state.transports),
            )
        };
        drop(dropped);
        trace!(peer_id = %self.shared.id, "peer closed");
    }
}

impl WeakPeer {
    pub fn upgrade(&self) -> Option<Peer> {
        let shared = self.shared.upgrade()?;
        Some(Peer { shared })
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        trace!(peer_id = %self.id, "-peer");
    }
}
