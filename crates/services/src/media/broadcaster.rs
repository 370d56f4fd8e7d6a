use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use mediasoup::prelude::*;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

use crate::error::{MediaError, MediaResult};

use super::types::{PeerId, PeerInfo, TransportDirection};

/// Automation participant driven through the HTTP API. Same id space as
/// interactive peers but with a plain-RTP transport ledger, no signaling
/// channel and no join timer — joining is an explicit HTTP call. Broadcaster
/// peers never count toward room liveness.
#[derive(Clone)]
pub struct Broadcaster {
    shared: Arc<Shared>,
}

#[derive(Clone)]
pub struct WeakBroadcaster {
    shared: Weak<Shared>,
}

struct Shared {
    id: PeerId,
    display_name: String,
    device: Value,
    joined: AtomicBool,
    closed: AtomicBool,
    state: Mutex<State>,
}

struct State {
    plain_transports: HashMap<TransportId, BroadcasterTransport>,
    producers: HashMap<ProducerId, Producer>,
    consumers: HashMap<ConsumerId, Consumer>,
}

#[derive(Clone)]
pub struct BroadcasterTransport {
    pub transport: PlainTransport,
    pub direction: TransportDirection,
}

impl Broadcaster {
    pub fn new(id: PeerId, display_name: String, device: Value) -> Self {
        trace!(peer_id = %id, "+broadcaster");
        Self {
            shared: Arc::new(Shared {
                id,
                display_name,
                device,
                joined: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                state: Mutex::new(State {
                    plain_transports: HashMap::new(),
                    producers: HashMap::new(),
                    consumers: HashMap::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.shared.id
    }

    pub fn display_name(&self) -> &str {
        &self.shared.display_name
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.shared.id.clone(),
            display_name: self.shared.display_name.clone(),
            device: self.shared.device.clone(),
        }
    }

    pub fn is_joined(&self) -> bool {
        self.shared.joined.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn join(&self) -> MediaResult<()> {
        if self.shared.joined.swap(true, Ordering::SeqCst) {
            return Err(MediaError::InvalidState("broadcaster already joined".into()));
        }
        Ok(())
    }

    pub fn downgrade(&self) -> WeakBroadcaster {
        WeakBroadcaster {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn add_transport(&self, transport: PlainTransport, direction: TransportDirection) {
        trace!(peer_id = %self.shared.id, transport_id = %transport.id(), ?direction, "+transport [plain]");
        self.shared.state.lock().plain_transports.insert(
            transport.id(),
            BroadcasterTransport {
                transport,
                direction,
            },
        );
    }

    pub fn transport(&self, id: &TransportId) -> Option<BroadcasterTransport> {
        self.shared.state.lock().plain_transports.get(id).cloned()
    }

    pub fn remove_transport(&self, id: &TransportId) {
        self.shared.state.lock().plain_transports.remove(id);
    }

    pub fn add_producer(&self, producer: Producer) {
        trace!(peer_id = %self.shared.id, producer_id = %producer.id(), "+producer [plain]");
        self.shared
            .state
            .lock()
            .producers
            .insert(producer.id(), producer);
    }

    pub fn producers(&self) -> Vec<Producer> {
        self.shared.state.lock().producers.values().cloned().collect()
    }

    pub fn remove_producer(&self, id: &ProducerId) -> Option<Producer> {
        self.shared.state.lock().producers.remove(id)
    }

    pub fn add_consumer(&self, consumer: Consumer) {
        trace!(peer_id = %self.shared.id, consumer_id = %consumer.id(), "+consumer [plain]");
        self.shared
            .state
            .lock()
            .consumers
            .insert(consumer.id(), consumer);
    }

    pub fn consumer(&self, id: &ConsumerId) -> Option<Consumer> {
        self.shared.state.lock().consumers.get(id).cloned()
    }

    pub fn remove_consumer(&self, id: &ConsumerId) {
        self.shared.state.lock().consumers.remove(id);
    }

    /// Releases every owned engine object; safe to call more than once.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let dropped = {
            let mut state = self.shared.state.lock();
            (
                std::mem::take(&mut state.consumers),
                std::mem::take(&mut state.producers),
                std::mem::take(&mut state.plain_transports),
            )
        };
        drop(dropped);
        trace!(peer_id = %self.shared.id, "broadcaster closed");
    }
}

impl WeakBroadcaster {
    pub fn upgrade(&self) -> Option<Broadcaster> {
        let shared = self.shared.upgrade()?;
        Some(Broadcaster { shared })
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        trace!(peer_id = %self.id, "-broadcaster");
    }
}
