use std::collections::HashMap;
use std::sync::Arc;

use mediasoup::data_structures::WebRtcMessage;
use mediasoup::prelude::*;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::error::{MediaError, MediaResult};

use super::peer::Peer;
use super::types::{DataChannel, DataProducerAppData};

/// Per-room chat relay on a direct transport. Every joined peer consumes the
/// bot's data producer; every peer data producer of channel `bot` is consumed
/// by the bot, which echoes each string message back to the whole room. The
/// bot has no close method — its objects die with the room's routers.
#[derive(Clone)]
pub struct Bot {
    shared: Arc<Shared>,
}

struct Shared {
    transport: DirectTransport,
    data_producer: DataProducer,
    echo_tx: mpsc::UnboundedSender<String>,
    /// Keeps the per-peer data consumers alive, keyed by the peer data
    /// producer they tap.
    consumers: Mutex<HashMap<DataProducerId, DataConsumer>>,
}

impl Bot {
    pub async fn new(router: &Router) -> MediaResult<Self> {
        let mut transport_options = DirectTransportOptions::default();
        transport_options.max_message_size = 512;
        let transport = router
            .create_direct_transport(transport_options)
            .await
            .map_err(MediaError::engine)?;

        let mut producer_options = DataProducerOptions::new_direct();
        producer_options.label = "bot".to_string();
        producer_options.app_data = AppData::new(DataProducerAppData {
            peer_id: None,
            channel: DataChannel::Bot,
        });
        let data_producer = transport
            .produce_data(producer_options)
            .await
            .map_err(MediaError::engine)?;

        // Message callbacks run on engine threads; they push onto this queue
        // and a task inside the runtime performs the async send.
        let (echo_tx, mut echo_rx) = mpsc::unbounded_channel::<String>();
        let producer = data_producer.clone();
        tokio::spawn(async move {
            while let Some(text) = echo_rx.recv().await {
                if let DataProducer::Direct(direct) = &producer {
                    if let Err(err) = direct.send(WebRtcMessage::String(text.into())).await {
                        warn!(%err, "bot failed to send echo message");
                    }
                }
            }
        });

        trace!(data_producer_id = %data_producer.id(), "bot created");
        Ok(Self {
            shared: Arc::new(Shared {
                transport,
                data_producer,
                echo_tx,
                consumers: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn data_producer(&self) -> &DataProducer {
        &self.shared.data_producer
    }

    /// Taps a peer's bot-channel data producer. Each received string message
    /// (SCTP PPID 51) is echoed through the bot's own data producer;
    /// non-string messages are ignored.
    pub async fn handle_peer_data_producer(
        &self,
        data_producer_id: DataProducerId,
        peer: &Peer,
    ) -> MediaResult<()> {
        let data_consumer = self
            .shared
            .transport
            .consume_data(DataConsumerOptions::new_direct(data_producer_id))
            .await
            .map_err(MediaError::engine)?;

        let weak_peer = peer.downgrade();
        let echo_tx = self.shared.echo_tx.clone();
        data_consumer
            .on_message(move |message| {
                if let WebRtcMessage::String(text) = message {
                    let Some(peer) = weak_peer.upgrade() else {
                        return;
                    };
                    let _ = echo_tx.send(format!("{} told me: '{}'", peer.display_name(), text));
                }
            })
            .detach();

        let weak_shared = Arc::downgrade(&self.shared);
        data_consumer
            .on_data_producer_close(move || {
                if let Some(shared) = weak_shared.upgrade() {
                    shared.consumers.lock().remove(&data_producer_id);
                }
            })
            .detach();

        trace!(%data_producer_id, peer_id = %peer.id(), "bot tapping peer data producer");
        self.shared
            .consumers
            .lock()
            .insert(data_producer_id, data_consumer);
        Ok(())
    }
}
