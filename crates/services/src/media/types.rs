use mediasoup::sctp_parameters::NumSctpStreams;
use serde::{Deserialize, Serialize};

pub type RoomId = String;
pub type PeerId = String;

/// What a media producer carries, as declared by its creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaSource {
    Audio,
    Video,
    Screensharing,
}

/// Data-channel lane: `chat` fans out to every peer, `bot` is consumed by
/// the room bot only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataChannel {
    Chat,
    Bot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

/// App-scoped metadata attached to every producer created in a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerAppData {
    pub peer_id: PeerId,
    pub source: MediaSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerAppData {
    pub peer_id: PeerId,
    pub source: MediaSource,
}

/// `peer_id` is absent for bot-originated streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataProducerAppData {
    pub peer_id: Option<PeerId>,
    pub channel: DataChannel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataConsumerAppData {
    pub peer_id: Option<PeerId>,
    pub channel: DataChannel,
}

/// Stream-control (SCTP) capabilities a client declares on join or transport
/// creation. The engine binding only needs the stream counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SctpCapabilities {
    pub num_streams: NumSctpStreams,
}

/// Entry of the joined-peers snapshot returned to a joining participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: PeerId,
    pub display_name: String,
    pub device: serde_json::Value,
}
