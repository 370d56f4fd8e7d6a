use mediasoup::consumer::{ConsumerId, ConsumerScore, ConsumerType};
use mediasoup::data_consumer::DataConsumerId;
use mediasoup::data_producer::DataProducerId;
use mediasoup::data_structures::DtlsParameters;
use mediasoup::producer::{ProducerId, ProducerScore};
use mediasoup::rtp_parameters::{MediaKind, RtpCapabilities, RtpParameters};
use mediasoup::sctp_parameters::SctpStreamParameters;
use mediasoup::transport::TransportId;
use serde::{Deserialize, Serialize};

use crate::media::types::{
    ConsumerAppData, DataChannel, DataConsumerAppData, MediaSource, PeerId, PeerInfo,
    SctpCapabilities, TransportDirection,
};

/// Requests a peer may issue over the signaling channel. The dispatcher
/// builds `{"method": …, "data": …}` from the envelope and deserializes into
/// this enum; an unmatched method is a protocol error.
#[derive(Debug, Deserialize)]
#[serde(tag = "method", content = "data", rename_all = "camelCase")]
pub enum PeerRequest {
    GetRouterRtpCapabilities {},
    Join(JoinData),
    CreateWebRtcTransport(CreateWebRtcTransportData),
    #[serde(rename_all = "camelCase")]
    ConnectWebRtcTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    RestartIce { transport_id: TransportId },
    Produce(ProduceData),
    ProduceData(ProduceDataData),
    #[serde(rename_all = "camelCase")]
    GetTransportStats { transport_id: TransportId },
    #[serde(rename_all = "camelCase")]
    GetProducerStats { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    GetConsumerStats { consumer_id: ConsumerId },
    #[serde(rename_all = "camelCase")]
    GetDataProducerStats { data_producer_id: DataProducerId },
    #[serde(rename_all = "camelCase")]
    GetDataConsumerStats { data_consumer_id: DataConsumerId },
    ApplyNetworkThrottle(ApplyNetworkThrottleData),
    StopNetworkThrottle {
        #[serde(default)]
        secret: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinData {
    pub display_name: String,
    pub device: serde_json::Value,
    #[serde(default)]
    pub rtp_capabilities: Option<RtpCapabilities>,
    #[serde(default)]
    pub sctp_capabilities: Option<SctpCapabilities>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWebRtcTransportData {
    pub direction: TransportDirection,
    #[serde(default)]
    pub force_tcp: bool,
    #[serde(default)]
    pub sctp_capabilities: Option<SctpCapabilities>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceData {
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub app_data: ProduceAppData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceAppData {
    pub source: MediaSource,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceDataData {
    pub transport_id: TransportId,
    pub sctp_stream_parameters: SctpStreamParameters,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub protocol: String,
    pub app_data: ProduceDataAppData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceDataAppData {
    pub channel: DataChannel,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyNetworkThrottleData {
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub uplink: Option<u32>,
    #[serde(default)]
    pub downlink: Option<u32>,
    #[serde(default)]
    pub rtt: Option<u32>,
    #[serde(default)]
    pub packet_loss: Option<f64>,
}

/// Fire-and-forget notifications from a peer. Failures never produce a reply;
/// they are logged and dropped.
#[derive(Debug, Deserialize)]
#[serde(tag = "method", content = "data", rename_all = "camelCase")]
pub enum PeerNotification {
    #[serde(rename_all = "camelCase")]
    CloseProducer { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    PauseProducer { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    ResumeProducer { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    PauseConsumer { consumer_id: ConsumerId },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer { consumer_id: ConsumerId },
    #[serde(rename_all = "camelCase")]
    SetConsumerPreferredLayers {
        consumer_id: ConsumerId,
        spatial_layer: u8,
        #[serde(default)]
        temporal_layer: Option<u8>,
    },
    #[serde(rename_all = "camelCase")]
    SetConsumerPriority {
        consumer_id: ConsumerId,
        priority: u8,
    },
    #[serde(rename_all = "camelCase")]
    RequestConsumerKeyFrame { consumer_id: ConsumerId },
    #[serde(rename_all = "camelCase")]
    ChangeDisplayName { display_name: String },
}

/// Notifications pushed to a peer. Serializing one yields `{"method": …,
/// "data": …}`; the channel adds the `notification` marker.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "method", content = "data", rename_all = "camelCase")]
pub enum ServerNotification {
    MediasoupVersion {
        version: String,
    },
    NewPeer(PeerInfo),
    #[serde(rename_all = "camelCase")]
    PeerDisplayNameChanged {
        peer_id: PeerId,
        display_name: String,
        old_display_name: String,
    },
    #[serde(rename_all = "camelCase")]
    PeerClosed {
        peer_id: PeerId,
    },
    #[serde(rename_all = "camelCase")]
    ProducerScore {
        producer_id: ProducerId,
        score: Vec<ProducerScore>,
    },
    #[serde(rename_all = "camelCase")]
    ConsumerPaused {
        consumer_id: ConsumerId,
    },
    #[serde(rename_all = "camelCase")]
    ConsumerResumed {
        consumer_id: ConsumerId,
    },
    #[serde(rename_all = "camelCase")]
    ConsumerScore {
        consumer_id: ConsumerId,
        score: ConsumerScore,
    },
    #[serde(rename_all = "camelCase")]
    ConsumerLayersChanged {
        consumer_id: ConsumerId,
        spatial_layer: Option<u8>,
        temporal_layer: Option<u8>,
    },
    #[serde(rename_all = "camelCase")]
    ConsumerClosed {
        consumer_id: ConsumerId,
    },
    #[serde(rename_all = "camelCase")]
    DataConsumerClosed {
        data_consumer_id: DataConsumerId,
    },
    #[serde(rename_all = "camelCase")]
    SpeakingPeers {
        peer_volumes: Vec<PeerVolume>,
    },
    #[serde(rename_all = "camelCase")]
    ActiveSpeaker {
        peer_id: Option<PeerId>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerVolume {
    pub peer_id: PeerId,
    pub volume: i8,
}

/// Payload of the room-initiated `newConsumer` request. The client must ack
/// before the engine consumer is resumed.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConsumerData {
    pub peer_id: PeerId,
    pub producer_id: ProducerId,
    pub id: ConsumerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub r#type: ConsumerType,
    pub app_data: ConsumerAppData,
    pub producer_paused: bool,
}

/// Payload of the room-initiated `newDataConsumer` request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDataConsumerData {
    pub peer_id: Option<PeerId>,
    pub data_producer_id: DataProducerId,
    pub id: DataConsumerId,
    pub sctp_stream_parameters: Option<SctpStreamParameters>,
    pub label: String,
    pub protocol: String,
    pub app_data: DataConsumerAppData,
}
