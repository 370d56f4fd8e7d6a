use serde_json::{Value, json};

/// Minimal opus send parameters matching the room codec table.
pub fn audio_rtp_parameters(ssrc: u32) -> Value {
    json!({
        "mid": "AUDIO",
        "codecs": [
            {
                "mimeType": "audio/opus",
                "payloadType": 111,
                "clockRate": 48000,
                "channels": 2,
                "parameters": { "useinbandfec": 1 },
                "rtcpFeedback": []
            }
        ],
        "headerExtensions": [],
        "encodings": [ { "ssrc": ssrc } ],
        "rtcp": { "cname": "confab-test" }
    })
}

/// Stream-control capabilities a data-channel-capable client declares.
pub fn sctp_capabilities() -> Value {
    json!({ "numStreams": { "OS": 1024, "MIS": 1024 } })
}
