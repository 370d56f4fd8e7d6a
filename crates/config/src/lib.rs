mod settings;

pub use settings::{
    AppSettings, MediasoupSettings, PlainTransportSettings, RoomSettings, Settings,
    ThrottleSettings, WebRtcTransportSettings,
};
