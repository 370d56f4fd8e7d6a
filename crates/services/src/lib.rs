pub mod error;
pub mod media;
pub mod signal;
pub mod throttle;

pub use error::{MediaError, MediaResult};
pub use media::room_manager::RoomManager;

/// Version of the media engine this build links against. Keep in sync with
/// the `mediasoup` entry in the workspace dependency table.
pub const ENGINE_VERSION: &str = "0.20.0";
