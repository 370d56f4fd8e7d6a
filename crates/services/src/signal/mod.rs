pub mod channel;
pub mod envelope;
pub mod messages;

pub use channel::{ChannelError, Outbound, PeerChannel};
pub use envelope::Envelope;
pub use messages::{PeerNotification, PeerRequest, ServerNotification};
