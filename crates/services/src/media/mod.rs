pub mod bot;
pub mod broadcaster;
pub mod codecs;
pub mod peer;
pub mod room;
pub mod room_manager;
pub(crate) mod scheduler;
pub mod types;
pub mod worker_pool;

pub use broadcaster::Broadcaster;
pub use peer::Peer;
pub use room::{Room, WeakRoom};
pub use room_manager::RoomManager;
