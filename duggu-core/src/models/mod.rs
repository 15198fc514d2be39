pub mod envelope;
pub mod id;

pub use envelope::{Envelope, ErrorMessage, MessageType};
pub use id::{ConnectionId, PeerId, RoomId};
