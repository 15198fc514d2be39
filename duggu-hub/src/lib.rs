//! Chat room membership and fan-out
//!
//! [`RoomRegistry`] owns which connections are in which room; [`Broadcaster`]
//! writes stamped envelopes to every current member.

pub mod broadcast;
pub mod registry;

pub use broadcast::{Audience, Broadcaster, DeliveryReport, Outbound};
pub use registry::{ChatRoom, ChatUser, RoomRegistry};
