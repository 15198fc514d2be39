// Duggu API Library
//
// WebSocket signaling endpoint and the per-connection message dispatcher

pub mod dispatch;
pub mod http;

// Re-export commonly used types
pub use dispatch::{FrameStream, MessageDispatcher};
pub use http::{create_router, AppState};
