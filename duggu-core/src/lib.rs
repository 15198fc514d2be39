pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod models;
pub mod test_helpers;

pub use config::Config;
pub use connection::{Connection, FrameSink, WeakConnection};
pub use error::{Error, Result};
