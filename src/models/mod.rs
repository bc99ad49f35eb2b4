//! Data models for channels, events, connections, and presence.

pub mod channel;
pub mod connection;
pub mod event;
pub mod presence;

pub use channel::*;
pub use connection::*;
pub use event::*;
pub use presence::*;
