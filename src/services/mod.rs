//! Business logic: publishing, subscriptions, stream consumers, connections, and presence.

pub mod connections;
pub mod consumer;
pub mod handler;
pub mod lifecycle;
pub mod presence;
pub mod publisher;
pub mod realtime;
pub mod subscriptions;

pub use connections::ConnectionRegistry;
pub use consumer::{ConsumerState, StreamConsumer};
pub use handler::{EventHandler, HandlerId};
pub use lifecycle::Lifecycle;
pub use presence::PresenceService;
pub use publisher::Publisher;
pub use realtime::RealtimeService;
pub use subscriptions::{Subscription, SubscriptionManager};
