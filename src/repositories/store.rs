//! The store seam: key/value, sets, and pub/sub over whatever transport the store offers.

use crate::error::AppResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::time::Duration;

/// Raw body of a subscribe stream, chunked however the transport delivers it.
pub type ByteStream = BoxStream<'static, AppResult<Bytes>>;

/// Every line of a subscribe stream that carries a record starts with this.
pub const FRAME_PREFIX: &str = "data: ";

/// Encode one subscribe-stream record: `data: <kind>,<channel>,<payload>` plus a blank line.
pub fn frame(kind: &str, channel: &str, payload: &str) -> String {
    format!("{}{},{},{}\n\n", FRAME_PREFIX, kind, channel, payload)
}

/// Whole seconds for a TTL, rounded up and never zero.
pub fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

/// Operations the realtime service needs from its backing store. Every call is a network
/// round trip for real stores.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// PUBLISH; returns how many subscribers received the message.
    async fn publish(&self, channel: &str, message: &str) -> AppResult<u64>;

    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    /// SETEX: write a string that expires after `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()>;

    async fn del(&self, key: &str) -> AppResult<()>;

    async fn sadd(&self, key: &str, member: &str) -> AppResult<()>;

    async fn srem(&self, key: &str, member: &str) -> AppResult<()>;

    async fn smembers(&self, key: &str) -> AppResult<Vec<String>>;

    async fn expire(&self, key: &str, ttl: Duration) -> AppResult<()>;

    /// Open a long-lived subscribe stream for exactly one channel.
    async fn subscribe(&self, channel: &str) -> AppResult<ByteStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout() {
        assert_eq!(
            frame("message", "rt:connection:1", "{\"a\":1}"),
            "data: message,rt:connection:1,{\"a\":1}\n\n"
        );
    }

    #[test]
    fn ttl_rounds_up() {
        assert_eq!(ttl_secs(Duration::from_secs(30)), 30);
        assert_eq!(ttl_secs(Duration::from_millis(1500)), 2);
        assert_eq!(ttl_secs(Duration::ZERO), 1);
    }
}
