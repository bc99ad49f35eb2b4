//! Store access: the `Store` seam, the REST client, and the in-memory store.

pub mod memory;
pub mod rest;
pub mod store;

pub use memory::MemoryStore;
pub use rest::RestStore;
pub use store::{ByteStream, Store};
