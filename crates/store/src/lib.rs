//! Shared-store contract for throttling state.

pub mod in_memory;
pub mod store;

pub use in_memory::InMemoryStore;
pub use store::ThrottleStore;
