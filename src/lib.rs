//! Opportunistic context-cache prewarming for a chat host.
//!
//! Between user turns, the coordinator fires a throwaway quiet generation so
//! the backend encodes and caches the conversation before the next real
//! request. The host's transcript is always left exactly as it was.

pub mod commands;
pub mod config;
pub mod coordinator;
pub mod event;
pub mod generation;
pub mod host;
pub mod session;
pub mod simulated;
pub mod tracker;
pub mod transcript;

pub use coordinator::Coordinator;
pub use host::Host;
