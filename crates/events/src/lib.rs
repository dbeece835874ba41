//! In-process publish/subscribe for the orchestrator.
//!
//! - [`BroadcastHub`] fans messages out to every subscriber of a named
//!   channel, backed by one `tokio::sync::broadcast` channel per name.
//! - [`HubMessage`] is what travels on the `response` and `dream` channels.

pub mod hub;
pub mod message;

pub use hub::{BroadcastHub, HubRecvError, Subscription};
pub use message::HubMessage;
