//! Asynchronous messaging between worker ranks.
//!
//! [`fabric`] abstracts the point-to-point transport (non-blocking sends with
//! completion testing, one outstanding receive), [`tags`] fixes the message
//! tag namespace, and [`queue`] layers in-flight management, self-messages
//! and transparent fragmentation of oversized payloads on top.

pub mod fabric;
pub mod queue;
pub mod tags;

pub use fabric::{Fabric, InProcessFabric, Inbound, Rank};
pub use queue::{Message, MessageQueue};
pub use tags::Tag;
