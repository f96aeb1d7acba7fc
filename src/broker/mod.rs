//! The broker crate module contains the hub: topics, subscriptions, message
//! fan-out and the control loop that serializes all of them.
//!
//! Public types:
//! - `Broker`: cloneable handle used to create topics, register processors,
//!   subscribe them and publish messages.
//! - `BrokerLoop`: the single task that owns the broker state.
//! - `Message` / `Topic`: what flows through the hub and where it goes.
//! - `RegistryStore`: where topics are kept between restarts.

pub mod engine;
pub mod message;
pub mod registry;
pub mod store;
pub mod topic;

pub use engine::{Broker, BrokerLoop, Delivery, SubscriptionEvent};
pub use message::{Message, MessageId};
pub use store::{InMemoryRegistryStore, RegistryStore, SledRegistryStore};
pub use topic::Topic;
