//! # relayhub
//!
//! `relayhub` is an in-process publish/subscribe hub with a cross-node
//! dispatcher. Clients receive messages over a server-push HTTP stream or a
//! WebSocket; nodes sharing a peer store forward messages to each other
//! without echoing them back.
//!
//! ## Core Modules
//!
//! - `broker`: topics, subscriptions and fan-out, serialized by one control loop.
//! - `processor`: the subscriber abstraction and its run loop.
//! - `transport`: the HTTP API, the server-push stream and the WebSocket server.
//! - `dispatcher`: forwarding between nodes and the peer stores behind it.
//! - `config`: settings loaded from files and the environment.
//! - `server`: wiring for a complete node.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod processor;
pub mod server;
pub mod transport;
pub mod utils;
