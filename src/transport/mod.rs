//! The `transport` module connects clients to the broker.
//!
//! It defines the outbound envelope and the inbound control frames, the two
//! processor transports (server-push over HTTP and WebSocket), and the HTTP
//! router that also hosts topic management and dispatcher ingress.

pub mod http;
pub mod message;
pub mod server_push;
pub mod websocket;

#[cfg(test)]
mod tests;

#[cfg(test)]
mod websocket_tests;
