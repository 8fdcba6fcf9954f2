//! Client SDK for the hubline real-time hub.
//!
//! - [`protocol`]: JSON frames shared by the server and its clients
//! - [`client`]: [`client::ReconnectingClient`], the connection lifecycle state machine
//! - [`event`]: lifecycle events emitted by the client
//! - [`ws`]: WebSocket transport with typed hub invocations

pub mod client;
pub mod event;
pub mod protocol;
pub mod ws;
