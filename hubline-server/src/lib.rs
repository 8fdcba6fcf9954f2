//! Real-time presence and group messaging hub.
//!
//! Connections arrive over a WebSocket ([`hub`]), are classified by their
//! bearer credential ([`auth`]) and tracked in the [`registry`]. Registry
//! changes drive roster broadcasts ([`presence`]); chat operations go
//! through the [`group`] coordinator, which persists via [`store`] and fans
//! out to member connections.

pub mod auth;
pub mod config;
pub mod db;
pub mod group;
pub mod hub;
pub mod ids;
pub mod presence;
pub mod registry;
pub mod server;
pub mod store;
pub mod web;
