//! Events emitted by the reconnecting client for the UI layer to consume.

use std::time::Duration;

use crate::client::ClientState;

/// Lifecycle events that the SDK emits to the consumer.
///
/// Transport failures only ever show up as [`ClientEvent::ConnectFailed`] or
/// [`ClientEvent::Disconnected`] ("reconnecting"); [`ClientEvent::AuthRejected`]
/// is the one failure a UI should surface as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    StateChanged(ClientState),

    /// Handshake succeeded. `attempt` counts attempts since the last
    /// successful connection (1 = first try).
    Connected {
        attempt: u32,
    },

    /// Handshake failed; another attempt is scheduled after `retry_in`.
    ConnectFailed {
        attempt: u32,
        error: String,
        retry_in: Duration,
    },

    /// An established connection was closed by the other side or the network.
    Disconnected {
        reason: String,
    },

    /// The server explicitly refused the credential. No retry is scheduled.
    AuthRejected {
        reason: String,
    },
}
