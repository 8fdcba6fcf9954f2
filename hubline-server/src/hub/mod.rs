//! Per-connection WebSocket session.
//!
//! One task per socket. It registers the connection, then multiplexes three
//! sources until any of them ends: inbound frames (invocations, answered
//! inline with a completion), the connection's push queue, and server
//! shutdown. On exit the connection is removed and presence is republished.
//!
//! Invocations run inline, so the push queue is not drained while one waits
//! on a busy group lock; a long enough burst fills `outbound_buffer` and the
//! excess pushes for this connection are dropped.

mod dispatch;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use tokio::sync::mpsc;

use crate::auth::Claims;
use crate::ids;
use crate::registry::ConnectionMetadata;
use crate::server::SharedState;

pub(crate) use dispatch::{Caller, handle_frame};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn handle_socket(mut socket: WebSocket, state: Arc<SharedState>, claims: Option<Claims>) {
    let conn_id = ids::generate();
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(state.config.outbound_buffer.max(1));
    let (identity, metadata) = match &claims {
        Some(claims) => (Some(claims.identity()), claims.metadata()),
        None => (None, ConnectionMetadata::default()),
    };
    let conn = state
        .registry
        .add_connection(identity.clone(), conn_id.clone(), metadata, tx);
    match &identity {
        Some(identity) => tracing::info!(conn_id = %conn_id, %identity, "connection registered"),
        None => tracing::info!(conn_id = %conn_id, "visitor connected"),
    }
    state.presence.publish();

    let caller = Caller { conn, claims };
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            frame = socket.recv() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = handle_frame(&state, &caller, text.as_str()).await
                        && !send(&mut socket, reply).await
                    {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // Ping/Pong handled by axum
                Some(Err(e)) => {
                    tracing::debug!(conn_id = %conn_id, error = %e, "websocket read failed");
                    break;
                }
            },
            push = rx.recv() => match push {
                Some(frame) => {
                    if !send(&mut socket, String::clone(&frame)).await {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    state.registry.remove_connection(&conn_id);
    state.presence.publish();
    tracing::info!(conn_id = %conn_id, "connection closed");
}

/// Send with a timeout so a dead peer cannot stall the session.
async fn send(socket: &mut WebSocket, text: String) -> bool {
    match tokio::time::timeout(SEND_TIMEOUT, socket.send(Message::Text(text.into()))).await {
        Ok(Ok(())) => true,
        Ok(Err(_)) | Err(_) => {
            tracing::debug!("WebSocket send failed or timed out, closing session");
            false
        }
    }
}
