//! Invocation dispatch: decode a client frame, authorize, call the
//! coordinator, and build the completion.

use std::sync::Arc;

use hubline_sdk::protocol::{ClientFrame, ErrorBody, ErrorCode, HubCall, ServerFrame};

use crate::auth::Claims;
use crate::group::GroupChatCoordinator;
use crate::registry::ClientConnection;
use crate::server::SharedState;

/// The connection an invocation arrived on and who opened it.
pub(crate) struct Caller {
    pub conn: Arc<ClientConnection>,
    pub claims: Option<Claims>,
}

/// Handle one inbound text frame. Returns the completion to send back, or
/// `None` for frames that carry no invocation id to answer.
pub(crate) async fn handle_frame(state: &SharedState, caller: &Caller, text: &str) -> Option<String> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(conn_id = %caller.conn.id, error = %e, "ignoring malformed frame");
            return None;
        }
    };
    let invoke_id = (value.get("type").and_then(|t| t.as_str()) == Some("invoke"))
        .then(|| value.get("id").and_then(|id| id.as_u64()))
        .flatten();

    let (id, error) = match serde_json::from_value::<ClientFrame>(value) {
        Ok(ClientFrame::Invoke { id, call }) => {
            let target = call.target();
            let error = invoke(state, caller, call).await.err();
            if let Some(ref e) = error {
                tracing::debug!(conn_id = %caller.conn.id, id, target, code = ?e.code, "invocation failed: {}", e.message);
            }
            (id, error)
        }
        Err(e) => {
            let Some(id) = invoke_id else {
                tracing::warn!(conn_id = %caller.conn.id, error = %e, "ignoring frame without invocation id");
                return None;
            };
            tracing::debug!(conn_id = %caller.conn.id, id, error = %e, "undecodable invocation");
            (id, Some(ErrorBody::new(ErrorCode::Invalid, format!("bad invocation: {e}"))))
        }
    };
    completion(id, error)
}

fn completion(id: u64, error: Option<ErrorBody>) -> Option<String> {
    match serde_json::to_string(&ServerFrame::Completion { id, error }) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode completion");
            None
        }
    }
}

async fn invoke(state: &SharedState, caller: &Caller, call: HubCall) -> Result<(), ErrorBody> {
    let chat = &state.coordinator;
    match call {
        HubCall::SetPresenceInterest { enabled } => {
            caller.conn.set_presence_interest(enabled);
            if enabled {
                state.presence.send_snapshot(&caller.conn);
            }
            Ok(())
        }
        HubCall::SendGroupChatMessage { group_id, message } => {
            let claims = signed_in(caller)?;
            chat.send_message(&group_id, &claims.identity(), &message).await?;
            Ok(())
        }
        HubCall::EditGroupChatMessage {
            group_id,
            message_id,
            new_content,
        } => {
            let claims = signed_in(caller)?;
            authorize_change(chat, claims, &group_id, &message_id)?;
            chat.edit_message(&group_id, &message_id, &new_content).await?;
            Ok(())
        }
        HubCall::DeleteGroupChatMessage {
            group_id,
            message_id,
        } => {
            let claims = signed_in(caller)?;
            authorize_change(chat, claims, &group_id, &message_id)?;
            chat.delete_message(&group_id, &message_id).await?;
            Ok(())
        }
        HubCall::LeaveGroupChat { group_id } => {
            let claims = signed_in(caller)?;
            chat.leave_group(&group_id, &claims.identity()).await?;
            Ok(())
        }
    }
}

fn signed_in(caller: &Caller) -> Result<&Claims, ErrorBody> {
    caller
        .claims
        .as_ref()
        .ok_or_else(|| ErrorBody::new(ErrorCode::Unauthorized, "sign in to use group chat"))
}

/// Only the author or an admin may edit or delete a message.
fn authorize_change(
    chat: &GroupChatCoordinator,
    claims: &Claims,
    group_id: &str,
    message_id: &str,
) -> Result<(), ErrorBody> {
    let message = chat.message(group_id, message_id)?;
    if message.author == claims.identity() || claims.is_admin() {
        return Ok(());
    }
    tracing::info!(
        caller = %claims.sub,
        author = %message.author,
        message = %message_id,
        "refused change to another user's message"
    );
    Err(ErrorBody::new(
        ErrorCode::Forbidden,
        "only the author or an admin can change this message",
    ))
}
