//! Group chat coordination.
//!
//! Each group has one async mutex around its member set. Every operation on
//! a group (persist, then fan out) runs under that lock, so all connected
//! members observe one serial sequence of events for the group, and groups
//! never wait on each other. Fan-out itself only enqueues (`try_send`), so
//! holding the lock across it never waits on a slow socket.
//!
//! Authorization for edit/delete (author or admin) is decided by the caller
//! before the coordinator is invoked; the coordinator checks membership for
//! sends and leaves.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hubline_sdk::protocol::{
    ErrorBody, ErrorCode, Group, GroupId, GroupMessage, Identity, MessageId, ServerEvent,
};
use tokio::sync::Mutex;

use crate::registry::ConnectionRegistry;
use crate::store::{Storage, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("group {0} not found")]
    GroupNotFound(GroupId),
    #[error("message {0} not found")]
    MessageNotFound(MessageId),
    #[error("{0} is not a member of group {1}")]
    NotMember(Identity, GroupId),
    #[error("{0}")]
    Invalid(&'static str),
    #[error("storage: {0}")]
    Storage(#[from] StoreError),
}

impl ChatError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ChatError::GroupNotFound(_) | ChatError::MessageNotFound(_) => ErrorCode::NotFound,
            ChatError::NotMember(..) => ErrorCode::Forbidden,
            ChatError::Invalid(_) => ErrorCode::Invalid,
            ChatError::Storage(_) => ErrorCode::Transient,
        }
    }
}

impl From<ChatError> for ErrorBody {
    fn from(e: ChatError) -> Self {
        let message = match &e {
            // Storage details stay in the server log.
            ChatError::Storage(_) => "storage unavailable, try again".to_string(),
            other => other.to_string(),
        };
        ErrorBody::new(e.code(), message)
    }
}

/// Result of a fan-out: how many live connections the event was queued to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dispatch {
    pub recipients: usize,
}

struct GroupSlot {
    name: Option<String>,
    created_at: DateTime<Utc>,
    members: Mutex<BTreeSet<Identity>>,
}

impl GroupSlot {
    fn from_group(group: Group) -> Self {
        Self {
            name: group.name,
            created_at: group.created_at,
            members: Mutex::new(group.members),
        }
    }
}

pub struct GroupChatCoordinator {
    store: Arc<dyn Storage>,
    registry: Arc<ConnectionRegistry>,
    groups: DashMap<GroupId, Arc<GroupSlot>>,
    max_message_len: usize,
}

impl GroupChatCoordinator {
    pub fn new(
        store: Arc<dyn Storage>,
        registry: Arc<ConnectionRegistry>,
        max_message_len: usize,
    ) -> Self {
        Self {
            store,
            registry,
            groups: DashMap::new(),
            max_message_len,
        }
    }

    /// Hydrate group membership from storage. Returns the number of groups.
    pub fn load(&self) -> Result<usize, StoreError> {
        let groups = self.store.load_groups()?;
        let count = groups.len();
        for group in groups {
            self.groups
                .insert(group.id.clone(), Arc::new(GroupSlot::from_group(group)));
        }
        Ok(count)
    }

    fn slot(&self, group_id: &str) -> Result<Arc<GroupSlot>, ChatError> {
        self.groups
            .get(group_id)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or_else(|| ChatError::GroupNotFound(group_id.to_string()))
    }

    fn validate<'a>(&self, content: &'a str) -> Result<&'a str, ChatError> {
        if content.trim().is_empty() {
            return Err(ChatError::Invalid("message content is empty"));
        }
        if content.chars().count() > self.max_message_len {
            return Err(ChatError::Invalid("message content is too long"));
        }
        Ok(content)
    }

    fn fan_out(&self, members: &BTreeSet<Identity>, event: &ServerEvent) -> Dispatch {
        let frame = match event.to_frame_json() {
            Ok(json) => Arc::new(json),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode group event");
                return Dispatch::default();
            }
        };
        let mut recipients = 0;
        for member in members {
            for conn in self.registry.connections_for(member) {
                if conn.push(Arc::clone(&frame)) {
                    recipients += 1;
                }
            }
        }
        Dispatch { recipients }
    }

    pub async fn create_group(
        &self,
        name: Option<&str>,
        members: BTreeSet<Identity>,
    ) -> Result<(Group, Dispatch), ChatError> {
        if members.is_empty() {
            return Err(ChatError::Invalid("a group needs at least one member"));
        }
        let name = name.map(str::trim).filter(|n| !n.is_empty());
        let group = self.store.create_group(name, &members)?;
        let slot = Arc::new(GroupSlot::from_group(group.clone()));

        // Hold the new group's lock until the creation event is queued so no
        // later event for it can overtake.
        let guard = slot.members.lock().await;
        self.groups.insert(group.id.clone(), Arc::clone(&slot));
        let dispatch = self.fan_out(&guard, &ServerEvent::GroupCreated { group: group.clone() });
        drop(guard);

        tracing::info!(group = %group.id, members = group.members.len(), recipients = dispatch.recipients, "group created");
        Ok((group, dispatch))
    }

    pub async fn send_message(
        &self,
        group_id: &str,
        author: &Identity,
        content: &str,
    ) -> Result<(GroupMessage, Dispatch), ChatError> {
        let content = self.validate(content)?;
        let slot = self.slot(group_id)?;
        let members = slot.members.lock().await;
        if !members.contains(author) {
            return Err(ChatError::NotMember(author.clone(), group_id.to_string()));
        }

        let message = self
            .store
            .persist_message(&group_id.to_string(), author, content)?;
        let dispatch = self.fan_out(
            &members,
            &ServerEvent::GroupMessageReceived {
                message: message.clone(),
            },
        );
        tracing::debug!(group = %group_id, message = %message.id, recipients = dispatch.recipients, "group message sent");
        Ok((message, dispatch))
    }

    pub async fn edit_message(
        &self,
        group_id: &str,
        message_id: &str,
        new_content: &str,
    ) -> Result<(GroupMessage, Dispatch), ChatError> {
        let new_content = self.validate(new_content)?;
        let slot = self.slot(group_id)?;
        let members = slot.members.lock().await;

        let message = self
            .store
            .edit_message(&group_id.to_string(), &message_id.to_string(), new_content)?
            .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?;
        let dispatch = self.fan_out(
            &members,
            &ServerEvent::GroupMessageEdited {
                message: message.clone(),
            },
        );
        tracing::debug!(group = %group_id, message = %message_id, recipients = dispatch.recipients, "group message edited");
        Ok((message, dispatch))
    }

    pub async fn delete_message(
        &self,
        group_id: &str,
        message_id: &str,
    ) -> Result<Dispatch, ChatError> {
        let slot = self.slot(group_id)?;
        let members = slot.members.lock().await;

        let group_id = group_id.to_string();
        let message_id = message_id.to_string();
        if !self.store.delete_message(&group_id, &message_id)? {
            return Err(ChatError::MessageNotFound(message_id));
        }
        let dispatch = self.fan_out(
            &members,
            &ServerEvent::GroupMessageDeleted {
                group_id: group_id.clone(),
                message_id: message_id.clone(),
            },
        );
        tracing::debug!(group = %group_id, message = %message_id, recipients = dispatch.recipients, "group message deleted");
        Ok(dispatch)
    }

    /// Remove `identity` from the group and notify the members who remain.
    pub async fn leave_group(
        &self,
        group_id: &str,
        identity: &Identity,
    ) -> Result<Dispatch, ChatError> {
        let slot = self.slot(group_id)?;
        let mut members = slot.members.lock().await;
        if !members.contains(identity) {
            return Err(ChatError::NotMember(identity.clone(), group_id.to_string()));
        }

        let group_id = group_id.to_string();
        self.store.remove_member(&group_id, identity)?;
        members.remove(identity);
        let dispatch = self.fan_out(
            &members,
            &ServerEvent::GroupMemberLeft {
                group_id: group_id.clone(),
                identity: identity.clone(),
            },
        );
        tracing::info!(group = %group_id, %identity, remaining = members.len(), "member left group");
        Ok(dispatch)
    }

    /// Add `identity` to the group. Existing members and the joiner are
    /// notified. Joining twice is a no-op.
    pub async fn join_group(
        &self,
        group_id: &str,
        identity: &Identity,
    ) -> Result<Dispatch, ChatError> {
        let slot = self.slot(group_id)?;
        let mut members = slot.members.lock().await;
        if members.contains(identity) {
            return Ok(Dispatch::default());
        }

        let group_id = group_id.to_string();
        self.store.add_member(&group_id, identity)?;
        members.insert(identity.clone());
        let dispatch = self.fan_out(
            &members,
            &ServerEvent::GroupMemberJoined {
                group_id: group_id.clone(),
                identity: identity.clone(),
            },
        );
        tracing::info!(group = %group_id, %identity, "member joined group");
        Ok(dispatch)
    }

    pub fn groups_for_user(&self, identity: &Identity) -> Result<Vec<Group>, ChatError> {
        Ok(self.store.groups_for_user(identity)?)
    }

    /// Current state of a group, or `None` if unknown.
    pub async fn group(&self, group_id: &str) -> Option<Group> {
        let slot = self.slot(group_id).ok()?;
        let members = slot.members.lock().await.clone();
        Some(Group {
            id: group_id.to_string(),
            name: slot.name.clone(),
            members,
            created_at: slot.created_at,
        })
    }

    pub fn contains_group(&self, group_id: &str) -> bool {
        self.groups.contains_key(group_id)
    }

    pub async fn is_member(&self, group_id: &str, identity: &Identity) -> Result<bool, ChatError> {
        let slot = self.slot(group_id)?;
        let members = slot.members.lock().await;
        Ok(members.contains(identity))
    }

    /// Look up a message in a known group.
    pub fn message(&self, group_id: &str, message_id: &str) -> Result<GroupMessage, ChatError> {
        if !self.contains_group(group_id) {
            return Err(ChatError::GroupNotFound(group_id.to_string()));
        }
        self.store
            .get_message(&group_id.to_string(), &message_id.to_string())?
            .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))
    }

    /// Recent history for a member of the group, oldest first.
    pub async fn history(
        &self,
        group_id: &str,
        identity: &Identity,
        limit: usize,
    ) -> Result<Vec<GroupMessage>, ChatError> {
        if !self.is_member(group_id, identity).await? {
            return Err(ChatError::NotMember(identity.clone(), group_id.to_string()));
        }
        Ok(self.store.recent_messages(&group_id.to_string(), limit)?)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}
