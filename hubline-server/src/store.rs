//! Storage collaborator for groups and messages.
//!
//! The store is the system of record. Calls are synchronous and short; the
//! coordinator invokes them while holding the per-group lock so persisted
//! order matches fan-out order.

use std::collections::BTreeSet;

use hubline_sdk::protocol::{Group, GroupId, GroupMessage, Identity, MessageId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

pub trait Storage: Send + Sync {
    fn create_group(&self, name: Option<&str>, members: &BTreeSet<Identity>) -> StoreResult<Group>;

    /// Every group with its members, for hydrating the coordinator at startup.
    fn load_groups(&self) -> StoreResult<Vec<Group>>;

    fn groups_for_user(&self, identity: &Identity) -> StoreResult<Vec<Group>>;

    fn add_member(&self, group_id: &GroupId, identity: &Identity) -> StoreResult<()>;

    fn remove_member(&self, group_id: &GroupId, identity: &Identity) -> StoreResult<()>;

    fn persist_message(
        &self,
        group_id: &GroupId,
        author: &Identity,
        content: &str,
    ) -> StoreResult<GroupMessage>;

    /// Replace the content and set the edited flag. `None` if no such message.
    fn edit_message(
        &self,
        group_id: &GroupId,
        message_id: &MessageId,
        content: &str,
    ) -> StoreResult<Option<GroupMessage>>;

    /// Returns false if no such message.
    fn delete_message(&self, group_id: &GroupId, message_id: &MessageId) -> StoreResult<bool>;

    fn get_message(
        &self,
        group_id: &GroupId,
        message_id: &MessageId,
    ) -> StoreResult<Option<GroupMessage>>;

    /// The newest `limit` messages, oldest first.
    fn recent_messages(&self, group_id: &GroupId, limit: usize) -> StoreResult<Vec<GroupMessage>>;
}
