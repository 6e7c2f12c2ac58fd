//! Group conversation commands, layered over the session store.
//!
//! Every operation requires a registered session for the acting address and
//! runs under that session's mutex, so commands from one caller are observed
//! in the order they were awaited. Successful mutations are mirrored to the
//! broadcast hub after the session lock is released.

use std::sync::Arc;

use log::info;
use tokio::sync::OwnedMutexGuard;

use crate::broadcast::{BroadcastEvent, BroadcastHub};
use crate::client::{with_upstream_timeout, ClientError, ClientFactory, IdentityClient};
use crate::session::{RegistrationState, Session, SessionStore};
use crate::types::{
    normalize_address, Conversation, ConversationSummary, GroupMessage, MetadataPatch,
};

#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("Client isn't registered")]
    NotRegistered,
    #[error("No conversation found with id: {0}")]
    ConversationNotFound(String),
    #[error("One or more members do not have a protocol identity")]
    UnreachableMembers,
    #[error("Inbox {0} is not a member of the group")]
    NotAMember(String),
    /// A metadata update failed partway through. Earlier field updates stay
    /// applied; there is no compensating rollback.
    #[error("Group metadata partially updated (applied: {}): {source}", applied.join(", "))]
    PartialMetadataUpdate {
        applied: Vec<&'static str>,
        #[source]
        source: ClientError,
    },
    #[error("Upstream protocol failure: {0}")]
    Upstream(String),
}

fn map_client(err: ClientError) -> GroupError {
    match err {
        ClientError::UnknownConversation(id) => GroupError::ConversationNotFound(id),
        ClientError::UnreachableMembers => GroupError::UnreachableMembers,
        ClientError::InvalidSignature => {
            GroupError::Upstream("unexpected signature failure".to_string())
        }
        ClientError::Network(msg) => GroupError::Upstream(msg),
    }
}

pub struct GroupService<F: ClientFactory> {
    store: Arc<SessionStore<F>>,
    hub: BroadcastHub,
}

impl<F: ClientFactory> GroupService<F> {
    pub fn new(store: Arc<SessionStore<F>>, hub: BroadcastHub) -> Self {
        GroupService { store, hub }
    }

    /// Resolve the session for `address` and require it to be registered.
    /// Fails before any network contact, and therefore before any broadcast
    /// event can fire.
    async fn registered_session(
        &self,
        address: &str,
    ) -> Result<OwnedMutexGuard<Option<Session<F::Client>>>, GroupError> {
        let slot = self
            .store
            .lookup(address)
            .await
            .ok_or(GroupError::NotRegistered)?;
        let guard = slot.lock_owned().await;
        match guard.as_ref() {
            Some(session) if session.state() == RegistrationState::Registered => Ok(guard),
            _ => Err(GroupError::NotRegistered),
        }
    }

    /// Create a group with the given members and optional metadata. All
    /// members must be reachable on the protocol; otherwise nothing is
    /// created and no event fires.
    pub async fn create_group(
        &self,
        address: &str,
        members: Vec<String>,
        patch: MetadataPatch,
    ) -> Result<Conversation, GroupError> {
        let mut guard = self.registered_session(address).await?;
        let session = guard.as_mut().ok_or(GroupError::NotRegistered)?;
        let client = session.client_mut();

        let mut ordered: Vec<String> = Vec::new();
        for member in members {
            let member = normalize_address(&member);
            if !member.is_empty() && !ordered.contains(&member) {
                ordered.push(member);
            }
        }

        let reachable = with_upstream_timeout(client.can_message(&ordered))
            .await
            .map_err(map_client)?;
        if !reachable {
            return Err(GroupError::UnreachableMembers);
        }

        let conversation = with_upstream_timeout(client.create_group(&ordered, patch.normalized()))
            .await
            .map_err(map_client)?;
        drop(guard);

        info!(
            "Created group {} for {address} with {} member(s)",
            conversation.id,
            conversation.members.len()
        );
        self.hub.emit(BroadcastEvent::NewGroup {
            group_id: conversation.id.clone(),
            conversation: conversation.clone(),
        });
        Ok(conversation)
    }

    /// Apply the present fields of `patch` as independent remote calls, in a
    /// fixed order (name, description, image url). Returns the fields that
    /// were applied; a mid-sequence failure reports them via
    /// [`GroupError::PartialMetadataUpdate`].
    pub async fn update_group_metadata(
        &self,
        address: &str,
        group_id: &str,
        patch: MetadataPatch,
    ) -> Result<Vec<&'static str>, GroupError> {
        let mut guard = self.registered_session(address).await?;
        let session = guard.as_mut().ok_or(GroupError::NotRegistered)?;
        let client = session.client_mut();

        client
            .conversation_by_id(group_id)
            .ok_or_else(|| GroupError::ConversationNotFound(group_id.to_string()))?;

        let patch = patch.normalized();
        let mut applied: Vec<&'static str> = Vec::new();
        let partial = |applied: Vec<&'static str>, source: ClientError| {
            if applied.is_empty() {
                map_client(source)
            } else {
                GroupError::PartialMetadataUpdate { applied, source }
            }
        };

        if let Some(name) = &patch.name {
            if let Err(err) = with_upstream_timeout(client.update_name(group_id, name)).await {
                return Err(partial(applied, err));
            }
            applied.push("name");
        }
        if let Some(description) = &patch.description {
            if let Err(err) =
                with_upstream_timeout(client.update_description(group_id, description)).await
            {
                return Err(partial(applied, err));
            }
            applied.push("description");
        }
        if let Some(image_url) = &patch.image_url {
            if let Err(err) =
                with_upstream_timeout(client.update_image_url(group_id, image_url)).await
            {
                return Err(partial(applied, err));
            }
            applied.push("imageUrl");
        }

        info!("Updated metadata for group {group_id} (applied: {applied:?})");
        Ok(applied)
    }

    /// Membership rotation: additions are issued before removals so a caller
    /// swapping the full membership never leaves the group momentarily empty.
    /// The two calls stay independent; there is no transactional rollback.
    pub async fn update_group_members(
        &self,
        address: &str,
        group_id: &str,
        add_members: Vec<String>,
        remove_members: Vec<String>,
    ) -> Result<(), GroupError> {
        let mut guard = self.registered_session(address).await?;
        let session = guard.as_mut().ok_or(GroupError::NotRegistered)?;
        let client = session.client_mut();

        client
            .conversation_by_id(group_id)
            .ok_or_else(|| GroupError::ConversationNotFound(group_id.to_string()))?;

        if !add_members.is_empty() {
            with_upstream_timeout(client.add_members(group_id, &add_members))
                .await
                .map_err(map_client)?;
        }
        if !remove_members.is_empty() {
            with_upstream_timeout(client.remove_members(group_id, &remove_members))
                .await
                .map_err(map_client)?;
        }

        info!("Updated members for group {group_id}");
        Ok(())
    }

    /// Promote/demote admins. Every identifier must already be a member of
    /// the group.
    pub async fn update_group_admins(
        &self,
        address: &str,
        group_id: &str,
        add_admins: Vec<String>,
        remove_admins: Vec<String>,
    ) -> Result<(), GroupError> {
        let mut guard = self.registered_session(address).await?;
        let session = guard.as_mut().ok_or(GroupError::NotRegistered)?;
        let client = session.client_mut();

        let conversation = client
            .conversation_by_id(group_id)
            .ok_or_else(|| GroupError::ConversationNotFound(group_id.to_string()))?;
        for inbox_id in add_admins.iter().chain(remove_admins.iter()) {
            if !conversation.has_member(inbox_id) {
                return Err(GroupError::NotAMember(inbox_id.clone()));
            }
        }

        for inbox_id in &add_admins {
            with_upstream_timeout(client.add_admin(group_id, inbox_id))
                .await
                .map_err(map_client)?;
        }
        for inbox_id in &remove_admins {
            with_upstream_timeout(client.remove_admin(group_id, inbox_id))
                .await
                .map_err(map_client)?;
        }

        info!("Updated admins for group {group_id}");
        Ok(())
    }

    /// Send an opaque payload to a group. No size or type validation happens
    /// at this layer; that belongs to the protocol.
    pub async fn send_message(
        &self,
        address: &str,
        group_id: &str,
        content: &str,
    ) -> Result<GroupMessage, GroupError> {
        let mut guard = self.registered_session(address).await?;
        let session = guard.as_mut().ok_or(GroupError::NotRegistered)?;
        let client = session.client_mut();

        let conversation = client
            .conversation_by_id(group_id)
            .ok_or_else(|| GroupError::ConversationNotFound(group_id.to_string()))?;
        // Group name captured at send time, before any concurrent rename.
        let group_name = conversation.name.clone();

        let message = with_upstream_timeout(client.send_message(group_id, content))
            .await
            .map_err(map_client)?;
        drop(guard);

        info!("Message sent to group {group_id}");
        self.hub.emit(BroadcastEvent::NewMessage {
            group_id: group_id.to_string(),
            group_name,
            sender: message.sender.clone(),
            content: message.content.clone(),
        });
        Ok(message)
    }

    /// List the caller's conversations. Synchronizes the collection and then
    /// each conversation individually before reading, so the returned
    /// metadata, membership and latest message are never stale.
    pub async fn list_conversations(
        &self,
        address: &str,
    ) -> Result<Vec<ConversationSummary>, GroupError> {
        let mut guard = self.registered_session(address).await?;
        let session = guard.as_mut().ok_or(GroupError::NotRegistered)?;
        let client = session.client_mut();

        with_upstream_timeout(client.sync_conversations())
            .await
            .map_err(map_client)?;

        let ids: Vec<String> = client
            .conversations()
            .into_iter()
            .map(|conversation| conversation.id)
            .collect();
        let mut summaries = Vec::with_capacity(ids.len());
        for id in ids {
            with_upstream_timeout(client.sync_conversation(&id))
                .await
                .map_err(map_client)?;
            let conversation = client
                .conversation_by_id(&id)
                .ok_or_else(|| GroupError::ConversationNotFound(id.clone()))?;
            let latest_message = client.messages(&id).last().cloned();
            summaries.push(ConversationSummary::new(conversation, latest_message));
        }
        Ok(summaries)
    }

    /// Full message history of one group, synchronized before the read. No
    /// pagination; callers receive the complete history.
    pub async fn list_messages(
        &self,
        address: &str,
        group_id: &str,
    ) -> Result<Vec<GroupMessage>, GroupError> {
        let mut guard = self.registered_session(address).await?;
        let session = guard.as_mut().ok_or(GroupError::NotRegistered)?;
        let client = session.client_mut();

        client
            .conversation_by_id(group_id)
            .ok_or_else(|| GroupError::ConversationNotFound(group_id.to_string()))?;
        with_upstream_timeout(client.sync_conversation(group_id))
            .await
            .map_err(map_client)?;
        Ok(client.messages(group_id))
    }
}
