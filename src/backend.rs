//! Bundled in-process backend for the identity client capability.
//!
//! The real protocol engine is an external collaborator; this backend stands
//! in for it with the same consistency rules. [`InMemoryNetwork`] is the
//! shared source of truth (registered identities, conversations, messages).
//! Each [`InMemoryClient`] keeps a per-handle replica that only moves forward
//! on `sync_*`, so the bridge's sync-before-read discipline is exercised for
//! real: a message sent by one session is invisible to another until the
//! other session synchronizes.
//!
//! Mutations write through to the network AND to the mutating handle's own
//! replica, which is what makes "create a group, then immediately send to it"
//! work without an extra sync in between.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use rand::RngCore;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::client::{ClientError, ClientFactory, IdentityClient};
use crate::signer::verify_challenge_signature;
use crate::types::{
    normalize_address, Conversation, GroupMember, GroupMessage, MetadataPatch, PermissionLevel,
};

fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

#[derive(Debug, Clone)]
struct RemoteIdentity {
    inbox_id: String,
    installation_id: String,
    registered: bool,
}

#[derive(Default)]
struct NetworkState {
    identities: HashMap<String, RemoteIdentity>,
    conversations: HashMap<String, Conversation>,
    messages: HashMap<String, Vec<GroupMessage>>,
}

/// Process-wide source of truth shared by every client handle.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign (or look up) the protocol identity for an address. Identifiers
    /// are stable for the lifetime of the network, so reopening a handle for
    /// the same address yields the same inbox and installation ids.
    async fn open_identity(&self, address: &str) -> RemoteIdentity {
        let mut state = self.state.lock().await;
        state
            .identities
            .entry(address.to_string())
            .or_insert_with(|| RemoteIdentity {
                inbox_id: Uuid::new_v4().to_string(),
                installation_id: Uuid::new_v4().to_string(),
                registered: false,
            })
            .clone()
    }

    async fn register(
        &self,
        address: &str,
        challenge: &str,
        signature: &str,
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock().await;
        let identity = state
            .identities
            .get_mut(address)
            .ok_or_else(|| ClientError::Network(format!("unknown identity for {address}")))?;
        if identity.registered {
            // Double registration is undefined behavior in the real protocol;
            // the session layer must never let a second call through.
            return Err(ClientError::Network(format!(
                "identity for {address} is already registered"
            )));
        }
        if !verify_challenge_signature(address, challenge, signature) {
            return Err(ClientError::InvalidSignature);
        }
        identity.registered = true;
        info!("Registered identity for {address}");
        Ok(())
    }
}

/// One identity handle per (address, storage location). Local reads serve the
/// replica; `sync_*` reconciles it with [`InMemoryNetwork`].
pub struct InMemoryClient {
    address: String,
    inbox_id: String,
    installation_id: String,
    signature_text: String,
    registered: bool,
    network: InMemoryNetwork,
    replica: HashMap<String, Conversation>,
    replica_messages: HashMap<String, Vec<GroupMessage>>,
}

impl InMemoryClient {
    fn member_record(identity: &RemoteIdentity, address: &str, level: PermissionLevel) -> GroupMember {
        GroupMember {
            inbox_id: identity.inbox_id.clone(),
            account_addresses: vec![address.to_string()],
            installation_ids: vec![identity.installation_id.clone()],
            permission_level: level,
        }
    }
}

#[async_trait]
impl IdentityClient for InMemoryClient {
    fn inbox_id(&self) -> String {
        self.inbox_id.clone()
    }

    fn installation_id(&self) -> String {
        self.installation_id.clone()
    }

    fn signature_text(&self) -> String {
        self.signature_text.clone()
    }

    fn is_registered(&self) -> bool {
        self.registered
    }

    async fn register(&mut self, signature: &str) -> Result<(), ClientError> {
        self.network
            .register(&self.address, &self.signature_text, signature)
            .await?;
        self.registered = true;
        Ok(())
    }

    async fn can_message(&self, addresses: &[String]) -> Result<bool, ClientError> {
        let state = self.network.state.lock().await;
        Ok(addresses.iter().all(|address| {
            state
                .identities
                .get(&normalize_address(address))
                .map(|identity| identity.registered)
                .unwrap_or(false)
        }))
    }

    async fn create_group(
        &mut self,
        members: &[String],
        patch: MetadataPatch,
    ) -> Result<Conversation, ClientError> {
        let mut state = self.network.state.lock().await;

        let creator = state
            .identities
            .get(&self.address)
            .cloned()
            .ok_or_else(|| ClientError::Network("creator identity missing".to_string()))?;
        let mut records = vec![Self::member_record(
            &creator,
            &self.address,
            PermissionLevel::SuperAdmin,
        )];
        for member in members {
            let address = normalize_address(member);
            if address == self.address {
                continue;
            }
            let identity = state
                .identities
                .get(&address)
                .filter(|identity| identity.registered)
                .cloned()
                .ok_or(ClientError::UnreachableMembers)?;
            if records.iter().any(|r| r.inbox_id == identity.inbox_id) {
                continue;
            }
            records.push(Self::member_record(&identity, &address, PermissionLevel::Member));
        }

        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            name: patch.name.unwrap_or_default(),
            description: patch.description.unwrap_or_default(),
            image_url: patch.image_url.unwrap_or_default(),
            members: records,
            admins: Vec::new(),
            super_admins: vec![creator.inbox_id],
            created_at_ns: now_ns(),
            added_by_inbox_id: self.inbox_id.clone(),
            is_active: true,
        };

        state
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        state.messages.insert(conversation.id.clone(), Vec::new());

        self.replica
            .insert(conversation.id.clone(), conversation.clone());
        self.replica_messages
            .insert(conversation.id.clone(), Vec::new());
        debug!("Created conversation {} for {}", conversation.id, self.address);
        Ok(conversation)
    }

    async fn sync_conversations(&mut self) -> Result<(), ClientError> {
        let state = self.network.state.lock().await;
        self.replica = state
            .conversations
            .values()
            .filter(|conversation| conversation.has_member(&self.inbox_id))
            .map(|conversation| (conversation.id.clone(), conversation.clone()))
            .collect();
        Ok(())
    }

    async fn sync_conversation(&mut self, group_id: &str) -> Result<(), ClientError> {
        let state = self.network.state.lock().await;
        let conversation = state
            .conversations
            .get(group_id)
            .ok_or_else(|| ClientError::UnknownConversation(group_id.to_string()))?;
        self.replica
            .insert(group_id.to_string(), conversation.clone());
        self.replica_messages.insert(
            group_id.to_string(),
            state.messages.get(group_id).cloned().unwrap_or_default(),
        );
        Ok(())
    }

    fn conversation_by_id(&self, group_id: &str) -> Option<Conversation> {
        self.replica.get(group_id).cloned()
    }

    fn conversations(&self) -> Vec<Conversation> {
        let mut conversations: Vec<Conversation> = self.replica.values().cloned().collect();
        conversations.sort_by_key(|c| c.created_at_ns);
        conversations
    }

    fn messages(&self, group_id: &str) -> Vec<GroupMessage> {
        self.replica_messages
            .get(group_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn update_name(&mut self, group_id: &str, name: &str) -> Result<(), ClientError> {
        let mut state = self.network.state.lock().await;
        let conversation = state
            .conversations
            .get_mut(group_id)
            .ok_or_else(|| ClientError::UnknownConversation(group_id.to_string()))?;
        conversation.name = name.to_string();
        self.replica.insert(group_id.to_string(), conversation.clone());
        Ok(())
    }

    async fn update_description(
        &mut self,
        group_id: &str,
        description: &str,
    ) -> Result<(), ClientError> {
        let mut state = self.network.state.lock().await;
        let conversation = state
            .conversations
            .get_mut(group_id)
            .ok_or_else(|| ClientError::UnknownConversation(group_id.to_string()))?;
        conversation.description = description.to_string();
        self.replica.insert(group_id.to_string(), conversation.clone());
        Ok(())
    }

    async fn update_image_url(
        &mut self,
        group_id: &str,
        image_url: &str,
    ) -> Result<(), ClientError> {
        let mut state = self.network.state.lock().await;
        let conversation = state
            .conversations
            .get_mut(group_id)
            .ok_or_else(|| ClientError::UnknownConversation(group_id.to_string()))?;
        conversation.image_url = image_url.to_string();
        self.replica.insert(group_id.to_string(), conversation.clone());
        Ok(())
    }

    async fn add_members(
        &mut self,
        group_id: &str,
        members: &[String],
    ) -> Result<(), ClientError> {
        let mut state = self.network.state.lock().await;

        let mut additions = Vec::new();
        for member in members {
            let address = normalize_address(member);
            let identity = state
                .identities
                .get(&address)
                .filter(|identity| identity.registered)
                .cloned()
                .ok_or(ClientError::UnreachableMembers)?;
            additions.push((address, identity));
        }

        let conversation = state
            .conversations
            .get_mut(group_id)
            .ok_or_else(|| ClientError::UnknownConversation(group_id.to_string()))?;
        for (address, identity) in additions {
            if conversation.has_member(&identity.inbox_id) {
                continue;
            }
            conversation.members.push(Self::member_record(
                &identity,
                &address,
                PermissionLevel::Member,
            ));
        }
        self.replica.insert(group_id.to_string(), conversation.clone());
        Ok(())
    }

    async fn remove_members(
        &mut self,
        group_id: &str,
        members: &[String],
    ) -> Result<(), ClientError> {
        let removed: Vec<String> = members.iter().map(|m| normalize_address(m)).collect();
        let mut state = self.network.state.lock().await;
        let conversation = state
            .conversations
            .get_mut(group_id)
            .ok_or_else(|| ClientError::UnknownConversation(group_id.to_string()))?;

        let dropped: Vec<String> = conversation
            .members
            .iter()
            .filter(|member| {
                member
                    .account_addresses
                    .iter()
                    .any(|address| removed.contains(address))
            })
            .map(|member| member.inbox_id.clone())
            .collect();

        conversation
            .members
            .retain(|member| !dropped.contains(&member.inbox_id));
        conversation.admins.retain(|inbox| !dropped.contains(inbox));
        conversation
            .super_admins
            .retain(|inbox| !dropped.contains(inbox));
        self.replica.insert(group_id.to_string(), conversation.clone());
        Ok(())
    }

    async fn add_admin(&mut self, group_id: &str, inbox_id: &str) -> Result<(), ClientError> {
        let mut state = self.network.state.lock().await;
        let conversation = state
            .conversations
            .get_mut(group_id)
            .ok_or_else(|| ClientError::UnknownConversation(group_id.to_string()))?;
        if !conversation.has_member(inbox_id) {
            return Err(ClientError::Network(format!(
                "inbox {inbox_id} is not a member of {group_id}"
            )));
        }
        if !conversation.admins.iter().any(|a| a == inbox_id) {
            conversation.admins.push(inbox_id.to_string());
        }
        for member in &mut conversation.members {
            if member.inbox_id == inbox_id && member.permission_level == PermissionLevel::Member {
                member.permission_level = PermissionLevel::Admin;
            }
        }
        self.replica.insert(group_id.to_string(), conversation.clone());
        Ok(())
    }

    async fn remove_admin(&mut self, group_id: &str, inbox_id: &str) -> Result<(), ClientError> {
        let mut state = self.network.state.lock().await;
        let conversation = state
            .conversations
            .get_mut(group_id)
            .ok_or_else(|| ClientError::UnknownConversation(group_id.to_string()))?;
        conversation.admins.retain(|a| a != inbox_id);
        for member in &mut conversation.members {
            if member.inbox_id == inbox_id && member.permission_level == PermissionLevel::Admin {
                member.permission_level = PermissionLevel::Member;
            }
        }
        self.replica.insert(group_id.to_string(), conversation.clone());
        Ok(())
    }

    async fn send_message(
        &mut self,
        group_id: &str,
        content: &str,
    ) -> Result<GroupMessage, ClientError> {
        let mut state = self.network.state.lock().await;
        if !state.conversations.contains_key(group_id) {
            return Err(ClientError::UnknownConversation(group_id.to_string()));
        }
        let message = GroupMessage {
            sender: self.address.clone(),
            content: content.to_string(),
            sent_at_ns: now_ns(),
        };
        state
            .messages
            .entry(group_id.to_string())
            .or_default()
            .push(message.clone());

        self.replica_messages
            .entry(group_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(message)
    }
}

/// Factory handing out [`InMemoryClient`] handles bound to one shared network.
#[derive(Clone)]
pub struct InMemoryFactory {
    network: InMemoryNetwork,
}

impl InMemoryFactory {
    pub fn new(network: InMemoryNetwork) -> Self {
        InMemoryFactory { network }
    }
}

#[async_trait]
impl ClientFactory for InMemoryFactory {
    type Client = InMemoryClient;

    async fn open(&self, address: &str, db_path: &Path) -> Result<Self::Client, ClientError> {
        let address = normalize_address(address);
        let identity = self.network.open_identity(&address).await;

        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        let signature_text = format!(
            "Bind address {address} to inbox {} (nonce 0x{})",
            identity.inbox_id,
            alloy::hex::encode(nonce)
        );

        debug!(
            "Opened identity handle for {address} at {}",
            db_path.display()
        );
        Ok(InMemoryClient {
            address,
            inbox_id: identity.inbox_id,
            installation_id: identity.installation_id,
            signature_text,
            registered: identity.registered,
            network: self.network.clone(),
            replica: HashMap::new(),
            replica_messages: HashMap::new(),
        })
    }
}
