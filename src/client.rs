//! Narrow capability traits over the external protocol engine.
//!
//! The bridge never touches key management or the group ciphersuite; it only
//! needs the handful of operations below. Keeping the seam this small lets the
//! core run against the bundled in-memory backend (see [`crate::backend`]) and
//! keeps the protocol client swappable.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::types::{Conversation, GroupMessage, MetadataPatch};

/// Every call into the identity client is wrapped in this timeout; a stalled
/// network round-trip surfaces as an upstream failure instead of holding its
/// slot forever.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn with_upstream_timeout<T, F>(fut: F) -> Result<T, ClientError>
where
    F: std::future::Future<Output = Result<T, ClientError>>,
{
    match tokio::time::timeout(UPSTREAM_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Network("upstream request timed out".to_string())),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Signature does not verify against the issued challenge")]
    InvalidSignature,
    #[error("No conversation found with id: {0}")]
    UnknownConversation(String),
    #[error("One or more members do not have a protocol identity")]
    UnreachableMembers,
    #[error("Network failure: {0}")]
    Network(String),
}

/// Handle to a protocol identity bound (or pending) for one address.
///
/// Local reads (`conversation_by_id`, `conversations`, `messages`) return the
/// handle's replica view and may be stale until the matching `sync_*` call has
/// run. Callers own the sync-before-read discipline.
#[async_trait]
pub trait IdentityClient: Send + Sync + 'static {
    fn inbox_id(&self) -> String;
    fn installation_id(&self) -> String;
    /// The challenge string the wallet must sign to prove address ownership.
    fn signature_text(&self) -> String;
    fn is_registered(&self) -> bool;

    /// Bind the identity to the network with a signature over the current
    /// challenge. Registering an already-registered identity is an upstream
    /// error; the session layer is responsible for not calling twice.
    async fn register(&mut self, signature: &str) -> Result<(), ClientError>;

    /// Whether every listed address has a compatible protocol identity.
    async fn can_message(&self, addresses: &[String]) -> Result<bool, ClientError>;

    async fn create_group(
        &mut self,
        members: &[String],
        patch: MetadataPatch,
    ) -> Result<Conversation, ClientError>;

    /// Reconcile the conversation collection with the remote network.
    async fn sync_conversations(&mut self) -> Result<(), ClientError>;
    /// Reconcile a single conversation, including its message history.
    async fn sync_conversation(&mut self, group_id: &str) -> Result<(), ClientError>;

    fn conversation_by_id(&self, group_id: &str) -> Option<Conversation>;
    fn conversations(&self) -> Vec<Conversation>;
    fn messages(&self, group_id: &str) -> Vec<GroupMessage>;

    async fn update_name(&mut self, group_id: &str, name: &str) -> Result<(), ClientError>;
    async fn update_description(
        &mut self,
        group_id: &str,
        description: &str,
    ) -> Result<(), ClientError>;
    async fn update_image_url(&mut self, group_id: &str, image_url: &str)
        -> Result<(), ClientError>;

    async fn add_members(&mut self, group_id: &str, members: &[String])
        -> Result<(), ClientError>;
    async fn remove_members(
        &mut self,
        group_id: &str,
        members: &[String],
    ) -> Result<(), ClientError>;
    async fn add_admin(&mut self, group_id: &str, inbox_id: &str) -> Result<(), ClientError>;
    async fn remove_admin(&mut self, group_id: &str, inbox_id: &str) -> Result<(), ClientError>;

    async fn send_message(
        &mut self,
        group_id: &str,
        content: &str,
    ) -> Result<GroupMessage, ClientError>;
}

/// Opens (or reopens) the identity handle for an address at a storage
/// location. The session store guarantees the location exists and that at most
/// one handle per address is ever created.
#[async_trait]
pub trait ClientFactory: Send + Sync + 'static {
    type Client: IdentityClient;

    async fn open(&self, address: &str, db_path: &Path) -> Result<Self::Client, ClientError>;
}
