//! Per-address identity sessions and the registration state machine.
//!
//! A session owns the exclusive identity handle for one address. The store
//! serializes every session-mutating call through a per-address mutex, so at
//! most one handle is ever created per address and storage location; creating
//! two handles against the same storage is undefined behavior in the external
//! protocol and must not be able to happen here.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::info;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::client::{with_upstream_timeout, ClientError, ClientFactory, IdentityClient};
use crate::signer::ChallengeSigner;
use crate::types::normalize_address;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to create storage for {address}: {source}")]
    Storage {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("No session found for address: {0}")]
    SessionNotFound(String),
    #[error("Signature does not verify against the issued challenge")]
    InvalidSignature,
    #[error("Identity is already registered")]
    AlreadyRegistered,
    #[error("Upstream protocol failure: {0}")]
    Upstream(String),
}

/// `Registered` is terminal; there is no transition out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RegistrationState {
    Unregistered,
    AwaitingSignature,
    Registered,
}

/// Session metadata returned to the transport layer. The challenge text is
/// always present, even for registered sessions; callers must check
/// `registration_state` before relying on it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub address: String,
    pub inbox_id: String,
    pub installation_id: String,
    pub signature_text: String,
    pub registration_state: RegistrationState,
}

pub struct Session<C> {
    client: C,
    state: RegistrationState,
    // Signature that completed registration, kept so identical repeats can be
    // told apart from conflicting re-registration attempts.
    accepted_signature: Option<String>,
}

impl<C: IdentityClient> Session<C> {
    fn new(client: C) -> Self {
        let state = if client.is_registered() {
            // Durable storage already held a registered identity.
            RegistrationState::Registered
        } else {
            RegistrationState::Unregistered
        };
        Session {
            client,
            state,
            accepted_signature: None,
        }
    }

    /// Hand the caller the challenge to sign. Issuing the challenge is what
    /// moves a fresh handle out of `Unregistered`.
    fn issue_challenge(&mut self) -> String {
        if self.state == RegistrationState::Unregistered {
            self.state = RegistrationState::AwaitingSignature;
        }
        self.client.signature_text()
    }

    fn info(&self, address: &str) -> SessionInfo {
        SessionInfo {
            address: address.to_string(),
            inbox_id: self.client.inbox_id(),
            installation_id: self.client.installation_id(),
            signature_text: self.client.signature_text(),
            registration_state: self.state,
        }
    }

    pub(crate) fn state(&self) -> RegistrationState {
        self.state
    }

    pub(crate) fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }
}

pub(crate) type SharedSession<C> = Arc<Mutex<Option<Session<C>>>>;

/// Process-wide map from address to identity session.
///
/// The outer map lock is only held long enough to fetch or insert a slot; all
/// real work happens under the slot's own mutex, which is what serializes
/// concurrent `open_session` calls (and every later mutation) per address.
pub struct SessionStore<F: ClientFactory> {
    factory: F,
    cache_dir: PathBuf,
    env_tag: String,
    sessions: Mutex<HashMap<String, SharedSession<F::Client>>>,
}

impl<F: ClientFactory> SessionStore<F> {
    pub fn new(factory: F, cache_dir: PathBuf, env_tag: String) -> Self {
        SessionStore {
            factory,
            cache_dir,
            env_tag,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    async fn slot(&self, address: &str) -> SharedSession<F::Client> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    pub(crate) async fn lookup(&self, address: &str) -> Option<SharedSession<F::Client>> {
        let sessions = self.sessions.lock().await;
        sessions.get(&normalize_address(address)).cloned()
    }

    /// Open (or return) the identity session for `address`.
    ///
    /// Idempotent: a second call for a known address returns the existing
    /// handle without touching storage. The first call creates the cache
    /// directory and the per-address storage location, then opens the handle
    /// through the factory.
    pub async fn open_session(&self, address: &str) -> Result<SessionInfo, SessionError> {
        let address = normalize_address(address);
        let slot = self.slot(&address).await;
        let mut guard = slot.lock().await;

        if let Some(session) = guard.as_mut() {
            session.issue_challenge();
            return Ok(session.info(&address));
        }

        let storage = |source| SessionError::Storage {
            address: address.clone(),
            source,
        };
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(storage)?;
        let db_path = self.cache_dir.join(format!("{address}-{}", self.env_tag));
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&db_path)
            .await
            .map_err(storage)?;

        let client = with_upstream_timeout(self.factory.open(&address, &db_path))
            .await
            .map_err(|err| SessionError::Upstream(err.to_string()))?;

        let mut session = Session::new(client);
        session.issue_challenge();
        info!(
            "Opened session for {address} (inbox {}, installation {})",
            session.client.inbox_id(),
            session.client.installation_id()
        );
        let session_info = session.info(&address);
        *guard = Some(session);
        Ok(session_info)
    }

    /// Attach the caller's signature over the issued challenge and bind the
    /// identity to the network.
    ///
    /// Registering an already-registered session with the identical signature
    /// is a no-op success; a different signature is rejected. On
    /// `InvalidSignature` or an upstream failure the state stays
    /// `AwaitingSignature` and the caller may retry.
    pub async fn complete_registration(
        &self,
        address: &str,
        signature: &str,
    ) -> Result<(), SessionError> {
        let address = normalize_address(address);
        let slot = self
            .lookup(&address)
            .await
            .ok_or_else(|| SessionError::SessionNotFound(address.clone()))?;
        let mut guard = slot.lock().await;
        let session = guard
            .as_mut()
            .ok_or_else(|| SessionError::SessionNotFound(address.clone()))?;

        if session.state == RegistrationState::Registered {
            if session.accepted_signature.as_deref() == Some(signature) {
                info!("Session for {address} is already registered");
                return Ok(());
            }
            return Err(SessionError::AlreadyRegistered);
        }

        match with_upstream_timeout(session.client.register(signature)).await {
            Ok(()) => {
                session.state = RegistrationState::Registered;
                session.accepted_signature = Some(signature.to_string());
                info!("Session for {address} registered successfully");
                Ok(())
            }
            Err(ClientError::InvalidSignature) => Err(SessionError::InvalidSignature),
            Err(err) => Err(SessionError::Upstream(err.to_string())),
        }
    }

    /// Delegated registration: sign the current challenge with the
    /// server-held key instead of a caller-supplied signature, then follow the
    /// normal registration path.
    pub async fn default_registration(
        &self,
        address: &str,
        signer: &ChallengeSigner,
    ) -> Result<(), SessionError> {
        let address = normalize_address(address);
        let challenge = {
            let slot = self
                .lookup(&address)
                .await
                .ok_or_else(|| SessionError::SessionNotFound(address.clone()))?;
            let mut guard = slot.lock().await;
            let session = guard
                .as_mut()
                .ok_or_else(|| SessionError::SessionNotFound(address.clone()))?;
            session.issue_challenge()
        };

        let signature = signer
            .sign(&challenge)
            .map_err(|err| SessionError::Upstream(err.to_string()))?;
        self.complete_registration(&address, &signature).await
    }

    pub async fn registration_state(&self, address: &str) -> Option<RegistrationState> {
        let slot = self.lookup(address).await?;
        let guard = slot.lock().await;
        guard.as_ref().map(|session| session.state)
    }
}
