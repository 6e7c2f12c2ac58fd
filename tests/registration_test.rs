use std::path::PathBuf;
use std::sync::Arc;

use alloy::hex;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use uuid::Uuid;

use mls_bridge::backend::{InMemoryFactory, InMemoryNetwork};
use mls_bridge::session::{RegistrationState, SessionError, SessionStore};
use mls_bridge::signer::ChallengeSigner;

fn store_fixture() -> (Arc<SessionStore<InMemoryFactory>>, PathBuf) {
    let network = InMemoryNetwork::new();
    let factory = InMemoryFactory::new(network);
    let cache_dir = std::env::temp_dir().join(format!("mls-bridge-test-{}", Uuid::new_v4()));
    let store = Arc::new(SessionStore::new(
        factory,
        cache_dir.clone(),
        "test".to_string(),
    ));
    (store, cache_dir)
}

fn sign_challenge(signer: &PrivateKeySigner, challenge: &str) -> String {
    let signature = signer
        .sign_message_sync(challenge.as_bytes())
        .expect("Failed to sign challenge");
    hex::encode_prefixed(signature.as_bytes())
}

#[tokio::test]
async fn test_open_session_is_idempotent() {
    let (store, cache_dir) = store_fixture();
    let wallet = PrivateKeySigner::random();
    let address = wallet.address().to_string();

    let first = store
        .open_session(&address)
        .await
        .expect("Failed to open session");
    assert_eq!(first.registration_state, RegistrationState::AwaitingSignature);
    assert!(!first.signature_text.is_empty());
    assert!(cache_dir.join(format!("{}-test", first.address)).exists());

    // Second call (even with different casing) returns the same identity.
    let second = store
        .open_session(&address.to_uppercase())
        .await
        .expect("Failed to reopen session");
    assert_eq!(first.inbox_id, second.inbox_id);
    assert_eq!(first.installation_id, second.installation_id);
    assert_eq!(first.signature_text, second.signature_text);
}

#[tokio::test]
async fn test_challenge_round_trip_registers() {
    let (store, _cache_dir) = store_fixture();
    let wallet = PrivateKeySigner::random();
    let address = wallet.address().to_string();

    let info = store
        .open_session(&address)
        .await
        .expect("Failed to open session");
    let signature = sign_challenge(&wallet, &info.signature_text);
    store
        .complete_registration(&address, &signature)
        .await
        .expect("Failed to register");

    assert_eq!(
        store.registration_state(&address).await,
        Some(RegistrationState::Registered)
    );
}

#[tokio::test]
async fn test_invalid_signature_then_retry() {
    let (store, _cache_dir) = store_fixture();
    let wallet = PrivateKeySigner::random();
    let stranger = PrivateKeySigner::random();
    let address = wallet.address().to_string();

    let info = store
        .open_session(&address)
        .await
        .expect("Failed to open session");

    // A signature from a different wallet must be rejected.
    let forged = sign_challenge(&stranger, &info.signature_text);
    let err = store
        .complete_registration(&address, &forged)
        .await
        .expect_err("Forged signature was accepted");
    assert!(matches!(err, SessionError::InvalidSignature));
    assert_eq!(
        store.registration_state(&address).await,
        Some(RegistrationState::AwaitingSignature)
    );

    // The session stays usable for a correct retry.
    let signature = sign_challenge(&wallet, &info.signature_text);
    store
        .complete_registration(&address, &signature)
        .await
        .expect("Retry failed");
    assert_eq!(
        store.registration_state(&address).await,
        Some(RegistrationState::Registered)
    );
}

#[tokio::test]
async fn test_repeat_identical_signature_is_noop() {
    let (store, _cache_dir) = store_fixture();
    let wallet = PrivateKeySigner::random();
    let address = wallet.address().to_string();

    let info = store
        .open_session(&address)
        .await
        .expect("Failed to open session");
    let signature = sign_challenge(&wallet, &info.signature_text);
    store
        .complete_registration(&address, &signature)
        .await
        .expect("Failed to register");

    // The backend rejects a second network registration outright, so this
    // succeeding proves the store short-circuits the repeat.
    store
        .complete_registration(&address, &signature)
        .await
        .expect("Identical repeat should be a no-op");

    // A different signature on a registered session is a conflict.
    let err = store
        .complete_registration(&address, "0xdeadbeef")
        .await
        .expect_err("Conflicting signature was accepted");
    assert!(matches!(err, SessionError::AlreadyRegistered));
}

#[tokio::test]
async fn test_default_registration_with_server_wallet() {
    let (store, _cache_dir) = store_fixture();
    let server_signer = ChallengeSigner::from_key(
        "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d",
    )
    .expect("Failed to parse key");

    // Recovery-based verification means the delegated path only works for the
    // server wallet's own address.
    let address = server_signer.address();
    store
        .open_session(&address)
        .await
        .expect("Failed to open session");
    store
        .default_registration(&address, &server_signer)
        .await
        .expect("Default registration failed");
    assert_eq!(
        store.registration_state(&address).await,
        Some(RegistrationState::Registered)
    );
}

#[tokio::test]
async fn test_registration_without_session_fails() {
    let (store, _cache_dir) = store_fixture();
    let err = store
        .complete_registration("0x0000000000000000000000000000000000000001", "0x00")
        .await
        .expect_err("Registration without a session succeeded");
    assert!(matches!(err, SessionError::SessionNotFound(_)));
}
