use std::sync::Arc;
use std::time::Duration;

use alloy::hex;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use uuid::Uuid;

use mls_bridge::backend::{InMemoryFactory, InMemoryNetwork};
use mls_bridge::broadcast::{BroadcastEvent, BroadcastHub};
use mls_bridge::service::GroupService;
use mls_bridge::session::SessionStore;
use mls_bridge::types::MetadataPatch;

fn fixture() -> (
    Arc<SessionStore<InMemoryFactory>>,
    GroupService<InMemoryFactory>,
    BroadcastHub,
) {
    let network = InMemoryNetwork::new();
    let factory = InMemoryFactory::new(network);
    let cache_dir = std::env::temp_dir().join(format!("mls-bridge-test-{}", Uuid::new_v4()));
    let store = Arc::new(SessionStore::new(factory, cache_dir, "test".to_string()));
    let hub = BroadcastHub::new(16);
    let service = GroupService::new(store.clone(), hub.clone());
    (store, service, hub)
}

async fn register_wallet(store: &SessionStore<InMemoryFactory>) -> String {
    let wallet = PrivateKeySigner::random();
    let address = wallet.address().to_string();
    let info = store
        .open_session(&address)
        .await
        .expect("Failed to open session");
    let signature = wallet
        .sign_message_sync(info.signature_text.as_bytes())
        .expect("Failed to sign challenge");
    store
        .complete_registration(&address, &hex::encode_prefixed(signature.as_bytes()))
        .await
        .expect("Failed to register");
    address
}

#[tokio::test]
async fn test_group_creation_fans_out_to_all_subscribers() {
    let (store, service, hub) = fixture();
    let alice = register_wallet(&store).await;

    let mut first = hub.subscribe();
    let mut second = hub.subscribe();

    let conversation = service
        .create_group(
            &alice,
            vec![],
            MetadataPatch {
                name: Some("Announcements".to_string()),
                description: None,
                image_url: None,
            },
        )
        .await
        .expect("Failed to create group");

    for subscriber in [&mut first, &mut second] {
        let event = subscriber.recv().await.expect("No event received");
        match event {
            BroadcastEvent::NewGroup {
                group_id,
                conversation: payload,
            } => {
                assert_eq!(group_id, conversation.id);
                assert_eq!(payload.name, "Announcements");
            }
            other => panic!("Unexpected event: {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_message_event_carries_group_name_at_send_time() {
    let (store, service, hub) = fixture();
    let alice = register_wallet(&store).await;
    let conversation = service
        .create_group(
            &alice,
            vec![],
            MetadataPatch {
                name: Some("Ops".to_string()),
                description: None,
                image_url: None,
            },
        )
        .await
        .expect("Failed to create group");

    let mut subscriber = hub.subscribe();
    service
        .send_message(&alice, &conversation.id, "deploy done")
        .await
        .expect("Failed to send");

    let event = subscriber.recv().await.expect("No event received");
    match event {
        BroadcastEvent::NewMessage {
            group_id,
            group_name,
            sender,
            content,
        } => {
            assert_eq!(group_id, conversation.id);
            assert_eq!(group_name, "Ops");
            assert_eq!(sender, alice.to_lowercase());
            assert_eq!(content, "deploy done");
        }
        other => panic!("Unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_late_subscriber_misses_earlier_events() {
    let (store, service, hub) = fixture();
    let alice = register_wallet(&store).await;
    service
        .create_group(&alice, vec![], MetadataPatch::default())
        .await
        .expect("Failed to create group");

    // Subscribed after the creation event fired; nothing is replayed.
    let mut late = hub.subscribe();
    let quiet = tokio::time::timeout(Duration::from_millis(50), late.recv()).await;
    assert!(quiet.is_err());
}

#[tokio::test]
async fn test_reads_do_not_broadcast() {
    let (store, service, hub) = fixture();
    let alice = register_wallet(&store).await;
    let conversation = service
        .create_group(&alice, vec![], MetadataPatch::default())
        .await
        .expect("Failed to create group");

    let mut subscriber = hub.subscribe();
    service
        .list_conversations(&alice)
        .await
        .expect("Failed to list conversations");
    service
        .list_messages(&alice, &conversation.id)
        .await
        .expect("Failed to list messages");

    let quiet = tokio::time::timeout(Duration::from_millis(50), subscriber.recv()).await;
    assert!(quiet.is_err());
}
