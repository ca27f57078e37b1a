//! Room keys received over secure channels.

mod helpers;

use e2ee_client::CryptoManager;
use e2ee_common::RawEvent;
use helpers::{local_manager, room, RemoteSender, SyncBuilder};

async fn bodies(manager: &CryptoManager, events: Vec<RawEvent>) -> Vec<Option<String>> {
    let general = room("general");
    let response = manager
        .receive_sync(SyncBuilder::new().timeline(&general, events).build())
        .await
        .unwrap();
    response.rooms.joined[&general]
        .timeline
        .iter()
        .map(|event| {
            event.encryption_info.as_ref()?;
            event.event.json()["content"]["body"]
                .as_str()
                .map(str::to_owned)
        })
        .collect()
}

#[tokio::test]
async fn test_same_key_twice_is_not_reinstalled() {
    let manager = local_manager().await;
    let general = room("general");
    let mut bob = RemoteSender::new("bob", "BOBDEV");
    let (_, session_key) = bob.start_session(&general);

    assert!(bob.offer_key(&manager, &general, &session_key).await);
    assert!(!bob.offer_key(&manager, &general, &session_key).await);
}

#[tokio::test]
async fn test_later_copy_does_not_cut_history() {
    let manager = local_manager().await;
    let general = room("general");
    let mut bob = RemoteSender::new("bob", "BOBDEV");
    bob.start_session(&general);
    bob.share_with(&manager, &general).await;

    let early = bob.message(&general, "early");
    let late = bob.message(&general, "late");
    let later_key = bob.session_key(&general);
    assert!(!bob.offer_key(&manager, &general, &later_key).await);

    assert_eq!(
        bodies(&manager, vec![early, late]).await,
        vec![Some("early".to_owned()), Some("late".to_owned())]
    );
}

#[tokio::test]
async fn test_earlier_copy_extends_history() {
    let manager = local_manager().await;
    let general = room("general");
    let mut bob = RemoteSender::new("bob", "BOBDEV");
    let (_, first_key) = bob.start_session(&general);

    let early = bob.message(&general, "early");
    assert!(bob.offer_key(&manager, &general, &bob.session_key(&general)).await);
    assert_eq!(bodies(&manager, vec![early.clone()]).await, vec![None]);

    assert!(bob.offer_key(&manager, &general, &first_key).await);
    assert_eq!(
        bodies(&manager, vec![early]).await,
        vec![Some("early".to_owned())]
    );
}
