//! Sync processing through the crypto manager.

mod helpers;

use std::sync::Arc;

use e2ee_client::{KeyStore, LocalTrust, PipelineConfig};
use e2ee_common::{AlgorithmInfo, DecryptionFailure, SyncRoomEvent, VerificationState, ROOM_ENCRYPTED, ROOM_KEY};
use helpers::{
    faulty_store, local_manager, local_manager_with, plain_message, room, RemoteSender, SyncBuilder,
};

fn body(event: &SyncRoomEvent) -> &str {
    event.event.json()["content"]["body"]
        .as_str()
        .expect("event has no body")
}

fn message_index(event: &SyncRoomEvent) -> u32 {
    let info = event.encryption_info.as_ref().expect("event not decrypted");
    match &info.algorithm_info {
        AlgorithmInfo::MegolmV1AesSha2 { message_index, .. } => *message_index,
    }
}

fn state(event: &SyncRoomEvent) -> VerificationState {
    event
        .encryption_info
        .as_ref()
        .expect("event not decrypted")
        .verification_state
}

#[tokio::test]
async fn test_every_event_comes_back_in_order() {
    let manager = local_manager().await;
    let general = room("general");

    let mut bob = RemoteSender::new("bob", "BOBDEV");
    manager
        .receive_device_keys(vec![bob.device_keys()])
        .await
        .unwrap();
    bob.start_session(&general);
    bob.share_with(&manager, &general).await;

    // Shares a key but never uploads device keys.
    let mut ghost = RemoteSender::new("ghost", "GHOSTDEV");
    ghost.start_session(&general);
    ghost.share_with(&manager, &general).await;

    let events = vec![
        plain_message("carol", "plain"),
        bob.message(&general, "one"),
        ghost.message(&general, "boo"),
        bob.message(&general, "two"),
    ];
    let response = manager
        .receive_sync(SyncBuilder::new().timeline(&general, events).build())
        .await
        .unwrap();

    assert_eq!(response.timeline_len(), 4);
    let timeline = &response.rooms.joined[&general].timeline;

    assert!(timeline[0].encryption_info.is_none());
    assert!(!timeline[0].is_undecrypted());
    assert_eq!(body(&timeline[0]), "plain");

    assert_eq!(body(&timeline[1]), "one");
    assert_eq!(state(&timeline[1]), VerificationState::Unverified);

    assert!(timeline[2].is_undecrypted());
    assert_eq!(timeline[2].event.event_type(), Some(ROOM_ENCRYPTED));
    assert_eq!(
        timeline[2].unable_to_decrypt.as_ref().unwrap().failure,
        DecryptionFailure::UnknownDevice
    );

    assert_eq!(body(&timeline[3]), "two");
    assert_eq!(message_index(&timeline[3]), 1);
}

#[tokio::test]
async fn test_unknown_devices_decrypt_when_allowed() {
    let config = PipelineConfig {
        decrypt_unknown_devices: true,
        ..PipelineConfig::default()
    };
    let manager = local_manager_with(helpers::memory_store().await, config).await;
    let general = room("general");

    let mut ghost = RemoteSender::new("ghost", "GHOSTDEV");
    ghost.start_session(&general);
    ghost.share_with(&manager, &general).await;

    let response = manager
        .receive_sync(
            SyncBuilder::new()
                .timeline(&general, vec![ghost.message(&general, "boo")])
                .build(),
        )
        .await
        .unwrap();
    let event = &response.rooms.joined[&general].timeline[0];
    assert_eq!(body(event), "boo");
    assert_eq!(state(event), VerificationState::UnknownDevice);
}

#[tokio::test]
async fn test_missing_session_leaves_event_encrypted() {
    let manager = local_manager().await;
    let general = room("general");

    let mut bob = RemoteSender::new("bob", "BOBDEV");
    manager
        .receive_device_keys(vec![bob.device_keys()])
        .await
        .unwrap();
    bob.start_session(&general);

    let response = manager
        .receive_sync(
            SyncBuilder::new()
                .timeline(&general, vec![bob.message(&general, "lost")])
                .build(),
        )
        .await
        .unwrap();
    let event = &response.rooms.joined[&general].timeline[0];
    let failure = event.unable_to_decrypt.as_ref().unwrap();
    assert_eq!(failure.failure, DecryptionFailure::SessionNotFound);
    assert_eq!(failure.session_id.as_deref(), Some(bob.session_id(&general).as_str()));
}

#[tokio::test]
async fn test_replayed_ciphertext_is_idempotent() {
    let manager = local_manager().await;
    let general = room("general");

    let mut bob = RemoteSender::new("bob", "BOBDEV");
    manager
        .receive_device_keys(vec![bob.device_keys()])
        .await
        .unwrap();
    bob.start_session(&general);
    bob.share_with(&manager, &general).await;

    let first = bob.message(&general, "first");
    let second = bob.message(&general, "second");

    let response = manager
        .receive_sync(
            SyncBuilder::new()
                .timeline(&general, vec![first.clone(), second, first.clone()])
                .build(),
        )
        .await
        .unwrap();
    let timeline = &response.rooms.joined[&general].timeline;
    assert_eq!(body(&timeline[0]), "first");
    assert_eq!(body(&timeline[2]), "first");
    assert_eq!(message_index(&timeline[0]), message_index(&timeline[2]));

    // Replaying in a later batch does not move the counter either.
    manager
        .receive_sync(SyncBuilder::new().timeline(&general, vec![first]).build())
        .await
        .unwrap();

    let session = manager
        .cache()
        .get_cached(&bob.curve25519_key(), &bob.session_id(&general))
        .await
        .unwrap();
    assert_eq!(session.lock().await.message_counter(), 1);
}

#[tokio::test]
async fn test_trust_changes_do_not_rewrite_delivered_events() {
    let manager = local_manager().await;
    let general = room("general");

    let mut bob = RemoteSender::new("bob", "BOBDEV");
    manager
        .receive_device_keys(vec![bob.device_keys()])
        .await
        .unwrap();
    bob.start_session(&general);
    bob.share_with(&manager, &general).await;

    manager
        .set_local_trust(&bob.user_id, &bob.device_id, LocalTrust::Verified)
        .await
        .unwrap();
    let earlier = manager
        .receive_sync(
            SyncBuilder::new()
                .timeline(&general, vec![bob.message(&general, "e1")])
                .build(),
        )
        .await
        .unwrap();

    manager
        .set_local_trust(&bob.user_id, &bob.device_id, LocalTrust::BlackListed)
        .await
        .unwrap();
    let later = manager
        .receive_sync(
            SyncBuilder::new()
                .timeline(&general, vec![bob.message(&general, "e2")])
                .build(),
        )
        .await
        .unwrap();

    assert_eq!(
        state(&earlier.rooms.joined[&general].timeline[0]),
        VerificationState::Verified
    );
    assert_eq!(
        state(&later.rooms.joined[&general].timeline[0]),
        VerificationState::Unverified
    );
}

#[tokio::test]
async fn test_one_store_write_per_sync() {
    let store = faulty_store().await;
    let manager = local_manager_with(
        Arc::clone(&store) as Arc<dyn KeyStore>,
        PipelineConfig::default(),
    )
    .await;
    let (general, random) = (room("general"), room("random"));

    let mut bob = RemoteSender::new("bob", "BOBDEV");
    manager
        .receive_device_keys(vec![bob.device_keys()])
        .await
        .unwrap();
    for room_id in [&general, &random] {
        bob.start_session(room_id);
        bob.share_with(&manager, room_id).await;
    }

    let mut builder = SyncBuilder::new();
    for room_id in [&general, &random] {
        let events = (0..3)
            .map(|i| bob.message(room_id, &format!("message {i}")))
            .collect();
        builder = builder.timeline(room_id, events);
    }

    let before = store.backend().writes();
    let response = manager.receive_sync(builder.build()).await.unwrap();
    assert_eq!(response.timeline_len(), 6);
    assert_eq!(store.backend().writes(), before + 1);

    let stored = store
        .get_session(&bob.curve25519_key(), &bob.session_id(&random))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.message_counter(), 2);
    assert!(store.last_sync_token().await.unwrap().is_some());
}

#[tokio::test]
async fn test_failed_commit_surfaces_and_next_sync_recovers() {
    let store = faulty_store().await;
    let manager = local_manager_with(
        Arc::clone(&store) as Arc<dyn KeyStore>,
        PipelineConfig::default(),
    )
    .await;
    let general = room("general");

    let mut bob = RemoteSender::new("bob", "BOBDEV");
    manager
        .receive_device_keys(vec![bob.device_keys()])
        .await
        .unwrap();
    bob.start_session(&general);
    bob.share_with(&manager, &general).await;

    store.backend().fail_writes(true);
    let result = manager
        .receive_sync(
            SyncBuilder::new()
                .timeline(&general, vec![bob.message(&general, "dropped")])
                .build(),
        )
        .await;
    assert!(result.is_err());
    assert_eq!(store.last_sync_token().await.unwrap(), None);

    store.backend().fail_writes(false);
    let response = manager
        .receive_sync(
            SyncBuilder::new()
                .timeline(&general, vec![bob.message(&general, "kept")])
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(body(&response.rooms.joined[&general].timeline[0]), "kept");
    assert!(store.last_sync_token().await.unwrap().is_some());
}

#[tokio::test]
async fn test_in_band_rekey_within_one_batch() {
    let manager = local_manager().await;
    let general = room("general");

    let mut bob = RemoteSender::new("bob", "BOBDEV");
    manager
        .receive_device_keys(vec![bob.device_keys()])
        .await
        .unwrap();
    bob.start_session(&general);
    bob.share_with(&manager, &general).await;
    let old_session = bob.session_id(&general);

    let before = bob.message(&general, "before");
    let rekey = bob.rekey(&general);
    let after = bob.message(&general, "after");
    let new_session = bob.session_id(&general);
    assert_ne!(old_session, new_session);

    let response = manager
        .receive_sync(
            SyncBuilder::new()
                .timeline(&general, vec![before, rekey, after])
                .build(),
        )
        .await
        .unwrap();
    let timeline = &response.rooms.joined[&general].timeline;
    assert_eq!(body(&timeline[0]), "before");
    assert_eq!(timeline[1].event.event_type(), Some(ROOM_KEY));
    assert_eq!(body(&timeline[2]), "after");

    let stored = manager
        .store()
        .get_session(&bob.curve25519_key(), &new_session)
        .await
        .unwrap();
    assert!(stored.is_some());
}

#[tokio::test]
async fn test_unread_counts_replaced_and_dropped_on_leave() {
    let manager = local_manager().await;
    let general = room("general");
    let quiet = room("quiet");

    manager
        .receive_sync(
            SyncBuilder::new()
                .unread(&general, 2, 5)
                .unread(&quiet, 0, 1)
                .build(),
        )
        .await
        .unwrap();
    let counts = manager.unread_notifications(&general).unwrap();
    assert_eq!((counts.highlight_count, counts.notification_count), (2, 5));

    let response = manager
        .receive_sync(SyncBuilder::new().unread(&general, 0, 1).build())
        .await
        .unwrap();
    assert_eq!(
        response.rooms.joined[&general].unread_notifications.notification_count,
        1
    );
    let counts = manager.unread_notifications(&general).unwrap();
    assert_eq!((counts.highlight_count, counts.notification_count), (0, 1));

    // Rooms absent from a batch keep their last counts.
    assert!(manager.unread_notifications(&quiet).is_some());

    manager
        .receive_sync(SyncBuilder::new().left(&quiet, Vec::new()).build())
        .await
        .unwrap();
    assert!(manager.unread_notifications(&quiet).is_none());
}
