//! Session cache concurrency and counter monotonicity.

mod helpers;

use std::sync::Arc;

use e2ee_client::{CacheError, Changes, InboundSession, KeyStore, OutboundSession, SessionCache};
use helpers::{faulty_store, memory_store, room, user};
use proptest::prelude::*;
use tokio::sync::Mutex;

fn inbound_for(outbound: &OutboundSession, session_key: &str) -> InboundSession {
    InboundSession::new(
        outbound.room_id().clone(),
        user("bob"),
        "bob-curve25519",
        "bob-ed25519",
        session_key,
    )
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_load_once() {
    let store = faulty_store().await;
    let outbound = OutboundSession::new(room("general"));
    let session = inbound_for(&outbound, &outbound.session_key());
    let session_id = session.session_id().to_owned();
    store
        .save_changes(Changes {
            inbound_sessions: vec![Arc::new(Mutex::new(session))],
            ..Changes::default()
        })
        .await
        .unwrap();

    let reads_before = store.backend().session_reads();
    let cache = Arc::new(SessionCache::new(Arc::clone(&store) as Arc<dyn KeyStore>));
    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let session_id = session_id.clone();
            tokio::spawn(async move {
                cache
                    .get_or_load("bob-curve25519", &session_id)
                    .await
                    .unwrap()
                    .unwrap()
            })
        })
        .collect();

    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap());
    }
    assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
    assert_eq!(store.backend().session_reads() - reads_before, 1);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn test_unknown_session_is_not_cached() {
    let store = faulty_store().await;
    let cache = SessionCache::new(Arc::clone(&store) as Arc<dyn KeyStore>);

    assert!(cache.get_or_load("nobody", "nothing").await.unwrap().is_none());
    assert!(cache.get_or_load("nobody", "nothing").await.unwrap().is_none());
    assert_eq!(store.backend().session_reads(), 2);
    assert!(cache.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_leave_no_slots() {
    let store = faulty_store().await;
    let cache = Arc::new(SessionCache::new(Arc::clone(&store) as Arc<dyn KeyStore>));
    let tasks: Vec<_> = (0..64)
        .map(|i| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                // Half the tasks race on the same id.
                let session_id = if i % 2 == 0 { "shared".to_owned() } else { format!("miss-{i}") };
                cache.get_or_load("nobody", &session_id).await.unwrap()
            })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap().is_none());
    }
    assert!(cache.is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn counter_never_moves_backwards(order in Just((0..12u32).collect::<Vec<_>>()).prop_shuffle()) {
        tokio_test::block_on(async {
            let cache = SessionCache::new(memory_store().await);
            let mut outbound = OutboundSession::new(room("general"));
            let first_key = outbound.session_key();
            let handle = cache.insert(inbound_for(&outbound, &first_key)).await.unwrap();
            let ciphertexts: Vec<String> = (0..12)
                .map(|i| outbound.encrypt(&format!("message {i}")))
                .collect();

            let mut highest = 0;
            for index in order {
                let mut session = handle.lock().await;
                let decrypted = session.decrypt(&ciphertexts[index as usize]).unwrap();
                assert_eq!(decrypted.message_index, index);
                highest = highest.max(index);
                assert_eq!(session.message_counter(), highest);
                drop(session);

                if highest > 0 {
                    let stale = inbound_for(&outbound, &first_key);
                    let result = cache.insert(stale).await;
                    assert!(
                        matches!(result, Err(CacheError::Rollback { current, attempted: 0, .. }) if current == highest),
                        "fresh copy replaced an advanced session"
                    );
                }
            }
            assert_eq!(handle.lock().await.message_counter(), 11);
        });
    }
}
