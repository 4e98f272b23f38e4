use std::sync::Arc;

use frames::PostUpdate;

use super::*;
use crate::services::auth::{Identity, Role};
use crate::state::test_helpers::{seed_thread, test_app_state, test_app_state_with_store, test_session, test_session_as};
use crate::store::{MemoryStore, NewPost};

fn request(board: &str, threads: &[(ThreadId, u64)]) -> SyncRequest {
    SyncRequest { board: board.into(), syncs: threads.iter().copied().collect(), live: false }
}

fn backlog(events: &[Event]) -> Vec<PostUpdate> {
    match &events[0] {
        Event::Backlog(entries) => entries.iter().map(|e| e.update().unwrap()).collect(),
        other => panic!("expected backlog first, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_sync_replies_backlog_synced_and_config_hash() {
    let state = test_app_state();
    let (mut session, _rx) = test_session(&state).await;

    let events = synchronize(&state, &mut session, "c1", request("b", &[])).await.unwrap();

    assert_eq!(events[0], Event::Backlog(vec![]));
    assert_eq!(events[1], Event::Synced);
    assert!(matches!(events[2], Event::ConfigHash { .. }));
    assert!(session.is_synced());
    assert_eq!(session.board.as_deref(), Some("b"));
    assert_eq!(session.client_id.as_deref(), Some("c1"));
}

#[tokio::test]
async fn backlog_starts_after_seen_count() {
    let state = test_app_state();
    let thread = seed_thread(&state, "a").await;
    let post = NewPost { nonce: "n".into(), body: "x".into(), editing: true, ..NewPost::default() };
    let created = state.store.insert_post(uuid::Uuid::nil(), "a", thread, post).await.unwrap();
    state.store.append_text(uuid::Uuid::nil(), created.id, "y").await.unwrap();
    let (mut session, _rx) = test_session(&state).await;

    let events = synchronize(&state, &mut session, "c1", request("a", &[(thread, 1)])).await.unwrap();

    let updates = backlog(&events);
    assert_eq!(updates.len(), 2);
    assert!(matches!(updates[0], PostUpdate::InsertPost(_)));
    assert_eq!(updates[1], PostUpdate::Append { id: created.id, text: "y".into() });
    assert_eq!(session.watch.single_thread(), Some(thread));
}

#[tokio::test]
async fn duplicate_client_id_is_refused() {
    let state = test_app_state();
    let (mut first, _rx1) = test_session(&state).await;
    let (mut second, _rx2) = test_session(&state).await;

    synchronize(&state, &mut first, "c1", request("a", &[])).await.unwrap();
    let err = synchronize(&state, &mut second, "c1", request("a", &[])).await.unwrap_err();

    assert!(matches!(err, SyncError::Identity(_)));
    assert_eq!(err.close_code(), Some(CloseCode::Policy));
    assert!(!second.is_synced());
}

#[tokio::test]
async fn repeated_synchronize_with_same_id_resyncs() {
    let state = test_app_state();
    let (mut session, _rx) = test_session(&state).await;
    synchronize(&state, &mut session, "c1", request("a", &[])).await.unwrap();

    synchronize(&state, &mut session, "c1", request("b", &[])).await.unwrap();
    assert_eq!(session.board.as_deref(), Some("b"));

    let err = synchronize(&state, &mut session, "c2", request("b", &[])).await.unwrap_err();
    assert!(matches!(err, SyncError::Protocol(_)));
}

#[tokio::test]
async fn resync_requires_prior_synchronize() {
    let state = test_app_state();
    let (mut session, _rx) = test_session(&state).await;
    let err = resync(&state, &mut session, request("a", &[])).await.unwrap_err();
    assert_eq!(err.error_code(), "E_PROTOCOL");
}

#[tokio::test]
async fn unknown_board_is_denied() {
    let state = test_app_state();
    let (mut session, _rx) = test_session(&state).await;
    let err = synchronize(&state, &mut session, "c1", request("zz", &[])).await.unwrap_err();
    assert!(matches!(err, SyncError::Denied(_)));
    assert_eq!(session.state, SyncState::Unsynced);
}

#[tokio::test]
async fn staff_board_needs_staff_identity() {
    let state = test_app_state();
    let (mut anon, _rx1) = test_session(&state).await;
    let err = synchronize(&state, &mut anon, "c1", request("staff", &[])).await.unwrap_err();
    assert!(matches!(err, SyncError::Denied(_)));

    let staff = Identity::Staff { user_id: "mia".into(), role: Role::Moderator };
    let (mut session, _rx2) = test_session_as(&state, staff).await;
    synchronize(&state, &mut session, "c2", request("staff", &[])).await.unwrap();
    assert!(session.is_synced());
}

#[tokio::test]
async fn invalid_threads_are_dropped_below_threshold() {
    let state = test_app_state();
    let thread = seed_thread(&state, "a").await;
    let (mut session, _rx) = test_session(&state).await;

    synchronize(&state, &mut session, "c1", request("a", &[(thread, 0), (9000, 0)])).await.unwrap();
    assert_eq!(session.watch.single_thread(), Some(thread));
}

#[tokio::test]
async fn two_invalid_of_five_threads_watches_the_other_three() {
    let state = test_app_state();
    let mut valid = Vec::new();
    for _ in 0..3 {
        valid.push(seed_thread(&state, "a").await);
    }
    let elsewhere = seed_thread(&state, "b").await;
    let (mut session, _rx) = test_session(&state).await;

    let mut syncs: Vec<(ThreadId, u64)> = valid.iter().map(|&t| (t, 0)).collect();
    syncs.push((elsewhere, 0));
    syncs.push((9000, 0));
    synchronize(&state, &mut session, "c1", request("a", &syncs)).await.unwrap();

    let expected: BTreeSet<ThreadId> = valid.into_iter().collect();
    assert_eq!(session.watch, WatchSet::Threads(expected));
}

#[tokio::test]
async fn all_invalid_threads_fail_the_sync() {
    let state = test_app_state();
    let other = seed_thread(&state, "b").await;
    let (mut session, _rx) = test_session(&state).await;

    let err = synchronize(&state, &mut session, "c1", request("a", &[(other, 0), (9000, 0)]))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::InvalidThreads { requested: 2, dropped: 2 }));
    assert_eq!(session.subscription_id(), None);
}

#[tokio::test]
async fn too_many_invalid_threads_fail_the_sync() {
    let state = test_app_state();
    let thread = seed_thread(&state, "a").await;
    let (mut session, _rx) = test_session(&state).await;

    let mut syncs: Vec<(ThreadId, u64)> = (0..11).map(|i| (10_000 + i, 0)).collect();
    syncs.push((thread, 0));
    let err = synchronize(&state, &mut session, "c1", request("a", &syncs)).await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidThreads { requested: 12, dropped: 11 }));
}

#[tokio::test]
async fn resync_replaces_the_subscription() {
    let store = Arc::new(MemoryStore::new());
    let state = test_app_state_with_store(store.clone());
    let a = seed_thread(&state, "a").await;
    let b = seed_thread(&state, "a").await;
    let (mut session, _rx) = test_session(&state).await;

    synchronize(&state, &mut session, "c1", request("a", &[(a, 0)])).await.unwrap();
    let first = session.subscription_id();
    resync(&state, &mut session, request("a", &[(b, 0)])).await.unwrap();

    assert_ne!(session.subscription_id(), first);
    assert_eq!(session.watch.single_thread(), Some(b));
    assert_eq!(store.subscriber_count(), 1);
}

#[tokio::test]
async fn live_mode_ignores_syncs_and_has_no_backlog() {
    let state = test_app_state();
    let thread = seed_thread(&state, "a").await;
    let (mut session, _rx) = test_session(&state).await;

    let mut req = request("a", &[(thread, 0)]);
    req.live = true;
    let events = synchronize(&state, &mut session, "c1", req).await.unwrap();

    assert_eq!(events[0], Event::Backlog(vec![]));
    assert_eq!(session.watch, WatchSet::Live);
}

#[tokio::test]
async fn desync_drops_subscription() {
    let store = Arc::new(MemoryStore::new());
    let state = test_app_state_with_store(store.clone());
    let thread = seed_thread(&state, "a").await;
    let (mut session, _rx) = test_session(&state).await;
    synchronize(&state, &mut session, "c1", request("a", &[(thread, 0)])).await.unwrap();
    assert_eq!(store.subscriber_count(), 1);

    desync(&mut session);
    assert!(!session.is_synced());
    assert_eq!(store.subscriber_count(), 0);
}
