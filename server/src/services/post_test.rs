use std::sync::Arc;
use std::time::Duration;

use frames::{PostUpdate, SyncRequest};
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::*;
use crate::config::ServerConfig;
use crate::services::auth::Identity;
use crate::services::sync::synchronize;
use crate::state::test_helpers::{MOD_TOKEN, seed_thread, test_app_state, test_app_state_with_store, test_config, test_session};
use crate::store::{FeedItem, MemoryStore, Storage};

async fn synced(state: &AppState, client: &str, thread: ThreadId) -> (Session, mpsc::Receiver<FeedItem>) {
    let (mut session, rx) = test_session(state).await;
    let req = SyncRequest { board: "a".into(), syncs: [(thread, 0)].into_iter().collect(), live: false };
    synchronize(state, &mut session, client, req).await.unwrap();
    (session, rx)
}

fn post(frag: &str) -> PostRequest {
    let mut req = PostRequest::new(format!("nonce-{frag}"));
    req.frag = Some(frag.into());
    req
}

async fn next_update(rx: &mut mpsc::Receiver<FeedItem>) -> PostUpdate {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("feed timed out")
        .expect("feed closed")
        .update
}

async fn allocate(state: &AppState, session: &mut Session, frag: &str) -> u64 {
    match handle(state, session, Command::InsertPost(post(frag))).await.unwrap().as_slice() {
        [Event::PostId { id, .. }] => *id,
        other => panic!("expected post id, got {other:?}"),
    }
}

#[tokio::test]
async fn insert_post_allocates_and_fans_out_to_watchers() {
    let state = test_app_state();
    let thread = seed_thread(&state, "a").await;
    let (mut author, mut author_rx) = synced(&state, "c1", thread).await;
    let (watcher, mut watcher_rx) = synced(&state, "c2", thread).await;

    let events = handle(&state, &mut author, Command::InsertPost(post("hi"))).await.unwrap();

    let Event::PostId { id, op } = events[0] else {
        panic!("expected post id");
    };
    assert_eq!(op, thread);
    assert_eq!(author.post.as_ref().map(|p| p.chars), Some(2));
    assert_eq!(state.registry.post_owner(id).await, Some(author.conn_id));

    let item = timeout(Duration::from_millis(500), watcher_rx.recv()).await.unwrap().unwrap();
    assert!(watcher.accepts(&item));
    assert!(matches!(item.update, PostUpdate::InsertPost(ref s) if s.body == "hi" && s.editing));

    // The author's own feed carries the update but the session filters it.
    let own = author_rx.recv().await.unwrap();
    assert!(!author.accepts(&own));
}

#[tokio::test]
async fn target_thread_defaults_to_single_watched_thread() {
    let state = test_app_state();
    let thread = seed_thread(&state, "a").await;
    let (mut session, _rx) = synced(&state, "c1", thread).await;

    let mut req = post("x");
    req.op = None;
    let events = handle(&state, &mut session, Command::InsertPost(req)).await.unwrap();
    assert!(matches!(events[0], Event::PostId { op, .. } if op == thread));
}

#[tokio::test]
async fn commands_before_sync_are_protocol_errors() {
    let state = test_app_state();
    let (mut session, _rx) = test_session(&state).await;
    let err = handle(&state, &mut session, Command::InsertPost(post("x"))).await.unwrap_err();
    assert_eq!(err.close_code(), Some(CloseCode::Protocol));
}

#[tokio::test]
async fn second_allocation_while_open_is_rejected() {
    let state = test_app_state();
    let thread = seed_thread(&state, "a").await;
    let (mut session, _rx) = synced(&state, "c1", thread).await;
    allocate(&state, &mut session, "one").await;

    let err = handle(&state, &mut session, Command::InsertPost(post("two"))).await.unwrap_err();
    assert!(matches!(err, CommandError::Protocol(_)));
}

#[tokio::test]
async fn post_into_thread_on_other_board_is_rejected() {
    let state = test_app_state();
    let here = seed_thread(&state, "a").await;
    let elsewhere = seed_thread(&state, "b").await;
    let (mut session, _rx) = synced(&state, "c1", here).await;

    let mut req = post("x");
    req.op = Some(elsewhere);
    let err = handle(&state, &mut session, Command::InsertPost(req)).await.unwrap_err();
    assert!(matches!(err, CommandError::Protocol(_)));
}

#[tokio::test]
async fn edits_are_broadcast_in_order() {
    let state = test_app_state();
    let thread = seed_thread(&state, "a").await;
    let (mut author, _) = synced(&state, "c1", thread).await;
    let (_watcher, mut rx) = synced(&state, "c2", thread).await;

    let id = allocate(&state, &mut author, "hi").await;
    handle(&state, &mut author, Command::Splice(Splice { start: 2, len: 0, text: " there".into() }))
        .await
        .unwrap();
    handle(&state, &mut author, Command::Append('!')).await.unwrap();
    handle(&state, &mut author, Command::Backspace).await.unwrap();
    handle(&state, &mut author, Command::UpdatePost { frag: "?".into() }).await.unwrap();
    handle(&state, &mut author, Command::FinishPost).await.unwrap();

    assert!(matches!(next_update(&mut rx).await, PostUpdate::InsertPost(_)));
    assert_eq!(
        next_update(&mut rx).await,
        PostUpdate::Splice { id, start: 2, len: 0, text: " there".into() }
    );
    assert_eq!(next_update(&mut rx).await, PostUpdate::Append { id, text: "!".into() });
    assert_eq!(next_update(&mut rx).await, PostUpdate::Backspace { id });
    assert_eq!(next_update(&mut rx).await, PostUpdate::Append { id, text: "?".into() });
    assert_eq!(next_update(&mut rx).await, PostUpdate::Finish { id });

    assert!(author.post.is_none());
    assert_eq!(state.registry.post_owner(id).await, None);
    let finished = state.store.drain_finished();
    assert_eq!(finished.last().map(|p| p.body.as_str()), Some("hi there?"));
}

#[tokio::test]
async fn append_is_truncated_to_remaining_budget() {
    let state = test_app_state();
    let thread = seed_thread(&state, "a").await;
    let (mut session, _) = synced(&state, "c1", thread).await;
    let (_watcher, mut rx) = synced(&state, "c2", thread).await;
    let id = allocate(&state, &mut session, &"a".repeat(1999)).await;
    next_update(&mut rx).await;

    handle(&state, &mut session, Command::UpdatePost { frag: "bcd".into() }).await.unwrap();
    assert_eq!(next_update(&mut rx).await, PostUpdate::Append { id, text: "b".into() });
    assert_eq!(session.post.as_ref().map(|p| p.chars), Some(2000));

    let err = handle(&state, &mut session, Command::Append('z')).await.unwrap_err();
    assert!(matches!(err, CommandError::Protocol(_)));
}

#[tokio::test]
async fn oversized_fragment_is_rejected() {
    let state = test_app_state();
    let thread = seed_thread(&state, "a").await;
    let (mut session, _) = synced(&state, "c1", thread).await;
    allocate(&state, &mut session, "x").await;

    let err = handle(&state, &mut session, Command::UpdatePost { frag: "y".repeat(2001) })
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "E_PROTOCOL");
}

#[tokio::test]
async fn text_is_filtered_before_storage() {
    let state = test_app_state();
    let thread = seed_thread(&state, "a").await;
    let (mut session, _) = synced(&state, "c1", thread).await;
    let (_watcher, mut rx) = synced(&state, "c2", thread).await;
    let id = allocate(&state, &mut session, "oh").await;
    next_update(&mut rx).await;

    handle(&state, &mut session, Command::UpdatePost { frag: " darn\u{200B}".into() }).await.unwrap();
    assert_eq!(next_update(&mut rx).await, PostUpdate::Append { id, text: " drat".into() });
    assert_eq!(session.post.as_ref().map(|p| p.chars), Some(7));
}

#[tokio::test]
async fn backspace_on_empty_body_is_a_no_op() {
    let state = test_app_state();
    let thread = seed_thread(&state, "a").await;
    let (mut session, _) = synced(&state, "c1", thread).await;
    let mut req = PostRequest::new("n");
    req.image = Some("tok".into());
    handle(&state, &mut session, Command::InsertPost(req)).await.unwrap();

    assert!(handle(&state, &mut session, Command::Backspace).await.unwrap().is_empty());
    assert_eq!(session.post.as_ref().map(|p| p.chars), Some(0));
}

#[tokio::test]
async fn out_of_range_splice_is_clamped() {
    let state = test_app_state();
    let thread = seed_thread(&state, "a").await;
    let (mut session, _) = synced(&state, "c1", thread).await;
    let (_watcher, mut rx) = synced(&state, "c2", thread).await;
    let id = allocate(&state, &mut session, "abc").await;
    next_update(&mut rx).await;

    handle(&state, &mut session, Command::Splice(Splice { start: 1, len: 50, text: "Z".into() }))
        .await
        .unwrap();
    assert_eq!(next_update(&mut rx).await, PostUpdate::Splice { id, start: 1, len: 2, text: "Z".into() });
    assert_eq!(session.post.as_ref().map(|p| p.chars), Some(2));
}

#[tokio::test]
async fn edits_without_open_post_are_rejected() {
    let state = test_app_state();
    let thread = seed_thread(&state, "a").await;
    let (mut session, _) = synced(&state, "c1", thread).await;

    for cmd in [Command::Backspace, Command::FinishPost, Command::InsertImage { token: "t".into() }] {
        let err = handle(&state, &mut session, cmd).await.unwrap_err();
        assert!(matches!(err, CommandError::Protocol(_)));
    }
}

#[tokio::test]
async fn image_can_be_attached_once() {
    let state = test_app_state();
    let thread = seed_thread(&state, "a").await;
    let (mut session, _) = synced(&state, "c1", thread).await;
    allocate(&state, &mut session, "x").await;

    handle(&state, &mut session, Command::InsertImage { token: "t1".into() }).await.unwrap();
    let err = handle(&state, &mut session, Command::InsertImage { token: "t2".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::Protocol(_)));
}

#[tokio::test]
async fn closed_insert_does_not_take_ownership() {
    let state = test_app_state();
    let thread = seed_thread(&state, "a").await;
    let (mut session, _) = synced(&state, "c1", thread).await;

    let mut req = post("done");
    req.open = false;
    let events = handle(&state, &mut session, Command::InsertPost(req)).await.unwrap();
    assert!(matches!(events[0], Event::PostId { .. }));
    assert!(session.post.is_none());
}

#[tokio::test]
async fn reclaim_resumes_post_after_reconnect() {
    let state = test_app_state();
    let thread = seed_thread(&state, "a").await;
    let (mut first, _) = synced(&state, "c1", thread).await;
    let id = allocate(&state, &mut first, "draft").await;
    let nonce = "nonce-draft".to_owned();

    // Still held by the first connection.
    let (mut second, _) = synced(&state, "c2", thread).await;
    let err = handle(&state, &mut second, Command::ReclaimPost { nonce: nonce.clone() })
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), RECLAIM_FAILED);
    assert_eq!(err.close_code(), None);

    state.registry.unregister(first.conn_id).await;
    let events = handle(&state, &mut second, Command::ReclaimPost { nonce }).await.unwrap();
    assert_eq!(events, vec![Event::PostId { id, op: thread }]);
    assert_eq!(second.post.as_ref().map(|p| p.chars), Some(5));

    handle(&state, &mut second, Command::Append('!')).await.unwrap();
}

#[tokio::test]
async fn reclaim_of_unknown_nonce_fails_softly() {
    let state = test_app_state();
    let thread = seed_thread(&state, "a").await;
    let (mut session, _) = synced(&state, "c1", thread).await;

    let err = handle(&state, &mut session, Command::ReclaimPost { nonce: "missing".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::ReclaimFailed));
}

#[tokio::test]
async fn read_only_server_denies_mutations() {
    let config = ServerConfig { read_only: true, ..test_config() };
    let state = AppState::new(config, Arc::new(MemoryStore::new()));
    let thread = seed_thread(&state, "a").await;
    let (mut session, _) = synced(&state, "c1", thread).await;

    let err = handle(&state, &mut session, Command::InsertPost(post("x"))).await.unwrap_err();
    assert!(matches!(err, CommandError::Denied(_)));
    assert_eq!(err.close_code(), None);
}

#[tokio::test]
async fn staff_claim_needs_matching_session() {
    let state = test_app_state_with_store(Arc::new(MemoryStore::new()));
    let thread = seed_thread(&state, "a").await;
    let (mut session, _) = synced(&state, "c1", thread).await;

    let mut req = post("hello");
    req.auth = Some("admin".into());
    req.session = Some(MOD_TOKEN.into());
    let err = handle(&state, &mut session, Command::InsertPost(req)).await.unwrap_err();
    assert!(matches!(err, CommandError::Denied(_)));

    let mut req = post("hello");
    req.auth = Some("moderator".into());
    req.session = Some(MOD_TOKEN.into());
    handle(&state, &mut session, Command::InsertPost(req)).await.unwrap();
    assert_eq!(session.identity, Identity::Anonymous);
}

#[tokio::test]
async fn insert_thread_opens_the_op_for_editing() {
    let state = test_app_state();
    let (mut session, mut rx) = test_session(&state).await;
    let req = SyncRequest { board: "a".into(), syncs: Default::default(), live: true };
    synchronize(&state, &mut session, "c1", req).await.unwrap();

    let thread = ThreadRequest {
        image: "img".into(),
        nonce: "n".into(),
        subject: Some("  ".into()),
        ..ThreadRequest::default()
    };
    let events = handle(&state, &mut session, Command::InsertThread(thread)).await.unwrap();
    let Event::PostId { id, op } = events[0] else {
        panic!("expected post id");
    };
    assert_eq!(id, op);
    assert!(session.post.as_ref().is_some_and(|p| p.has_image));

    // Live watchers of the board see new threads; the author filters its own.
    let item = rx.recv().await.unwrap();
    assert!(matches!(item.update, PostUpdate::InsertThread(ref s) if s.subject.is_none()));
    handle(&state, &mut session, Command::UpdatePost { frag: "body".into() }).await.unwrap();
}

#[tokio::test]
async fn sync_commands_are_not_post_commands() {
    let state = test_app_state();
    let (mut session, _) = test_session(&state).await;
    let err = handle(&state, &mut session, Command::Desync).await.unwrap_err();
    assert!(matches!(err, CommandError::Protocol(_)));
}
