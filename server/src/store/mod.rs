//! Post storage and live update feeds.
//!
//! DESIGN
//! ======
//! [`Storage`] is the seam between the session layer and wherever posts
//! live. It owns post text, per-thread backlogs, and the fan-out of each
//! mutation to subscribed sessions. Sessions never talk to each other
//! directly: a mutation goes into storage, and storage pushes a
//! [`FeedItem`] into every subscriber's channel.
//!
//! Every mutation of a thread is appended to that thread's backlog and
//! fanned out while the thread is locked, so all subscribers observe a
//! thread's updates in the same order as the backlog records them.
//!
//! LIFECYCLE
//! =========
//! A [`Subscription`] is returned by [`Storage::subscribe`] and removes
//! itself from the fan-out exactly once, either through
//! [`Subscription::release`] or when dropped.

pub mod memory;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use frames::{BacklogEntry, PostId, PostSnapshot, PostUpdate, Splice, ThreadId};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{CloseCode, ErrorCode};

pub use memory::MemoryStore;

// =============================================================================
// TYPES
// =============================================================================

/// Channel half a session hands to storage for live updates.
pub type FeedSender = mpsc::Sender<FeedItem>;

/// One live update delivered to a subscriber.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedItem {
    /// Subscription the item was routed through.
    pub subscription: u64,
    pub thread: ThreadId,
    /// Connection whose command produced the update.
    pub origin: Option<Uuid>,
    pub update: PostUpdate,
}

/// What a session is watching.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchSet {
    Threads(BTreeSet<ThreadId>),
    /// Every thread on the board, including threads created later.
    Live,
}

impl Default for WatchSet {
    fn default() -> Self {
        Self::Threads(BTreeSet::new())
    }
}

impl WatchSet {
    /// The single watched thread, if exactly one is watched.
    #[must_use]
    pub fn single_thread(&self) -> Option<ThreadId> {
        match self {
            Self::Threads(threads) if threads.len() == 1 => threads.iter().next().copied(),
            _ => None,
        }
    }
}

/// Fields of a post about to be created.
#[derive(Clone, Debug, Default)]
pub struct NewPost {
    pub nonce: String,
    pub body: String,
    /// `false` creates the post already finished.
    pub editing: bool,
    pub name: Option<String>,
    pub email: Option<String>,
    pub auth: Option<String>,
    pub subject: Option<String>,
    pub image: Option<String>,
}

/// An open post found again by its nonce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReclaimedPost {
    pub id: PostId,
    pub op: ThreadId,
    /// Body length in code points.
    pub chars: usize,
    pub has_image: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("thread not found: {0}")]
    ThreadNotFound(ThreadId),
    #[error("post not found: {0}")]
    PostNotFound(PostId),
    #[error("post {0} is already closed")]
    PostClosed(PostId),
    #[error("post {0} already has an image")]
    ImageExists(PostId),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::ThreadNotFound(_) => "E_THREAD_NOT_FOUND",
            Self::PostNotFound(_) => "E_POST_NOT_FOUND",
            Self::PostClosed(_) => "E_POST_CLOSED",
            Self::ImageExists(_) => "E_IMAGE_EXISTS",
            Self::Unavailable(_) => "E_STORAGE",
        }
    }

    fn close_code(&self) -> Option<CloseCode> {
        Some(CloseCode::Internal)
    }
}

// =============================================================================
// SUBSCRIPTION
// =============================================================================

type Release = Box<dyn FnOnce() + Send + Sync>;

/// Live feed registration. Released exactly once.
pub struct Subscription {
    id: u64,
    threads: Vec<ThreadId>,
    failed: Vec<ThreadId>,
    release: Option<Release>,
}

impl Subscription {
    pub(crate) fn new(id: u64, threads: Vec<ThreadId>, failed: Vec<ThreadId>, release: Release) -> Self {
        Self { id, threads, failed, release: Some(release) }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Threads the subscription is attached to.
    #[must_use]
    pub fn threads(&self) -> &[ThreadId] {
        &self.threads
    }

    /// Requested threads that could not be subscribed.
    #[must_use]
    pub fn failed(&self) -> &[ThreadId] {
        &self.failed
    }

    /// Stop receiving updates.
    pub fn release(mut self) {
        self.run_release();
    }

    fn run_release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("threads", &self.threads)
            .field("failed", &self.failed)
            .field("released", &self.release.is_none())
            .finish()
    }
}

// =============================================================================
// STORAGE
// =============================================================================

/// Post storage with per-thread update feeds.
///
/// Text offsets and lengths are in Unicode code points.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Whether `op` is an existing thread on `board`.
    async fn validate_op(&self, board: &str, op: ThreadId) -> Result<bool, StoreError>;

    /// Attach `feed` to the threads in `watch` (or the whole board).
    async fn subscribe(&self, board: &str, watch: &WatchSet, feed: FeedSender) -> Result<Subscription, StoreError>;

    /// Updates each thread recorded after the given count of already seen
    /// entries, oldest first.
    async fn fetch_backlog(
        &self,
        board: &str,
        seen: &BTreeMap<ThreadId, u64>,
    ) -> Result<Vec<BacklogEntry>, StoreError>;

    async fn insert_thread(&self, origin: Uuid, board: &str, post: NewPost) -> Result<PostSnapshot, StoreError>;

    async fn insert_post(
        &self,
        origin: Uuid,
        board: &str,
        op: ThreadId,
        post: NewPost,
    ) -> Result<PostSnapshot, StoreError>;

    async fn append_text(&self, origin: Uuid, id: PostId, text: &str) -> Result<(), StoreError>;

    async fn backspace(&self, origin: Uuid, id: PostId) -> Result<(), StoreError>;

    /// Apply `splice`, clamped to the current body. Returns the splice that
    /// was actually applied.
    async fn splice_text(&self, origin: Uuid, id: PostId, splice: &Splice) -> Result<Splice, StoreError>;

    async fn finish_post(&self, origin: Uuid, id: PostId) -> Result<(), StoreError>;

    async fn insert_image(&self, origin: Uuid, id: PostId, token: &str) -> Result<(), StoreError>;

    /// Find the still-open post on `board` allocated with `nonce`.
    async fn reclaim_post(&self, board: &str, nonce: &str) -> Result<Option<ReclaimedPost>, StoreError>;

    /// Open posts that have not changed for at least `idle`, by id.
    async fn stale_open_posts(&self, idle: Duration) -> Result<Vec<PostId>, StoreError>;

    /// Whether `subscription` was detached because its channel filled up.
    fn is_lagged(&self, _subscription: u64) -> bool {
        false
    }

    /// Take the posts finished since the last call, for archiving.
    fn drain_finished(&self) -> Vec<PostSnapshot> {
        Vec::new()
    }

    /// Put back posts whose archive write failed.
    fn requeue_finished(&self, _posts: Vec<PostSnapshot>) {}
}
