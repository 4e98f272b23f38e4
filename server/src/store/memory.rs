//! In-memory [`Storage`] implementation.
//!
//! DESIGN
//! ======
//! Posts, thread backlogs and the nonce index sit behind one async
//! `RwLock`. Mutations take the write lock, update the post, append the
//! serialized update to the thread backlog and fan it out before releasing
//! the lock, which keeps per-thread delivery order identical to backlog
//! order. Feed registrations live behind a separate sync mutex so a
//! [`Subscription`] can remove itself from `Drop`.
//!
//! A subscriber whose channel is full would silently diverge, so it is
//! detached from every feed and marked lagged instead. Its session sees the
//! mark on the next queued item and closes the connection so the client
//! resyncs from the backlog.
//!
//! Finished posts are queued for the archive writer and dropped from the
//! nonce index; open posts stay reclaimable until finished. Each open post
//! remembers when it last changed so abandoned drafts can be found and
//! finished by the upkeep sweep.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use frames::limits::char_count;
use frames::{BacklogEntry, PostId, PostSnapshot, PostUpdate, Splice, ThreadId, backlog_payload};
use tokio::sync::RwLock;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{FeedItem, FeedSender, NewPost, ReclaimedPost, Storage, StoreError, Subscription, WatchSet};

// =============================================================================
// TYPES
// =============================================================================

struct ThreadRecord {
    board: String,
    /// Serialized updates, oldest first.
    log: Vec<String>,
}

struct PostRecord {
    snapshot: PostSnapshot,
    nonce: String,
    /// Last creation or mutation.
    touched: Instant,
}

#[derive(Default)]
struct Data {
    threads: HashMap<ThreadId, ThreadRecord>,
    posts: HashMap<PostId, PostRecord>,
    /// `(board, nonce)` of open posts.
    nonces: HashMap<(String, String), PostId>,
}

#[derive(Default)]
struct Feeds {
    threads: HashMap<ThreadId, HashMap<u64, FeedSender>>,
    boards: HashMap<String, HashMap<u64, FeedSender>>,
    /// Subscriptions detached after their channel filled up.
    lagged: HashSet<u64>,
}

impl Feeds {
    fn detach(&mut self, subscription: u64) {
        for subs in self.threads.values_mut().chain(self.boards.values_mut()) {
            subs.remove(&subscription);
        }
        self.threads.retain(|_, subs| !subs.is_empty());
        self.boards.retain(|_, subs| !subs.is_empty());
        self.lagged.insert(subscription);
    }
}

pub struct MemoryStore {
    data: RwLock<Data>,
    feeds: Arc<Mutex<Feeds>>,
    next_post: AtomicU64,
    next_subscription: AtomicU64,
    finished: Mutex<Vec<PostSnapshot>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Store whose first allocated post id is `first_id`.
    #[must_use]
    pub fn starting_at(first_id: PostId) -> Self {
        Self {
            data: RwLock::new(Data::default()),
            feeds: Arc::new(Mutex::new(Feeds::default())),
            next_post: AtomicU64::new(first_id.max(1)),
            next_subscription: AtomicU64::new(1),
            finished: Mutex::new(Vec::new()),
        }
    }

    /// Load archived posts. Replies whose thread is missing are skipped.
    /// Returns the number of posts restored.
    pub async fn restore(&self, mut posts: Vec<PostSnapshot>) -> usize {
        posts.sort_by_key(|p| p.id);
        let mut data = self.data.write().await;
        let mut restored = 0;

        for mut post in posts {
            post.editing = false;
            let update = if post.id == post.op {
                data.threads.insert(post.id, ThreadRecord { board: post.board.clone(), log: Vec::new() });
                PostUpdate::InsertThread(post.clone())
            } else {
                PostUpdate::InsertPost(post.clone())
            };
            self.next_post.fetch_max(post.id + 1, Ordering::SeqCst);
            let Some(thread) = data.threads.get_mut(&post.op) else {
                warn!(id = post.id, op = post.op, "store: archived post has no thread, skipping");
                continue;
            };
            thread.log.push(backlog_payload(&update));
            data.posts.insert(post.id, PostRecord { snapshot: post, nonce: String::new(), touched: Instant::now() });
            restored += 1;
        }

        info!(restored, "store: archive restored");
        restored
    }

    fn lock_finished(&self) -> MutexGuard<'_, Vec<PostSnapshot>> {
        self.finished.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new post and log its creation on `thread`.
    fn create(&self, data: &mut Data, origin: Uuid, snapshot: &PostSnapshot, nonce: String) -> Result<(), StoreError> {
        let update = if snapshot.id == snapshot.op {
            PostUpdate::InsertThread(snapshot.clone())
        } else {
            PostUpdate::InsertPost(snapshot.clone())
        };
        if snapshot.editing {
            data.nonces.insert((snapshot.board.clone(), nonce.clone()), snapshot.id);
        } else {
            self.lock_finished().push(snapshot.clone());
        }
        data.posts.insert(snapshot.id, PostRecord { snapshot: snapshot.clone(), nonce, touched: Instant::now() });
        self.record(data, origin, snapshot.op, update)
    }

    /// Append `update` to the thread backlog and fan it out.
    fn record(&self, data: &mut Data, origin: Uuid, thread: ThreadId, update: PostUpdate) -> Result<(), StoreError> {
        let record = data.threads.get_mut(&thread).ok_or(StoreError::ThreadNotFound(thread))?;
        record.log.push(backlog_payload(&update));

        let mut feeds = lock_feeds(&self.feeds);
        let mut lagging = Vec::new();
        let watchers = feeds.threads.get(&thread).into_iter().flatten();
        let live = feeds.boards.get(&record.board).into_iter().flatten();
        for (&subscription, tx) in watchers.chain(live) {
            let item = FeedItem { subscription, thread, origin: Some(origin), update: update.clone() };
            if let Err(TrySendError::Full(_)) = tx.try_send(item) {
                warn!(subscription, thread, "store: subscriber feed full, detaching");
                lagging.push(subscription);
            }
        }
        for subscription in lagging {
            feeds.detach(subscription);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        let feeds = lock_feeds(&self.feeds);
        feeds.threads.values().map(HashMap::len).sum::<usize>() + feeds.boards.values().map(HashMap::len).sum::<usize>()
    }
}

fn lock_feeds(feeds: &Mutex<Feeds>) -> MutexGuard<'_, Feeds> {
    feeds.lock().unwrap_or_else(PoisonError::into_inner)
}

fn open_post(data: &mut Data, id: PostId) -> Result<&mut PostRecord, StoreError> {
    let record = data.posts.get_mut(&id).ok_or(StoreError::PostNotFound(id))?;
    if !record.snapshot.editing {
        return Err(StoreError::PostClosed(id));
    }
    record.touched = Instant::now();
    Ok(record)
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

fn snapshot(id: PostId, op: ThreadId, board: &str, post: NewPost) -> (PostSnapshot, String) {
    let snapshot = PostSnapshot {
        id,
        op,
        board: board.to_owned(),
        time: now_secs(),
        body: post.body,
        editing: post.editing,
        name: post.name,
        email: post.email,
        auth: post.auth,
        subject: post.subject,
        image: post.image,
    };
    (snapshot, post.nonce)
}

// =============================================================================
// STORAGE
// =============================================================================

#[async_trait]
impl Storage for MemoryStore {
    async fn validate_op(&self, board: &str, op: ThreadId) -> Result<bool, StoreError> {
        let data = self.data.read().await;
        Ok(data.threads.get(&op).is_some_and(|t| t.board == board))
    }

    async fn subscribe(&self, board: &str, watch: &WatchSet, feed: FeedSender) -> Result<Subscription, StoreError> {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        // Held so no mutation lands between the existence check and registration.
        let data = self.data.read().await;

        let (threads, failed): (Vec<ThreadId>, Vec<ThreadId>) = match watch {
            WatchSet::Live => (Vec::new(), Vec::new()),
            WatchSet::Threads(set) => set
                .iter()
                .copied()
                .partition(|t| data.threads.get(t).is_some_and(|r| r.board == board)),
        };

        let live = matches!(watch, WatchSet::Live);
        {
            let mut feeds = lock_feeds(&self.feeds);
            if live {
                feeds.boards.entry(board.to_owned()).or_default().insert(id, feed);
            } else {
                for thread in &threads {
                    feeds.threads.entry(*thread).or_default().insert(id, feed.clone());
                }
            }
        }
        drop(data);

        let feeds = Arc::clone(&self.feeds);
        let board_key = board.to_owned();
        let keys = threads.clone();
        let release = Box::new(move || {
            let mut feeds = lock_feeds(&feeds);
            feeds.lagged.remove(&id);
            if live {
                if let Some(subs) = feeds.boards.get_mut(&board_key) {
                    subs.remove(&id);
                    if subs.is_empty() {
                        feeds.boards.remove(&board_key);
                    }
                }
            }
            for thread in keys {
                if let Some(subs) = feeds.threads.get_mut(&thread) {
                    subs.remove(&id);
                    if subs.is_empty() {
                        feeds.threads.remove(&thread);
                    }
                }
            }
            debug!(subscription = id, "store: subscription released");
        });

        Ok(Subscription::new(id, threads, failed, release))
    }

    async fn fetch_backlog(
        &self,
        board: &str,
        seen: &BTreeMap<ThreadId, u64>,
    ) -> Result<Vec<BacklogEntry>, StoreError> {
        let data = self.data.read().await;
        let mut entries = Vec::new();
        for (&thread, &count) in seen {
            let Some(record) = data.threads.get(&thread).filter(|r| r.board == board) else {
                continue;
            };
            let skip = usize::try_from(count).unwrap_or(usize::MAX);
            entries.extend(
                record
                    .log
                    .iter()
                    .skip(skip)
                    .map(|payload| BacklogEntry { thread, payload: payload.clone() }),
            );
        }
        Ok(entries)
    }

    async fn insert_thread(&self, origin: Uuid, board: &str, post: NewPost) -> Result<PostSnapshot, StoreError> {
        let mut data = self.data.write().await;
        let id = self.next_post.fetch_add(1, Ordering::SeqCst);
        data.threads.insert(id, ThreadRecord { board: board.to_owned(), log: Vec::new() });

        let (snapshot, nonce) = snapshot(id, id, board, post);
        self.create(&mut data, origin, &snapshot, nonce)?;
        Ok(snapshot)
    }

    async fn insert_post(
        &self,
        origin: Uuid,
        board: &str,
        op: ThreadId,
        post: NewPost,
    ) -> Result<PostSnapshot, StoreError> {
        let mut data = self.data.write().await;
        if !data.threads.get(&op).is_some_and(|t| t.board == board) {
            return Err(StoreError::ThreadNotFound(op));
        }
        let id = self.next_post.fetch_add(1, Ordering::SeqCst);

        let (snapshot, nonce) = snapshot(id, op, board, post);
        self.create(&mut data, origin, &snapshot, nonce)?;
        Ok(snapshot)
    }

    async fn append_text(&self, origin: Uuid, id: PostId, text: &str) -> Result<(), StoreError> {
        let mut data = self.data.write().await;
        let op = {
            let record = open_post(&mut data, id)?;
            record.snapshot.body.push_str(text);
            record.snapshot.op
        };
        self.record(&mut data, origin, op, PostUpdate::Append { id, text: text.to_owned() })
    }

    async fn backspace(&self, origin: Uuid, id: PostId) -> Result<(), StoreError> {
        let mut data = self.data.write().await;
        let (op, removed) = {
            let record = open_post(&mut data, id)?;
            (record.snapshot.op, record.snapshot.body.pop().is_some())
        };
        if !removed {
            return Ok(());
        }
        self.record(&mut data, origin, op, PostUpdate::Backspace { id })
    }

    async fn splice_text(&self, origin: Uuid, id: PostId, splice: &Splice) -> Result<Splice, StoreError> {
        let mut data = self.data.write().await;
        let (op, applied) = {
            let record = open_post(&mut data, id)?;
            let applied = splice.clamped(char_count(&record.snapshot.body));
            record.snapshot.body = applied.apply(&record.snapshot.body);
            (record.snapshot.op, applied)
        };
        self.record(&mut data, origin, op, PostUpdate::splice(id, applied.clone()))?;
        Ok(applied)
    }

    async fn finish_post(&self, origin: Uuid, id: PostId) -> Result<(), StoreError> {
        let mut data = self.data.write().await;
        let (op, key, snapshot) = {
            let record = open_post(&mut data, id)?;
            record.snapshot.editing = false;
            let key = (record.snapshot.board.clone(), std::mem::take(&mut record.nonce));
            (record.snapshot.op, key, record.snapshot.clone())
        };
        data.nonces.remove(&key);
        self.lock_finished().push(snapshot);
        self.record(&mut data, origin, op, PostUpdate::Finish { id })
    }

    async fn insert_image(&self, origin: Uuid, id: PostId, token: &str) -> Result<(), StoreError> {
        let mut data = self.data.write().await;
        let op = {
            let record = open_post(&mut data, id)?;
            if record.snapshot.image.is_some() {
                return Err(StoreError::ImageExists(id));
            }
            record.snapshot.image = Some(token.to_owned());
            record.snapshot.op
        };
        self.record(&mut data, origin, op, PostUpdate::InsertImage { id, token: token.to_owned() })
    }

    async fn reclaim_post(&self, board: &str, nonce: &str) -> Result<Option<ReclaimedPost>, StoreError> {
        let data = self.data.read().await;
        let key = (board.to_owned(), nonce.to_owned());
        let reclaimed = data
            .nonces
            .get(&key)
            .and_then(|id| data.posts.get(id))
            .filter(|r| r.snapshot.editing)
            .map(|r| ReclaimedPost {
                id: r.snapshot.id,
                op: r.snapshot.op,
                chars: char_count(&r.snapshot.body),
                has_image: r.snapshot.image.is_some(),
            });
        Ok(reclaimed)
    }

    async fn stale_open_posts(&self, idle: Duration) -> Result<Vec<PostId>, StoreError> {
        let data = self.data.read().await;
        let mut stale: Vec<PostId> = data
            .posts
            .values()
            .filter(|r| r.snapshot.editing && r.touched.elapsed() >= idle)
            .map(|r| r.snapshot.id)
            .collect();
        stale.sort_unstable();
        Ok(stale)
    }

    fn is_lagged(&self, subscription: u64) -> bool {
        lock_feeds(&self.feeds).lagged.contains(&subscription)
    }

    fn drain_finished(&self) -> Vec<PostSnapshot> {
        std::mem::take(&mut *self.lock_finished())
    }

    fn requeue_finished(&self, mut posts: Vec<PostSnapshot>) {
        let mut finished = self.lock_finished();
        posts.append(&mut finished);
        *finished = posts;
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
