//! Per-connection session state.
//!
//! A session is owned by its websocket task and never shared. It holds the
//! connection's identity, sync state, live subscription and the post the
//! connection is currently editing.

use frames::{PostId, ThreadId};
use uuid::Uuid;

use crate::services::auth::Identity;
use crate::store::{FeedItem, FeedSender, Subscription, WatchSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Unsynced,
    /// Sync in progress; subscription not yet attached.
    Syncing,
    Synced,
}

/// The open post this connection is allowed to edit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnedPost {
    pub id: PostId,
    pub op: ThreadId,
    /// Body length in code points, as stored.
    pub chars: usize,
    pub has_image: bool,
}

pub struct Session {
    pub conn_id: Uuid,
    pub identity: Identity,
    pub client_id: Option<String>,
    pub board: Option<String>,
    pub watch: WatchSet,
    pub state: SyncState,
    pub post: Option<OwnedPost>,
    feed: FeedSender,
    subscription: Option<Subscription>,
}

impl Session {
    #[must_use]
    pub fn new(conn_id: Uuid, identity: Identity, feed: FeedSender) -> Self {
        Self {
            conn_id,
            identity,
            client_id: None,
            board: None,
            watch: WatchSet::default(),
            state: SyncState::Unsynced,
            post: None,
            feed,
            subscription: None,
        }
    }

    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.state == SyncState::Synced
    }

    /// Sender handed to storage when subscribing.
    #[must_use]
    pub fn feed(&self) -> FeedSender {
        self.feed.clone()
    }

    #[must_use]
    pub fn subscription_id(&self) -> Option<u64> {
        self.subscription.as_ref().map(Subscription::id)
    }

    pub fn attach(&mut self, subscription: Subscription) {
        self.release_subscription();
        self.subscription = Some(subscription);
    }

    /// Whether a feed item should be forwarded to this connection. Items
    /// from stale subscriptions and the connection's own edits are skipped.
    #[must_use]
    pub fn accepts(&self, item: &FeedItem) -> bool {
        self.subscription_id() == Some(item.subscription) && item.origin != Some(self.conn_id)
    }

    pub fn release_subscription(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.release();
        }
    }

    /// Drop the subscription and return to `Unsynced`.
    pub fn desync(&mut self) {
        self.release_subscription();
        self.state = SyncState::Unsynced;
        self.watch = WatchSet::default();
        self.board = None;
    }
}
