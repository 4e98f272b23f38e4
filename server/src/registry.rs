//! Connection registry.
//!
//! Tracks which connection holds each client id and each open post. Both
//! claims are exclusive: a second connection presenting a held client id is
//! refused, and a post can be edited by one connection at a time.
//! Unregistering a connection releases everything it held.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use frames::PostId;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("client id already in use: {0}")]
    ClientIdTaken(String),
    #[error("post {0} is being edited elsewhere")]
    PostClaimed(PostId),
}

#[derive(Default)]
struct Inner {
    connections: HashSet<Uuid>,
    client_ids: HashMap<String, Uuid>,
    posts: HashMap<PostId, Uuid>,
}

#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<Inner>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, conn: Uuid) {
        self.inner.write().await.connections.insert(conn);
    }

    /// Claim `client_id` for `conn`. Re-claiming one's own id succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ClientIdTaken`] if another connection holds it.
    pub async fn claim_client_id(&self, conn: Uuid, client_id: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;
        match inner.client_ids.get(client_id) {
            Some(holder) if *holder != conn => Err(RegistryError::ClientIdTaken(client_id.to_owned())),
            _ => {
                inner.client_ids.insert(client_id.to_owned(), conn);
                Ok(())
            }
        }
    }

    /// Claim editing rights on `post` for `conn`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::PostClaimed`] if another connection holds it.
    pub async fn claim_post(&self, conn: Uuid, post: PostId) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;
        match inner.posts.get(&post) {
            Some(holder) if *holder != conn => Err(RegistryError::PostClaimed(post)),
            _ => {
                inner.posts.insert(post, conn);
                Ok(())
            }
        }
    }

    pub async fn release_post(&self, conn: Uuid, post: PostId) {
        let mut inner = self.inner.write().await;
        if inner.posts.get(&post) == Some(&conn) {
            inner.posts.remove(&post);
        }
    }

    pub async fn post_owner(&self, post: PostId) -> Option<Uuid> {
        self.inner.read().await.posts.get(&post).copied()
    }

    /// Drop `conn` and every claim it holds.
    pub async fn unregister(&self, conn: Uuid) {
        let mut inner = self.inner.write().await;
        inner.connections.remove(&conn);
        inner.client_ids.retain(|_, holder| *holder != conn);
        inner.posts.retain(|_, holder| *holder != conn);
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn client_id_is_exclusive() {
        let registry = Registry::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        assert_eq!(registry.claim_client_id(a, "c1").await, Ok(()));
        assert_eq!(registry.claim_client_id(a, "c1").await, Ok(()));
        assert_eq!(
            registry.claim_client_id(b, "c1").await,
            Err(RegistryError::ClientIdTaken("c1".into()))
        );
    }

    #[tokio::test]
    async fn post_claims_are_exclusive_until_released() {
        let registry = Registry::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        registry.claim_post(a, 7).await.unwrap();
        assert_eq!(registry.claim_post(b, 7).await, Err(RegistryError::PostClaimed(7)));

        registry.release_post(b, 7).await;
        assert_eq!(registry.post_owner(7).await, Some(a));

        registry.release_post(a, 7).await;
        assert_eq!(registry.claim_post(b, 7).await, Ok(()));
    }

    #[tokio::test]
    async fn unregister_releases_everything() {
        let registry = Registry::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        registry.register(a).await;
        registry.register(b).await;
        registry.claim_client_id(a, "c1").await.unwrap();
        registry.claim_post(a, 3).await.unwrap();
        assert_eq!(registry.connection_count().await, 2);

        registry.unregister(a).await;
        assert_eq!(registry.connection_count().await, 1);
        assert_eq!(registry.post_owner(3).await, None);
        assert_eq!(registry.claim_client_id(b, "c1").await, Ok(()));
    }
}
