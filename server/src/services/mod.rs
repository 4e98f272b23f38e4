//! Domain services used by the websocket route.
//!
//! ARCHITECTURE
//! ============
//! Service modules own protocol semantics and persistence concerns so the
//! route handler can stay focused on framing and connection lifecycle.
//! `sync` and `post` act on a single `Session`; `auth` and `filter` are
//! pure helpers built once from configuration; `persistence` runs in the
//! background beside the store.

pub mod auth;
pub mod filter;
pub mod persistence;
pub mod post;
pub mod sync;
