//! Database initialization and the Postgres post archive.
//!
//! SYSTEM CONTEXT
//! ==============
//! Only used when `DATABASE_URL` is set. Startup creates the shared SQLx
//! pool, runs migrations, and hands a [`PgArchive`] to the persistence
//! service, which restores from it and flushes finished posts into it.

use async_trait::async_trait;
use frames::PostSnapshot;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::services::persistence::{Archive, PersistError};

/// Initialize the `PostgreSQL` connection pool and run migrations.
///
/// # Errors
///
/// Returns an error if the connection or migrations fail.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool, PersistError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    sqlx::migrate!("src/db/migrations").run(&pool).await?;

    Ok(pool)
}

type PostRow = (
    i64,
    i64,
    String,
    i64,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
);

fn to_db_id(id: u64) -> Result<i64, PersistError> {
    i64::try_from(id).map_err(|_| PersistError::InvalidRow { id: i64::MAX, reason: format!("id {id} out of range") })
}

fn from_row(row: PostRow) -> Result<PostSnapshot, PersistError> {
    let (id, op, board, time, body, name, email, auth, subject, image) = row;
    let invalid = |reason: &str| PersistError::InvalidRow { id, reason: reason.to_owned() };
    Ok(PostSnapshot {
        id: u64::try_from(id).map_err(|_| invalid("negative id"))?,
        op: u64::try_from(op).map_err(|_| invalid("negative thread id"))?,
        board,
        time,
        body,
        editing: false,
        name,
        email,
        auth,
        subject,
        image,
    })
}

/// Archive of finished posts in the `posts` table.
#[derive(Clone)]
pub struct PgArchive {
    pool: PgPool,
}

impl PgArchive {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Archive for PgArchive {
    async fn load(&self) -> Result<Vec<PostSnapshot>, PersistError> {
        let rows = sqlx::query_as::<_, PostRow>(
            "SELECT id, op, board, time, body, name, email, auth, subject, image FROM posts ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(from_row).collect()
    }

    async fn upsert(&self, posts: &[PostSnapshot]) -> Result<(), PersistError> {
        let mut tx = self.pool.begin().await?;
        for post in posts {
            sqlx::query(
                "INSERT INTO posts (id, op, board, time, body, name, email, auth, subject, image, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now()) \
                 ON CONFLICT (id) DO UPDATE SET \
                     body = EXCLUDED.body, image = EXCLUDED.image, subject = EXCLUDED.subject, \
                     updated_at = now()",
            )
            .bind(to_db_id(post.id)?)
            .bind(to_db_id(post.op)?)
            .bind(&post.board)
            .bind(post.time)
            .bind(&post.body)
            .bind(&post.name)
            .bind(&post.email)
            .bind(&post.auth)
            .bind(&post.subject)
            .bind(&post.image)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "db_test.rs"]
mod tests;
