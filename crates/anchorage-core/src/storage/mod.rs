//! PostgreSQL repositories for anchors and their items.
//!
//! Repositories translate between domain models and rows. Transactions that
//! span both tables are composed by
//! [`PostgresAnchorStore`](crate::store::PostgresAnchorStore) through the
//! `_in_tx` methods.

use std::sync::Arc;

use sqlx::PgPool;

pub mod anchor_items;
pub mod anchors;
pub mod schema;

use crate::error::Result;

/// Container for all repositories sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for anchor rows.
    pub anchors: Arc<anchors::Repository>,

    /// Repository for anchor items and proofs.
    pub anchor_items: Arc<anchor_items::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a storage instance over `pool`.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            anchors: Arc::new(anchors::Repository::new(pool.clone())),
            anchor_items: Arc::new(anchor_items::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Shared connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Verifies the database answers a trivial query.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("pool_size", &self.pool.size()).finish_non_exhaustive()
    }
}
