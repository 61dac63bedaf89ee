//! PostgreSQL databases for storage tests.
//!
//! Each [`TestDatabase`] is a freshly created database with the anchor
//! schema applied, so tests never see each other's rows. Connection details
//! come from `DATABASE_URL`; when it is unset, storage tests skip instead of
//! failing.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anchorage_core::{storage::Storage, PostgresAnchorStore};
use anyhow::{Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool,
};
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

static ADMIN_POOL: OnceCell<PgPool> = OnceCell::const_new();

// CREATE DATABASE takes a lock on the template; keep concurrent creates low.
static DB_CREATION_SEMAPHORE: Semaphore = Semaphore::const_new(3);

/// Whether a test database server is configured.
pub fn is_configured() -> bool {
    std::env::var("DATABASE_URL").is_ok_and(|url| !url.is_empty())
}

/// Isolated database with the anchor schema applied.
#[derive(Debug)]
pub struct TestDatabase {
    pool: PgPool,
    database_name: String,
}

impl TestDatabase {
    /// Creates and migrates a new database.
    ///
    /// # Errors
    ///
    /// Fails when `DATABASE_URL` is missing or the server rejects the
    /// create or the schema.
    pub async fn new() -> Result<Self> {
        let admin_pool = create_admin_pool().await?;

        let timestamp =
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let database_name = format!("anchorage_test_{timestamp}_{}", Uuid::new_v4().simple());

        create_database(&admin_pool, &database_name).await?;
        let pool = create_database_pool(&database_name).await?;
        anchorage_core::storage::schema::migrate(&pool)
            .await
            .with_context(|| format!("failed to migrate {database_name}"))?;

        info!("created isolated test database: {}", database_name);
        Ok(Self { pool, database_name })
    }

    /// A new database, or `None` when no server is configured.
    ///
    /// # Errors
    ///
    /// Fails when a server is configured but unusable.
    pub async fn if_configured() -> Result<Option<Self>> {
        if !is_configured() {
            warn!("DATABASE_URL is not set; skipping storage test");
            return Ok(None);
        }
        Self::new().await.map(Some)
    }

    /// Access to the database pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Get the database name.
    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    /// Repositories over this database.
    pub fn storage(&self) -> Storage {
        Storage::new(self.pool.clone())
    }

    /// Production store over this database.
    pub fn store(&self) -> PostgresAnchorStore {
        PostgresAnchorStore::new(std::sync::Arc::new(self.storage()))
    }

    /// Closes the pool and drops the database.
    ///
    /// # Errors
    ///
    /// Fails when the drop is rejected.
    pub async fn cleanup(self) -> Result<()> {
        self.pool.close().await;
        let admin_pool = create_admin_pool().await?;
        drop_database_immediate(&admin_pool, &self.database_name).await?;
        debug!("dropped test database {}", self.database_name);
        Ok(())
    }
}

/// Creates an empty database.
///
/// # Errors
///
/// Fails when the server rejects the create.
pub async fn create_database(admin_pool: &PgPool, database_name: &str) -> Result<()> {
    let permit_start = Instant::now();
    let _permit =
        DB_CREATION_SEMAPHORE.acquire().await.context("database creation semaphore closed")?;
    let permit_duration = permit_start.elapsed();

    if permit_duration > Duration::from_millis(100) {
        warn!(
            "Database creation semaphore wait took {}ms for {}",
            permit_duration.as_millis(),
            database_name
        );
    }

    let create_start = Instant::now();
    sqlx::query(&format!("CREATE DATABASE \"{database_name}\""))
        .execute(admin_pool)
        .await
        .with_context(|| format!("failed to create database {database_name}"))?;

    debug!(
        "created database {} in {}ms",
        database_name,
        create_start.elapsed().as_millis()
    );
    Ok(())
}

/// Drop database immediately with connection termination.
///
/// # Errors
///
/// Fails when neither drop form is accepted.
pub async fn drop_database_immediate(admin_pool: &PgPool, database_name: &str) -> Result<()> {
    let _ = sqlx::query(
        "SELECT pg_terminate_backend(pid)
         FROM pg_stat_activity
         WHERE datname = $1
         AND pid <> pg_backend_pid()",
    )
    .bind(database_name)
    .execute(admin_pool)
    .await;

    if sqlx::query(&format!("DROP DATABASE IF EXISTS \"{database_name}\" WITH (FORCE)"))
        .execute(admin_pool)
        .await
        .is_err()
    {
        sqlx::query(&format!("DROP DATABASE IF EXISTS \"{database_name}\""))
            .execute(admin_pool)
            .await
            .with_context(|| format!("failed to drop database: {database_name}"))?;
    }

    Ok(())
}

fn connect_options() -> Result<PgConnectOptions> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL environment variable is required")?;
    database_url.parse::<PgConnectOptions>().context("failed to parse DATABASE_URL")
}

/// Create or reuse admin connection pool for database management operations.
///
/// # Errors
///
/// Fails when `DATABASE_URL` is missing or unreachable.
pub async fn create_admin_pool() -> Result<PgPool> {
    if let Some(pool) = ADMIN_POOL.get() {
        if !pool.is_closed() {
            return Ok(pool.clone());
        }
    }

    let pool = ADMIN_POOL
        .get_or_try_init(|| async {
            let opts = connect_options()?.database("postgres");
            let pool = PgPoolOptions::new()
                .max_connections(2)
                .min_connections(0)
                .max_lifetime(Duration::from_secs(300))
                .acquire_timeout(Duration::from_secs(3))
                .connect_with(opts)
                .await
                .context("failed to connect to admin database")?;
            anyhow::Ok(pool)
        })
        .await?;

    Ok(pool.clone())
}

/// Connection pool for one named database.
///
/// # Errors
///
/// Fails when the database cannot be reached.
pub async fn create_database_pool(database_name: &str) -> Result<PgPool> {
    let opts = connect_options()?.database(database_name);
    PgPoolOptions::new()
        .max_connections(4)
        .min_connections(0)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(opts)
        .await
        .with_context(|| format!("failed to connect to {database_name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn isolated_databases_have_distinct_names() {
        let Some(first) = TestDatabase::if_configured().await.unwrap() else {
            return;
        };
        let second = TestDatabase::new().await.unwrap();

        assert_ne!(first.database_name(), second.database_name());
        first.storage().health_check().await.unwrap();

        first.cleanup().await.unwrap();
        second.cleanup().await.unwrap();
    }
}
