//! Repository for anchor rows.
//!
//! Every status change is a single `UPDATE ... WHERE id = $1 AND status = $2`
//! so concurrent workers cannot both win the same transition. Ending a
//! POSTING lease also matches the `updated_at` stamped when it was taken.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Executor, PgPool, Postgres, QueryBuilder, Row, Transaction};

use crate::{
    error::Result,
    models::{
        Anchor, AnchorFilter, AnchorId, AnchorOrder, AnchorStatus, Digest, IdempotencyKey,
        LedgerMessageId, NewAnchor, Transition, Window,
    },
};

const ANCHOR_COLUMNS: &str = "id, idempotency_key, digest, method, window_start, window_end, \
     leaf_count, status, attempt_count, ledger_message_id, ledger_endpoint, last_error, \
     created_at, updated_at, posted_at, confirmed_at";

fn column_error(
    column: &str,
    source: impl std::error::Error + Send + Sync + 'static,
) -> sqlx::Error {
    sqlx::Error::ColumnDecode { index: column.to_string(), source: Box::new(source) }
}

fn non_negative(row: &PgRow, column: &str) -> std::result::Result<u32, sqlx::Error> {
    let value: i32 = row.try_get(column)?;
    u32::try_from(value).map_err(|e| column_error(column, e))
}

impl sqlx::FromRow<'_, PgRow> for Anchor {
    fn from_row(row: &PgRow) -> std::result::Result<Self, sqlx::Error> {
        let method: String = row.try_get("method")?;
        let idempotency_key: String = row.try_get("idempotency_key")?;
        let window = Window::new(row.try_get("window_start")?, row.try_get("window_end")?)
            .map_err(|e| column_error("window_start", e))?;

        Ok(Self {
            id: row.try_get("id")?,
            idempotency_key: IdempotencyKey::from_stored(idempotency_key),
            digest: row.try_get("digest")?,
            method: method.parse().map_err(|e| column_error("method", e))?,
            window,
            leaf_count: non_negative(row, "leaf_count")?,
            status: row.try_get("status")?,
            attempt_count: non_negative(row, "attempt_count")?,
            ledger_message_id: row
                .try_get::<Option<String>, _>("ledger_message_id")?
                .map(LedgerMessageId::new),
            ledger_endpoint: row.try_get("ledger_endpoint")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            posted_at: row.try_get("posted_at")?,
            confirmed_at: row.try_get("confirmed_at")?,
        })
    }
}

/// Number of anchors currently in one status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCount {
    /// Status being counted.
    pub status: AnchorStatus,
    /// Number of anchors.
    pub count: i64,
}

/// Repository for anchor database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts the anchor unless its idempotency key already exists.
    ///
    /// Returns `None` when another row holds the key.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn insert_if_absent_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: AnchorId,
        new: &NewAnchor,
    ) -> Result<Option<Anchor>> {
        let sql = format!(
            r"
            INSERT INTO anchors (
                id, idempotency_key, digest, method, window_start, window_end,
                leaf_count, status, attempt_count, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, $9, $9)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING {ANCHOR_COLUMNS}
            "
        );

        let anchor = sqlx::query_as::<_, Anchor>(&sql)
            .bind(id)
            .bind(new.idempotency_key.as_str())
            .bind(new.digest)
            .bind(new.method.as_str())
            .bind(new.window.start())
            .bind(new.window.end())
            .bind(i32::try_from(new.leaf_count()).unwrap_or(i32::MAX))
            .bind(AnchorStatus::Pending)
            .bind(new.created_at)
            .fetch_optional(&mut **tx)
            .await?;

        Ok(anchor)
    }

    /// Finds an anchor by idempotency key inside a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_key_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        key: &IdempotencyKey,
    ) -> Result<Option<Anchor>> {
        let sql = format!("SELECT {ANCHOR_COLUMNS} FROM anchors WHERE idempotency_key = $1");
        Ok(sqlx::query_as::<_, Anchor>(&sql).bind(key.as_str()).fetch_optional(&mut **tx).await?)
    }

    /// Finds an anchor by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: AnchorId) -> Result<Option<Anchor>> {
        self.find_by_id_impl(&*self.pool, id).await
    }

    async fn find_by_id_impl<'e, E>(&self, executor: E, id: AnchorId) -> Result<Option<Anchor>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let sql = format!("SELECT {ANCHOR_COLUMNS} FROM anchors WHERE id = $1");
        Ok(sqlx::query_as::<_, Anchor>(&sql).bind(id).fetch_optional(executor).await?)
    }

    /// Applies `transition` if the anchor is still in `expected` and, when
    /// `leased_at` is given, still under the lease taken at that instant.
    ///
    /// Returns the updated row, or `None` when the compare-and-set missed
    /// because the anchor is absent, in another status or re-leased.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn transition(
        &self,
        id: AnchorId,
        expected: AnchorStatus,
        transition: &Transition,
        at: DateTime<Utc>,
        leased_at: Option<DateTime<Utc>>,
    ) -> Result<Option<Anchor>> {
        let (failed_tries, message_id, endpoint, error, posted_at, confirmed_at) =
            match transition {
                Transition::BeginPosting => (0, None, None, None, None, None),
                Transition::Posted { message_id, endpoint, failed_tries } => (
                    *failed_tries,
                    Some(message_id.as_str()),
                    Some(endpoint.as_str()),
                    None,
                    Some(at),
                    None,
                ),
                Transition::Failed { failed_tries, error } => {
                    (*failed_tries, None, None, Some(error.as_str()), None, None)
                },
                Transition::Confirmed => (0, None, None, None, None, Some(at)),
            };

        let sql = format!(
            r"
            UPDATE anchors
            SET status = $3,
                attempt_count = attempt_count + $4,
                ledger_message_id = COALESCE($5, ledger_message_id),
                ledger_endpoint = COALESCE($6, ledger_endpoint),
                last_error = COALESCE($7, last_error),
                posted_at = COALESCE($8, posted_at),
                confirmed_at = COALESCE($9, confirmed_at),
                updated_at = $10
            WHERE id = $1
              AND status = $2
              AND ($11::timestamptz IS NULL OR updated_at = $11)
            RETURNING {ANCHOR_COLUMNS}
            "
        );

        let anchor = sqlx::query_as::<_, Anchor>(&sql)
            .bind(id)
            .bind(expected)
            .bind(transition.target())
            .bind(i32::try_from(failed_tries).unwrap_or(i32::MAX))
            .bind(message_id)
            .bind(endpoint)
            .bind(error)
            .bind(posted_at)
            .bind(confirmed_at)
            .bind(at)
            .bind(leased_at)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(anchor)
    }

    /// Lists anchors matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list(&self, filter: &AnchorFilter) -> Result<Vec<Anchor>> {
        let mut query = QueryBuilder::<Postgres>::new(format!(
            "SELECT {ANCHOR_COLUMNS} FROM anchors WHERE TRUE"
        ));

        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status);
        }
        if let Some(from) = filter.window_from {
            query.push(" AND window_start >= ").push_bind(from);
        }
        if let Some(to) = filter.window_to {
            query.push(" AND window_end <= ").push_bind(to);
        }
        if let Some(at) = filter.updated_before {
            query.push(" AND updated_at < ").push_bind(at);
        }
        if let Some(max) = filter.attempts_below {
            query.push(" AND attempt_count < ").push_bind(i64::from(max));
        }
        if let Some(min) = filter.attempts_at_least {
            query.push(" AND attempt_count >= ").push_bind(i64::from(min));
        }

        query.push(match filter.order {
            AnchorOrder::NewestCreated => " ORDER BY created_at DESC, id",
            AnchorOrder::OldestUpdated => " ORDER BY updated_at ASC, id",
        });
        query.push(" LIMIT ").push_bind(i64::try_from(filter.limit).unwrap_or(i64::MAX));
        query.push(" OFFSET ").push_bind(i64::try_from(filter.offset).unwrap_or(i64::MAX));

        Ok(query.build_query_as::<Anchor>().fetch_all(&*self.pool).await?)
    }

    /// Lists every anchor containing `event_hash`, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_event_hash(&self, event_hash: Digest) -> Result<Vec<Anchor>> {
        let sql = format!(
            r"
            SELECT {}
            FROM anchors a
            JOIN anchor_items i ON i.anchor_id = a.id
            WHERE i.event_hash = $1
            ORDER BY a.created_at DESC
            ",
            ANCHOR_COLUMNS
                .split(", ")
                .map(|column| format!("a.{}", column.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(sqlx::query_as::<_, Anchor>(&sql).bind(event_hash).fetch_all(&*self.pool).await?)
    }

    /// Counts anchors per status.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_by_status(&self) -> Result<Vec<StatusCount>> {
        let rows = sqlx::query(
            r"
            SELECT status, COUNT(*) AS count
            FROM anchors
            GROUP BY status
            ORDER BY status
            ",
        )
        .fetch_all(&*self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<StatusCount> {
                Ok(StatusCount { status: row.try_get("status")?, count: row.try_get("count")? })
            })
            .collect()
    }
}
