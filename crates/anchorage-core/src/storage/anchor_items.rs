//! Repository for anchor membership rows and their stored proofs.
//!
//! Items are append-only: written once in the anchor's creation transaction
//! and only read afterwards.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, types::Json, PgPool, Postgres, QueryBuilder, Row, Transaction};

use crate::{
    error::Result,
    models::{AnchorId, AnchorItem, Digest, NewAnchorItem, ProofStep},
};

/// Rows per multi-value insert; keeps bind parameters well under the
/// PostgreSQL limit of 65535.
const INSERT_CHUNK: usize = 1_000;

impl sqlx::FromRow<'_, PgRow> for AnchorItem {
    fn from_row(row: &PgRow) -> std::result::Result<Self, sqlx::Error> {
        let leaf_index: i32 = row.try_get("leaf_index")?;
        let Json(proof): Json<Vec<ProofStep>> = row.try_get("proof")?;

        Ok(Self {
            anchor_id: row.try_get("anchor_id")?,
            event_id: row.try_get("event_id")?,
            event_hash: row.try_get("event_hash")?,
            leaf_index: u32::try_from(leaf_index).map_err(|e| sqlx::Error::ColumnDecode {
                index: "leaf_index".to_string(),
                source: Box::new(e),
            })?,
            proof,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Repository for anchor item database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts all items of a new anchor within its creation transaction.
    ///
    /// # Errors
    ///
    /// Returns error if any insert fails; the caller rolls back.
    pub async fn insert_all_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        anchor_id: AnchorId,
        items: &[NewAnchorItem],
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        for chunk in items.chunks(INSERT_CHUNK) {
            let mut query = QueryBuilder::<Postgres>::new(
                "INSERT INTO anchor_items \
                 (anchor_id, leaf_index, event_id, event_hash, proof, created_at) ",
            );
            query.push_values(chunk, |mut row, item| {
                row.push_bind(anchor_id)
                    .push_bind(i32::try_from(item.leaf_index).unwrap_or(i32::MAX))
                    .push_bind(item.event_id)
                    .push_bind(item.event_hash)
                    .push_bind(Json(item.proof.clone()))
                    .push_bind(created_at);
            });
            query.build().execute(&mut **tx).await?;
        }

        Ok(())
    }

    /// Lists an anchor's items in leaf order.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_anchor(&self, anchor_id: AnchorId) -> Result<Vec<AnchorItem>> {
        let items = sqlx::query_as::<_, AnchorItem>(
            r"
            SELECT anchor_id, leaf_index, event_id, event_hash, proof, created_at
            FROM anchor_items
            WHERE anchor_id = $1
            ORDER BY leaf_index
            ",
        )
        .bind(anchor_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(items)
    }

    /// Finds the item for `event_hash` within one anchor.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_anchor_and_hash(
        &self,
        anchor_id: AnchorId,
        event_hash: Digest,
    ) -> Result<Option<AnchorItem>> {
        let item = sqlx::query_as::<_, AnchorItem>(
            r"
            SELECT anchor_id, leaf_index, event_id, event_hash, proof, created_at
            FROM anchor_items
            WHERE anchor_id = $1 AND event_hash = $2
            ",
        )
        .bind(anchor_id)
        .bind(event_hash)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(item)
    }
}
