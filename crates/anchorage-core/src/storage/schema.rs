//! Idempotent schema bootstrap for the PostgreSQL adapter.

use sqlx::PgPool;
use tracing::debug;

use crate::error::Result;

const STATEMENTS: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS anchors (
        id UUID PRIMARY KEY,
        idempotency_key TEXT NOT NULL UNIQUE,
        digest BYTEA NOT NULL CHECK (octet_length(digest) = 32),
        method TEXT NOT NULL,
        window_start TIMESTAMPTZ NOT NULL,
        window_end TIMESTAMPTZ NOT NULL,
        leaf_count INTEGER NOT NULL CHECK (leaf_count > 0),
        status TEXT NOT NULL
            CHECK (status IN ('pending', 'posting', 'posted', 'confirmed', 'failed')),
        attempt_count INTEGER NOT NULL DEFAULT 0 CHECK (attempt_count >= 0),
        ledger_message_id TEXT,
        ledger_endpoint TEXT,
        last_error TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        posted_at TIMESTAMPTZ,
        confirmed_at TIMESTAMPTZ,
        CHECK (window_start < window_end)
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_anchors_status_updated
        ON anchors (status, updated_at)
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_anchors_window
        ON anchors (window_start, window_end)
    ",
    r"
    CREATE TABLE IF NOT EXISTS anchor_items (
        anchor_id UUID NOT NULL REFERENCES anchors (id),
        leaf_index INTEGER NOT NULL CHECK (leaf_index >= 0),
        event_id UUID NOT NULL,
        event_hash BYTEA NOT NULL CHECK (octet_length(event_hash) = 32),
        proof JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (anchor_id, leaf_index),
        UNIQUE (anchor_id, event_hash)
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_anchor_items_event_hash
        ON anchor_items (event_hash)
    ",
];

/// Creates the anchor tables and indexes if they do not exist.
///
/// # Errors
///
/// Returns `CoreError::Database` if any statement fails.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    debug!(statements = STATEMENTS.len(), "anchor schema ensured");
    Ok(())
}
