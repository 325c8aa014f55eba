//! SQLite-backed activity store (C2)
//!
//! All persistence for activities, objects, collection membership and the
//! delivery queue goes through this module. Uses SQLx for compile-time
//! checked queries, same pattern as the rest of the data layer.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::path::Path;

use super::models::{ActivityRecord, CollectionMembership, DeliveryTask, ObjectRecord};
use crate::error::AppError;

/// Activity store connection pool wrapper.
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Connect to the SQLite database, creating the parent directory and
    /// running migrations if needed.
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::StoreFailure(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            tracing::error!("Migration failed: {}", e);
            AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
        })?;

        tracing::info!("Activity store connected and migrated");

        Ok(Self { pool })
    }

    /// Construct directly from an existing pool. Used by tests that share a
    /// pool across components.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // =========================================================================
    // Activities
    // =========================================================================

    /// Insert a new activity and its collection memberships in one
    /// transaction, returning the assigned `seq` cursor value.
    pub async fn insert_activity(
        &self,
        iri: &str,
        kind: &str,
        actor: &str,
        document: &serde_json::Value,
        collections: &[String],
    ) -> Result<i64, AppError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let result = sqlx::query(
            "INSERT INTO activities (iri, kind, actor, document, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(iri)
        .bind(kind)
        .bind(actor)
        .bind(document.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let seq = result.last_insert_rowid();

        for collection_iri in collections {
            sqlx::query(
                "INSERT OR IGNORE INTO collection_memberships (collection_iri, activity_iri, added_at) VALUES (?, ?, ?)",
            )
            .bind(collection_iri)
            .bind(iri)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(seq)
    }

    pub async fn get_activity(&self, iri: &str) -> Result<Option<ActivityRecord>, AppError> {
        let row = sqlx::query(
            "SELECT seq, iri, kind, actor, document, created_at FROM activities WHERE iri = ?",
        )
        .bind(iri)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_activity).transpose()
    }

    /// Replace an activity's document in place, used when a later `Update`
    /// propagates into every embedded copy of a changed object. Does not
    /// touch collection membership.
    pub async fn replace_activity_document(
        &self,
        iri: &str,
        document: &serde_json::Value,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE activities SET document = ? WHERE iri = ?")
            .bind(document.to_string())
            .bind(iri)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Find every activity whose document embeds the given object IRI
    /// (object field equal to it), for Update propagation.
    pub async fn activities_embedding_object(
        &self,
        object_iri: &str,
    ) -> Result<Vec<ActivityRecord>, AppError> {
        let pattern = format!("%{object_iri}%");
        let rows = sqlx::query(
            "SELECT seq, iri, kind, actor, document, created_at FROM activities WHERE document LIKE ?",
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_activity).collect()
    }

    /// Page through a collection by opaque `seq` cursor, newest first.
    pub async fn get_stream(
        &self,
        collection_iri: &str,
        before_seq: Option<i64>,
        limit: i64,
    ) -> Result<Vec<ActivityRecord>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT a.seq, a.iri, a.kind, a.actor, a.document, a.created_at
            FROM activities a
            JOIN collection_memberships m ON m.activity_iri = a.iri
            WHERE m.collection_iri = ? AND (? IS NULL OR a.seq < ?)
            ORDER BY a.seq DESC
            LIMIT ?
            "#,
        )
        .bind(collection_iri)
        .bind(before_seq)
        .bind(before_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_activity).collect()
    }

    pub async fn collection_count(&self, collection_iri: &str) -> Result<i64, AppError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM collection_memberships WHERE collection_iri = ?")
            .bind(collection_iri)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    pub async fn add_to_collection(&self, collection_iri: &str, activity_iri: &str) -> Result<(), AppError> {
        sqlx::query(
            "INSERT OR IGNORE INTO collection_memberships (collection_iri, activity_iri, added_at) VALUES (?, ?, ?)",
        )
        .bind(collection_iri)
        .bind(activity_iri)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_from_collection(&self, collection_iri: &str, activity_iri: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM collection_memberships WHERE collection_iri = ? AND activity_iri = ?")
            .bind(collection_iri)
            .bind(activity_iri)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_members(&self, collection_iri: &str) -> Result<Vec<CollectionMembership>, AppError> {
        let rows = sqlx::query_as::<_, CollectionMembership>(
            "SELECT collection_iri, activity_iri, added_at FROM collection_memberships WHERE collection_iri = ? ORDER BY added_at ASC",
        )
        .bind(collection_iri)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn is_member(&self, collection_iri: &str, member_iri: &str) -> Result<bool, AppError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM collection_memberships WHERE collection_iri = ? AND activity_iri = ?",
        )
        .bind(collection_iri)
        .bind(member_iri)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("n")? > 0)
    }

    /// Delete an activity and every collection membership row pointing at
    /// it. The only caller is `Undo`, per the data model's lifecycle
    /// invariant: an activity is deleted only by Undo of itself.
    pub async fn delete_activity(&self, iri: &str) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM collection_memberships WHERE activity_iri = ?")
            .bind(iri)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM activities WHERE iri = ?")
            .bind(iri)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // =========================================================================
    // Objects
    // =========================================================================

    pub async fn upsert_object(
        &self,
        iri: &str,
        kind: &str,
        attributed_to: Option<&str>,
        document: &serde_json::Value,
    ) -> Result<(), AppError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO objects (iri, kind, attributed_to, document, created_at, updated_at, tombstoned)
            VALUES (?, ?, ?, ?, ?, ?, 0)
            ON CONFLICT(iri) DO UPDATE SET
                kind = excluded.kind,
                document = excluded.document,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(iri)
        .bind(kind)
        .bind(attributed_to)
        .bind(document.to_string())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_object(&self, iri: &str) -> Result<Option<ObjectRecord>, AppError> {
        let row = sqlx::query(
            "SELECT iri, kind, attributed_to, document, created_at, updated_at, tombstoned FROM objects WHERE iri = ?",
        )
        .bind(iri)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_object).transpose()
    }

    /// Replace the body of a live object with a Tombstone, idempotently —
    /// tombstoning an already-tombstoned object is a no-op.
    pub async fn tombstone_object(&self, iri: &str) -> Result<(), AppError> {
        let now = Utc::now();
        let tombstone = serde_json::json!({
            "id": iri,
            "type": ["Tombstone"],
            "deleted": [now.to_rfc3339()],
        });
        sqlx::query(
            "UPDATE objects SET document = ?, kind = 'Tombstone', tombstoned = 1, updated_at = ? WHERE iri = ? AND tombstoned = 0",
        )
        .bind(tombstone.to_string())
        .bind(now)
        .bind(iri)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Delivery queue (C8)
    // =========================================================================

    pub async fn enqueue_delivery(
        &self,
        activity_iri: &str,
        inbox_uri: &str,
        signing_actor: &str,
        payload: &serde_json::Value,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO delivery_queue (id, activity_iri, inbox_uri, signing_actor, payload, attempts, next_attempt_at, last_error)
            VALUES (?, ?, ?, ?, ?, 0, ?, NULL)
            "#,
        )
        .bind(crate::data::models::EntityId::new().0)
        .bind(activity_iri)
        .bind(inbox_uri)
        .bind(signing_actor)
        .bind(payload.to_string())
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn due_deliveries(&self, limit: i64) -> Result<Vec<DeliveryTask>, AppError> {
        let rows = sqlx::query(
            "SELECT id, activity_iri, inbox_uri, signing_actor, payload, attempts, next_attempt_at, last_error FROM delivery_queue WHERE next_attempt_at <= ? ORDER BY next_attempt_at ASC LIMIT ?",
        )
        .bind(Utc::now())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_delivery_task).collect()
    }

    pub async fn reschedule_delivery(
        &self,
        id: &str,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE delivery_queue SET attempts = attempts + 1, next_attempt_at = ?, last_error = ? WHERE id = ?",
        )
        .bind(next_attempt_at)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn complete_delivery(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM delivery_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn abandon_delivery(&self, id: &str, error: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE delivery_queue SET last_error = ? WHERE id = ?")
            .bind(format!("abandoned: {error}"))
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM delivery_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_activity(row: sqlx::sqlite::SqliteRow) -> Result<ActivityRecord, AppError> {
    let document_text: String = row.try_get("document")?;
    Ok(ActivityRecord {
        seq: row.try_get("seq")?,
        iri: row.try_get("iri")?,
        kind: row.try_get("kind")?,
        actor: row.try_get("actor")?,
        document: serde_json::from_str(&document_text)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("corrupt activity document: {e}")))?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_object(row: sqlx::sqlite::SqliteRow) -> Result<ObjectRecord, AppError> {
    let document_text: String = row.try_get("document")?;
    Ok(ObjectRecord {
        iri: row.try_get("iri")?,
        kind: row.try_get("kind")?,
        attributed_to: row.try_get("attributed_to")?,
        document: serde_json::from_str(&document_text)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("corrupt object document: {e}")))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        tombstoned: row.try_get::<i64, _>("tombstoned")? != 0,
    })
}

fn row_to_delivery_task(row: sqlx::sqlite::SqliteRow) -> Result<DeliveryTask, AppError> {
    let payload_text: String = row.try_get("payload")?;
    Ok(DeliveryTask {
        id: row.try_get("id")?,
        activity_iri: row.try_get("activity_iri")?,
        inbox_uri: row.try_get("inbox_uri")?,
        signing_actor: row.try_get("signing_actor")?,
        payload: serde_json::from_str(&payload_text)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("corrupt delivery payload: {e}")))?,
        attempts: row.try_get("attempts")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        last_error: row.try_get("last_error")?,
    })
}
