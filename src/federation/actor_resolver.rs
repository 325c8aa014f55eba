//! Actor resolver (C3)
//!
//! Resolves an actor IRI to its document, either from the local store (for
//! this instance's own actors) or by fetching it over HTTP and caching the
//! result. Caching uses `moka`, the same async-cache crate already used
//! elsewhere in the data layer, rather than a bespoke TTL map.

use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

use crate::data::{Actor, Store};
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct ResolvedActor {
    pub iri: String,
    pub inbox: String,
    pub shared_inbox: Option<String>,
    pub public_key_pem: String,
    pub document: serde_json::Value,
}

impl From<Actor> for ResolvedActor {
    fn from(a: Actor) -> Self {
        Self {
            iri: a.iri,
            inbox: a.inbox,
            shared_inbox: a.shared_inbox,
            public_key_pem: a.public_key_pem,
            document: a.document,
        }
    }
}

/// Caches remote actor documents; local actors always come from the store
/// directly since they can change (key rotation, profile edits) without
/// this process being told to invalidate a cache entry.
pub struct ActorResolver {
    store: Arc<Store>,
    http_client: reqwest::Client,
    cache: Cache<String, Arc<ResolvedActor>>,
}

impl ActorResolver {
    pub fn new(store: Arc<Store>, http_client: reqwest::Client, ttl: Duration) -> Self {
        let cache = Cache::builder().time_to_live(ttl).build();
        Self {
            store,
            http_client,
            cache,
        }
    }

    /// Resolve an actor IRI against the local store only, never falling
    /// back to a remote fetch. Used for endpoints scoped to this instance's
    /// own actors (outbox submission, profile reads): querying them for a
    /// name this instance doesn't host must never turn into an outbound
    /// HTTP call to that same path.
    pub async fn resolve_local(&self, iri: &str) -> Result<Option<Arc<ResolvedActor>>, AppError> {
        Ok(self.lookup_local(iri).await?.map(Arc::new))
    }

    /// Resolve an actor IRI, preferring the local store, falling back to
    /// the cache, falling back to a live fetch.
    pub async fn resolve(&self, iri: &str) -> Result<Arc<ResolvedActor>, AppError> {
        if let Some(local) = self.lookup_local(iri).await? {
            return Ok(Arc::new(local));
        }

        if let Some(cached) = self.cache.get(iri).await {
            use crate::metrics::CACHE_HITS_TOTAL;
            CACHE_HITS_TOTAL.with_label_values(&["actor"]).inc();
            return Ok(cached);
        }

        use crate::metrics::CACHE_MISSES_TOTAL;
        CACHE_MISSES_TOTAL.with_label_values(&["actor"]).inc();

        let fetched = self.fetch_remote(iri).await?;
        let fetched = Arc::new(fetched);
        self.cache.insert(iri.to_string(), fetched.clone()).await;

        use crate::metrics::CACHE_SIZE;
        CACHE_SIZE
            .with_label_values(&["actor"])
            .set(self.cache.entry_count() as i64);

        Ok(fetched)
    }

    async fn lookup_local(&self, iri: &str) -> Result<Option<ResolvedActor>, AppError> {
        let row = sqlx::query(
            "SELECT iri, preferred_username, inbox, shared_inbox, is_local, public_key_pem, private_key_pem, document, created_at, cached_until FROM actors WHERE iri = ? AND is_local = 1",
        )
        .bind(iri)
        .fetch_optional(self.store.pool())
        .await?;

        row.map(row_to_actor).transpose().map(|a| a.map(ResolvedActor::from))
    }

    async fn fetch_remote(&self, iri: &str) -> Result<ResolvedActor, AppError> {
        let response = self
            .http_client
            .get(iri)
            .header("Accept", "application/activity+json")
            .send()
            .await
            .map_err(|e| AppError::Federation(format!("failed to fetch actor {iri}: {e}")))?;

        if !response.status().is_success() {
            return Err(AppError::Federation(format!(
                "failed to fetch actor {iri}: HTTP {}",
                response.status()
            )));
        }

        let document: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AppError::Federation(format!("failed to parse actor {iri}: {e}")))?;

        let inbox = document
            .get("inbox")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::Federation(format!("actor {iri} has no inbox")))?
            .to_string();

        let shared_inbox = document
            .get("endpoints")
            .and_then(|e| e.get("sharedInbox"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let public_key_pem = document
            .get("publicKey")
            .and_then(|pk| pk.get("publicKeyPem"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::Federation(format!("actor {iri} has no publicKeyPem")))?
            .to_string();

        Ok(ResolvedActor {
            iri: iri.to_string(),
            inbox,
            shared_inbox,
            public_key_pem,
            document,
        })
    }

    /// Drop a cached entry, used when a signature verification against it
    /// fails and the key may have rotated.
    pub async fn invalidate(&self, iri: &str) {
        self.cache.invalidate(iri).await;
    }
}

fn row_to_actor(row: sqlx::sqlite::SqliteRow) -> Result<Actor, AppError> {
    use sqlx::Row;
    let document_text: String = row.try_get("document")?;
    Ok(Actor {
        iri: row.try_get("iri")?,
        preferred_username: row.try_get("preferred_username")?,
        inbox: row.try_get("inbox")?,
        shared_inbox: row.try_get("shared_inbox")?,
        is_local: row.try_get("is_local")?,
        public_key_pem: row.try_get("public_key_pem")?,
        private_key_pem: row.try_get("private_key_pem")?,
        document: serde_json::from_str(&document_text)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("corrupt actor document: {e}")))?,
        created_at: row.try_get("created_at")?,
        cached_until: row.try_get("cached_until")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_actor_from_row() {
        let actor = Actor {
            iri: "https://example.com/users/alice".into(),
            preferred_username: "alice".into(),
            inbox: "https://example.com/users/alice/inbox".into(),
            shared_inbox: None,
            is_local: true,
            public_key_pem: "PEM".into(),
            private_key_pem: Some("PRIVATE".into()),
            document: serde_json::json!({"id": "https://example.com/users/alice"}),
            created_at: chrono::Utc::now(),
            cached_until: None,
        };
        let resolved: ResolvedActor = actor.into();
        assert_eq!(resolved.inbox, "https://example.com/users/alice/inbox");
    }
}
