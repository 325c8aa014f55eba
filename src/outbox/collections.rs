//! Collection service (C7)
//!
//! Read side for an actor's outbox, followers, following and liked
//! collections, plus any named collection a `Target` in an Add/Remove
//! points at. Outbox and liked are streams of activities and page with
//! the store's opaque `seq` cursor; followers and following are flat
//! membership sets.

use std::sync::Arc;

use base64::Engine;
use serde_json::Value;

use crate::data::{normalize, ActivityRecord, Store};
use crate::error::AppError;

const DEFAULT_PAGE_SIZE: i64 = 20;

pub struct CollectionService {
    store: Arc<Store>,
}

pub struct Page {
    pub items: Vec<Value>,
    pub next_cursor: Option<String>,
}

impl CollectionService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Total item count, used for the `totalItems` field of a collection
    /// summary document.
    pub async fn total_items(&self, collection_iri: &str) -> Result<i64, AppError> {
        self.store.collection_count(collection_iri).await
    }

    /// Page through an activity-stream collection (outbox, liked) newest
    /// first. `cursor` is the opaque value previously returned as
    /// `next_cursor`; `None` starts from the most recent activity.
    pub async fn page_stream(
        &self,
        collection_iri: &str,
        cursor: Option<&str>,
        page_size: Option<i64>,
    ) -> Result<Page, AppError> {
        let before_seq = cursor.map(decode_cursor).transpose()?;
        let limit = page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, 100);

        let records = self.store.get_stream(collection_iri, before_seq, limit).await?;
        let next_cursor = records.last().map(|record| encode_cursor(record.seq));

        let items = records.into_iter().map(render_activity).collect();
        Ok(Page { items, next_cursor })
    }

    /// List the flat member set of followers/following/a named
    /// collection. These are not activity streams, so there's no seq
    /// cursor: callers page by simple offset if needed.
    pub async fn list_members(&self, collection_iri: &str) -> Result<Vec<String>, AppError> {
        let members = self.store.list_members(collection_iri).await?;
        Ok(members.into_iter().map(|m| m.activity_iri).collect())
    }
}

fn render_activity(record: ActivityRecord) -> Value {
    normalize::denormalize(&record.document, &normalize::default_context())
}

fn encode_cursor(seq: i64) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(seq.to_string())
}

fn decode_cursor(cursor: &str) -> Result<i64, AppError> {
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| AppError::InvalidActivity("invalid collection cursor".to_string()))?;
    let text = String::from_utf8(decoded)
        .map_err(|_| AppError::InvalidActivity("invalid collection cursor".to_string()))?;
    text.parse()
        .map_err(|_| AppError::InvalidActivity("invalid collection cursor".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_roundtrips() {
        let cursor = encode_cursor(42);
        assert_eq!(decode_cursor(&cursor).unwrap(), 42);
    }

    #[test]
    fn decode_cursor_rejects_garbage() {
        assert!(decode_cursor("not-a-cursor!!").is_err());
    }
}
