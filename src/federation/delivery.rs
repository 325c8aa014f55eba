//! Delivery engine (C8)
//!
//! Signs and POSTs an activity to a single recipient inbox, fans out to
//! many recipients with bounded concurrency, and classifies failures into
//! permanent (drop) versus transient (requeue with exponential backoff).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::data::Store;
use crate::error::AppError;

/// Outcome of attempting a single delivery, used for both the immediate
/// fan-out path and the requeue sweeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    /// 4xx other than 408/429 — will never succeed, drop it.
    Permanent,
    /// 5xx, network error, 408, or 429 — worth retrying.
    Transient,
}

fn classify(result: &Result<reqwest::Response, reqwest::Error>) -> (Outcome, String) {
    match result {
        Ok(response) if response.status().is_success() => (Outcome::Delivered, String::new()),
        Ok(response) => {
            let status = response.status();
            let message = format!("HTTP {status}");
            if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() {
                (Outcome::Transient, message)
            } else {
                (Outcome::Permanent, message)
            }
        }
        Err(error) => (Outcome::Transient, error.to_string()),
    }
}

/// Dedup identical inbox URIs while keeping distinct personal inboxes —
/// recipients on the same domain with different inbox paths must not be
/// collapsed into one delivery.
pub fn unique_inbox_targets(inbox_uris: Vec<String>) -> Vec<String> {
    use std::collections::HashSet;

    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    for inbox_uri in inbox_uris {
        if seen.insert(inbox_uri.clone()) {
            targets.push(inbox_uri);
        }
    }
    targets
}

#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub inbox_uri: String,
    pub outcome: Outcome,
    pub detail: String,
}

#[derive(Clone)]
pub struct DeliveryEngine {
    http_client: reqwest::Client,
    store: Arc<Store>,
    max_concurrent: usize,
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl DeliveryEngine {
    pub fn new(
        http_client: reqwest::Client,
        store: Arc<Store>,
        max_concurrent: usize,
        max_retries: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            http_client,
            store,
            max_concurrent,
            max_retries,
            initial_backoff,
            max_backoff,
        }
    }

    /// Sign and POST one activity to one inbox.
    async fn attempt(
        &self,
        inbox_uri: &str,
        signing_actor: &str,
        private_key_pem: &str,
        payload: &serde_json::Value,
    ) -> (Outcome, String) {
        let body = match serde_json::to_vec(payload) {
            Ok(b) => b,
            Err(e) => return (Outcome::Permanent, format!("failed to serialize activity: {e}")),
        };

        let key_id = format!("{signing_actor}#main-key");
        let sig_headers = match super::signature::sign_request(
            "POST",
            inbox_uri,
            Some(&body),
            private_key_pem,
            &key_id,
        ) {
            Ok(h) => h,
            Err(e) => return (Outcome::Permanent, format!("failed to sign request: {e}")),
        };

        let mut request = self
            .http_client
            .post(inbox_uri)
            .header("Content-Type", "application/activity+json")
            .header("Date", sig_headers.date)
            .header("Signature", sig_headers.signature);

        if let Some(digest) = sig_headers.digest {
            request = request.header("Digest", digest);
        }

        let result = request.body(body).send().await;
        classify(&result)
    }

    /// Queue a delivery to each recipient and run it immediately. Failures
    /// classified `Transient` are rescheduled in the delivery_queue table;
    /// `Permanent` failures are dropped and logged.
    pub async fn deliver(
        &self,
        activity_iri: &str,
        signing_actor: &str,
        private_key_pem: &str,
        payload: serde_json::Value,
        inbox_uris: Vec<String>,
    ) -> Vec<DeliveryResult> {
        use tokio::sync::Semaphore;

        let targets = unique_inbox_targets(inbox_uris);
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let payload = Arc::new(payload);

        let mut tasks = Vec::new();
        for inbox_uri in targets {
            let semaphore = semaphore.clone();
            let payload = payload.clone();
            let engine = self.clone();
            let activity_iri = activity_iri.to_string();
            let signing_actor = signing_actor.to_string();
            let private_key_pem = private_key_pem.to_string();

            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore not closed");
                let (outcome, detail) = engine
                    .attempt(&inbox_uri, &signing_actor, &private_key_pem, &payload)
                    .await;

                use crate::metrics::{DELIVERIES_TOTAL, DELIVERY_RETRIES_TOTAL};
                match outcome {
                    Outcome::Delivered => DELIVERIES_TOTAL.with_label_values(&["delivered"]).inc(),
                    Outcome::Permanent => DELIVERIES_TOTAL.with_label_values(&["permanent_failure"]).inc(),
                    Outcome::Transient => {
                        DELIVERIES_TOTAL.with_label_values(&["requeued"]).inc();
                        DELIVERY_RETRIES_TOTAL.inc();
                        let next = Utc::now() + chrono::Duration::from_std(engine.initial_backoff).unwrap_or_default();
                        let _ = engine
                            .store
                            .enqueue_delivery(&activity_iri, &inbox_uri, &signing_actor, &payload, next)
                            .await;
                    }
                }

                DeliveryResult {
                    inbox_uri,
                    outcome,
                    detail,
                }
            }));
        }

        let mut results = Vec::new();
        for task in tasks {
            if let Ok(result) = task.await {
                results.push(result);
            }
        }
        results
    }

    /// Process deliveries sitting in the queue whose `next_attempt_at` has
    /// passed. Called on a fixed interval from the background sweeper.
    pub async fn sweep_due(&self) -> Result<(), AppError> {
        let due = self.store.due_deliveries(self.max_concurrent as i64).await?;

        for task in due {
            let private_key_pem = match self.lookup_private_key(&task.signing_actor).await {
                Some(pem) => pem,
                None => {
                    self.store
                        .abandon_delivery(&task.id, "signing actor has no private key on record")
                        .await?;
                    continue;
                }
            };

            let (outcome, detail) = self
                .attempt(&task.inbox_uri, &task.signing_actor, &private_key_pem, &task.payload)
                .await;

            match outcome {
                Outcome::Delivered => {
                    self.store.complete_delivery(&task.id).await?;
                    use crate::metrics::DELIVERIES_TOTAL;
                    DELIVERIES_TOTAL.with_label_values(&["delivered"]).inc();
                }
                Outcome::Permanent => {
                    self.store.abandon_delivery(&task.id, &detail).await?;
                    use crate::metrics::DELIVERIES_TOTAL;
                    DELIVERIES_TOTAL.with_label_values(&["permanent_failure"]).inc();
                }
                Outcome::Transient => {
                    let attempts = task.attempts as u32 + 1;
                    if attempts >= self.max_retries {
                        self.store.abandon_delivery(&task.id, &detail).await?;
                        use crate::metrics::DELIVERIES_TOTAL;
                        DELIVERIES_TOTAL.with_label_values(&["exhausted"]).inc();
                    } else {
                        let backoff = self.backoff_for_attempt(attempts);
                        let next = Utc::now() + chrono::Duration::from_std(backoff).unwrap_or_default();
                        self.store.reschedule_delivery(&task.id, next, &detail).await?;
                        use crate::metrics::{DELIVERIES_TOTAL, DELIVERY_RETRIES_TOTAL};
                        DELIVERIES_TOTAL.with_label_values(&["requeued"]).inc();
                        DELIVERY_RETRIES_TOTAL.inc();
                    }
                }
            }
        }

        Ok(())
    }

    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.initial_backoff.saturating_mul(1 << attempt.min(16));
        scaled.min(self.max_backoff)
    }

    async fn lookup_private_key(&self, actor_iri: &str) -> Option<String> {
        sqlx::query_scalar::<_, Option<String>>(
            "SELECT private_key_pem FROM actors WHERE iri = ?",
        )
        .bind(actor_iri)
        .fetch_optional(self.store.pool())
        .await
        .ok()
        .flatten()
        .flatten()
    }
}

/// Spawn the background loop that periodically sweeps due deliveries.
pub fn spawn_requeue_sweeper(engine: DeliveryEngine, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(error) = engine.sweep_due().await {
                tracing::error!(%error, "delivery requeue sweep failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_inbox_targets_keeps_distinct_personal_inboxes_on_same_domain() {
        let inboxes = vec![
            "https://remote.example/users/alice/inbox".to_string(),
            "https://remote.example/users/bob/inbox".to_string(),
        ];
        let result = unique_inbox_targets(inboxes.clone());
        assert_eq!(result, inboxes);
    }

    #[test]
    fn unique_inbox_targets_deduplicates_identical_shared_inbox_uris() {
        let inboxes = vec![
            "https://remote.example/inbox".to_string(),
            "https://remote.example/inbox".to_string(),
        ];
        assert_eq!(
            unique_inbox_targets(inboxes),
            vec!["https://remote.example/inbox".to_string()]
        );
    }

    #[test]
    fn unique_inbox_targets_handles_empty_input() {
        assert!(unique_inbox_targets(Vec::new()).is_empty());
    }
}
