use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::payload::validate_size;
use crate::storage::{Store, Subscription};

/// Seconds a push provider should hold an undelivered message. Call
/// signaling is worthless once the ring window has passed.
const PUSH_TTL_SECONDS: u64 = 60;

/// Opaque "send to endpoint" primitive. Implementations return the
/// provider's HTTP status; transport-level failures (DNS, timeout) are
/// `Err` and classified as transient by the fan-out engine.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, subscription: &Subscription, payload: &[u8]) -> Result<u16>;
}

/// Per-subscription delivery outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Channel-side failure worth retrying on a later event. `None` means
    /// the request never reached the provider.
    TransientFailure { status: Option<u16> },
    /// The provider reports the endpoint gone (404/410); the subscription
    /// is pruned from the registry.
    PermanentlyGone,
}

#[derive(Debug, Clone)]
pub struct EndpointOutcome {
    pub endpoint: String,
    pub outcome: DeliveryOutcome,
}

/// Result of fanning one payload out to all of a user's endpoints.
#[derive(Debug, Clone)]
pub enum DeliveryReport {
    /// The user has no registered endpoints. A valid "not reachable"
    /// outcome, not an error.
    NoSubscriptions,
    Attempted(Vec<EndpointOutcome>),
}

impl DeliveryReport {
    /// Any-success policy: a user with several devices only needs one of
    /// them to receive the signal.
    pub fn delivered(&self) -> bool {
        match self {
            DeliveryReport::NoSubscriptions => false,
            DeliveryReport::Attempted(outcomes) => outcomes
                .iter()
                .any(|o| o.outcome == DeliveryOutcome::Delivered),
        }
    }
}

/// One entry in a bulk delivery request.
pub struct Notification {
    pub id: String,
    pub user_id: i64,
    pub payload: Vec<u8>,
}

/// Fans a payload out to every subscription of a target user, concurrently
/// and independently, and prunes endpoints the channel reports gone.
#[derive(Clone)]
pub struct Fanout {
    store: Arc<dyn Store>,
    transport: Arc<dyn PushTransport>,
}

impl Fanout {
    pub fn new(store: Arc<dyn Store>, transport: Arc<dyn PushTransport>) -> Self {
        Self { store, transport }
    }

    pub async fn deliver(&self, user_id: i64, payload: &[u8]) -> Result<DeliveryReport> {
        if let Err(e) = validate_size(payload) {
            // The codec gates this before fan-out; reaching here is a bug.
            error!(user = %user_id, "oversized payload reached the delivery engine: {e}");
            return Err(e.into());
        }

        let subscriptions = self.store.subscriptions_for(user_id).await?;
        if subscriptions.is_empty() {
            debug!(user = %user_id, "no push subscriptions registered");
            return Ok(DeliveryReport::NoSubscriptions);
        }

        let attempts = subscriptions.iter().map(|sub| async {
            let outcome = self.attempt(sub, payload).await;
            EndpointOutcome {
                endpoint: sub.endpoint.clone(),
                outcome,
            }
        });
        let outcomes = join_all(attempts).await;

        for endpoint_outcome in &outcomes {
            if endpoint_outcome.outcome == DeliveryOutcome::PermanentlyGone {
                // Self-healing registry; does not block the delivery result.
                let store = self.store.clone();
                let endpoint = endpoint_outcome.endpoint.clone();
                tokio::spawn(async move {
                    match store.remove_subscription(user_id, &endpoint).await {
                        Ok(true) => {
                            debug!(user = %user_id, %endpoint, "pruned dead push subscription")
                        }
                        Ok(false) => {}
                        Err(e) => {
                            warn!(user = %user_id, %endpoint, "failed to prune subscription: {e}")
                        }
                    }
                });
            }
        }

        let report = DeliveryReport::Attempted(outcomes);
        debug!(
            user = %user_id,
            delivered = report.delivered(),
            "push fan-out complete"
        );
        Ok(report)
    }

    /// Batched `deliver`: one report per notification id. One
    /// notification's subscription failures never affect another's report.
    pub async fn deliver_bulk(
        &self,
        notifications: Vec<Notification>,
    ) -> HashMap<String, DeliveryReport> {
        let reports = join_all(notifications.iter().map(|n| async {
            let report = match self.deliver(n.user_id, &n.payload).await {
                Ok(report) => report,
                Err(e) => {
                    error!(id = %n.id, user = %n.user_id, "bulk delivery failed: {e}");
                    DeliveryReport::Attempted(Vec::new())
                }
            };
            (n.id.clone(), report)
        }))
        .await;
        reports.into_iter().collect()
    }

    async fn attempt(&self, subscription: &Subscription, payload: &[u8]) -> DeliveryOutcome {
        match self.transport.send(subscription, payload).await {
            Ok(status) if (200..300).contains(&status) => DeliveryOutcome::Delivered,
            Ok(status @ (404 | 410)) => {
                debug!(
                    user = %subscription.user_id,
                    endpoint = %subscription.endpoint,
                    status,
                    "push endpoint permanently gone"
                );
                DeliveryOutcome::PermanentlyGone
            }
            Ok(status) => {
                warn!(
                    user = %subscription.user_id,
                    endpoint = %subscription.endpoint,
                    status,
                    "push provider rejected delivery"
                );
                DeliveryOutcome::TransientFailure {
                    status: Some(status),
                }
            }
            Err(e) => {
                warn!(
                    user = %subscription.user_id,
                    endpoint = %subscription.endpoint,
                    "push send failed: {e}"
                );
                DeliveryOutcome::TransientFailure { status: None }
            }
        }
    }
}

/// Signs VAPID authorization headers for push requests (RFC 8292).
pub struct VapidSigner {
    encoding_key: EncodingKey,
    public_key: String,
    subject: String,
}

#[derive(Serialize)]
struct VapidClaims {
    aud: String,
    exp: i64,
    sub: String,
}

impl VapidSigner {
    /// `private_key_pem` is the ES256 signing key; `public_key` is the
    /// base64url-encoded uncompressed P-256 point advertised to clients.
    pub fn new(private_key_pem: &str, public_key: String, subject: String) -> Result<Self> {
        let encoding_key = EncodingKey::from_ec_pem(private_key_pem.as_bytes())
            .context("invalid VAPID private key PEM")?;
        Ok(Self {
            encoding_key,
            public_key,
            subject,
        })
    }

    fn authorization_for(&self, endpoint: &str) -> Result<String> {
        let url = reqwest::Url::parse(endpoint).context("invalid push endpoint url")?;
        let claims = VapidClaims {
            aud: url.origin().ascii_serialization(),
            exp: (Utc::now() + chrono::Duration::hours(12)).timestamp(),
            sub: self.subject.clone(),
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::ES256),
            &claims,
            &self.encoding_key,
        )?;
        Ok(format!("vapid t={}, k={}", token, self.public_key))
    }
}

/// Reference HTTP adapter for the push channel: POSTs the payload to the
/// subscription endpoint with VAPID authorization. Content encryption is
/// owned by the fronting push gateway.
pub struct WebPushTransport {
    client: reqwest::Client,
    vapid: Option<VapidSigner>,
}

impl WebPushTransport {
    pub fn new(attempt_timeout: Duration, vapid: Option<VapidSigner>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(attempt_timeout)
            .build()
            .context("failed to build push http client")?;
        Ok(Self { client, vapid })
    }
}

#[async_trait]
impl PushTransport for WebPushTransport {
    async fn send(&self, subscription: &Subscription, payload: &[u8]) -> Result<u16> {
        let mut request = self
            .client
            .post(&subscription.endpoint)
            .header("TTL", PUSH_TTL_SECONDS)
            .header("Urgency", "high")
            .header("Content-Encoding", &subscription.content_encoding)
            .body(payload.to_vec());

        if let Some(vapid) = &self.vapid {
            request = request.header(
                "Authorization",
                vapid.authorization_for(&subscription.endpoint)?,
            );
        }

        let response = request.send().await.context("push request failed")?;
        Ok(response.status().as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use tokio::sync::Mutex;

    /// Scripted transport: maps endpoint -> HTTP status, `0` meaning a
    /// transport-level error. Records every endpoint it was asked to hit.
    struct MockTransport {
        responses: HashMap<String, u16>,
        calls: Mutex<Vec<String>>,
    }

    impl MockTransport {
        fn new(responses: Vec<(&str, u16)>) -> Self {
            Self {
                responses: responses
                    .into_iter()
                    .map(|(endpoint, status)| (endpoint.to_string(), status))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PushTransport for MockTransport {
        async fn send(&self, subscription: &Subscription, _payload: &[u8]) -> Result<u16> {
            self.calls.lock().await.push(subscription.endpoint.clone());
            match self.responses.get(&subscription.endpoint) {
                Some(0) => Err(anyhow::anyhow!("connection refused")),
                Some(status) => Ok(*status),
                None => Ok(201),
            }
        }
    }

    fn sub(user_id: i64, endpoint: &str) -> Subscription {
        Subscription::new(
            user_id,
            endpoint.to_string(),
            "p256dh".into(),
            "auth".into(),
            None,
        )
    }

    async fn fanout_with(
        subs: Vec<Subscription>,
        responses: Vec<(&str, u16)>,
    ) -> (Fanout, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        for s in subs {
            store.upsert_subscription(s).await.unwrap();
        }
        let transport = Arc::new(MockTransport::new(responses));
        (Fanout::new(store.clone(), transport), store)
    }

    #[tokio::test]
    async fn unreachable_user_reports_no_subscriptions() {
        let (fanout, _store) = fanout_with(Vec::new(), Vec::new()).await;
        let report = fanout.deliver(9, b"{}").await.unwrap();
        assert!(matches!(report, DeliveryReport::NoSubscriptions));
        assert!(!report.delivered());
    }

    #[tokio::test]
    async fn gone_endpoint_is_pruned_and_any_success_counts() {
        let (fanout, store) = fanout_with(
            vec![
                sub(1, "https://push.example/a"),
                sub(1, "https://push.example/b"),
                sub(1, "https://push.example/c"),
            ],
            vec![
                ("https://push.example/a", 201),
                ("https://push.example/b", 410),
                ("https://push.example/c", 500),
            ],
        )
        .await;

        let report = fanout.deliver(1, b"{}").await.unwrap();
        assert!(report.delivered());
        match &report {
            DeliveryReport::Attempted(outcomes) => {
                assert_eq!(outcomes.len(), 3);
                let of = |endpoint: &str| {
                    outcomes
                        .iter()
                        .find(|o| o.endpoint == endpoint)
                        .unwrap()
                        .outcome
                        .clone()
                };
                assert_eq!(of("https://push.example/a"), DeliveryOutcome::Delivered);
                assert_eq!(
                    of("https://push.example/b"),
                    DeliveryOutcome::PermanentlyGone
                );
                assert_eq!(
                    of("https://push.example/c"),
                    DeliveryOutcome::TransientFailure { status: Some(500) }
                );
            }
            other => panic!("expected attempts, got {other:?}"),
        }

        // Pruning is spawned off the delivery path; give it a beat to land.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let remaining = store.subscriptions_for(1).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining
            .iter()
            .all(|s| s.endpoint != "https://push.example/b"));
    }

    #[tokio::test]
    async fn all_failures_report_not_delivered_without_pruning() {
        let (fanout, store) = fanout_with(
            vec![
                sub(1, "https://push.example/a"),
                sub(1, "https://push.example/b"),
            ],
            vec![
                ("https://push.example/a", 500),
                ("https://push.example/b", 0),
            ],
        )
        .await;

        let report = fanout.deliver(1, b"{}").await.unwrap();
        assert!(!report.delivered());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.subscriptions_for(1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn oversized_payload_never_reaches_the_transport() {
        let store = Arc::new(MemoryStore::default());
        store
            .upsert_subscription(sub(1, "https://push.example/a"))
            .await
            .unwrap();
        let transport = Arc::new(MockTransport::new(Vec::new()));
        let fanout = Fanout::new(store, transport.clone());

        let payload = vec![b'x'; 5000];
        assert!(fanout.deliver(1, &payload).await.is_err());
        assert!(transport.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn bulk_reports_are_isolated_per_notification() {
        let (fanout, _store) = fanout_with(
            vec![sub(1, "https://push.example/a")],
            vec![("https://push.example/a", 201)],
        )
        .await;

        let reports = fanout
            .deliver_bulk(vec![
                Notification {
                    id: "n1".into(),
                    user_id: 1,
                    payload: b"{}".to_vec(),
                },
                Notification {
                    id: "n2".into(),
                    user_id: 42, // nobody home
                    payload: b"{}".to_vec(),
                },
            ])
            .await;

        assert!(reports["n1"].delivered());
        assert!(matches!(reports["n2"], DeliveryReport::NoSubscriptions));
    }
}
