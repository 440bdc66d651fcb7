use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use serde::{Deserialize, Serialize};

use crate::session::{CallSession, CallStatus};

/// One registered push endpoint for a user. Unique per (user_id, endpoint);
/// re-subscribing with the same endpoint updates the row in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub user_id: i64,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
    pub content_encoding: String,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new(
        user_id: i64,
        endpoint: String,
        p256dh: String,
        auth: String,
        user_agent: Option<String>,
    ) -> Self {
        Self {
            user_id,
            endpoint,
            p256dh,
            auth,
            content_encoding: "aesgcm".to_string(),
            user_agent,
            created_at: Utc::now(),
        }
    }
}

/// Durable shared state: the subscription registry, call-session rows and
/// badge counters. Session status moves only through `swap_status`, a
/// compare-and-swap keyed on the expected pre-state, so concurrent
/// transitions resolve to a single winner without any in-process lock.
#[async_trait]
pub trait Store: Send + Sync {
    // Subscription registry
    async fn upsert_subscription(&self, sub: Subscription) -> Result<()>;
    async fn remove_subscription(&self, user_id: i64, endpoint: &str) -> Result<bool>;
    async fn subscriptions_for(&self, user_id: i64) -> Result<Vec<Subscription>>;
    /// Whether the user has at least one registered endpoint.
    async fn user_reachable(&self, user_id: i64) -> Result<bool>;

    // Call sessions
    async fn insert_session(&self, session: &CallSession) -> Result<()>;
    async fn get_session(&self, call_id: &str) -> Result<Option<CallSession>>;
    /// Replace the session row with `next` only if the current status is one
    /// of `expected`. Returns whether the swap landed.
    async fn swap_status(
        &self,
        call_id: &str,
        expected: &[CallStatus],
        next: &CallSession,
    ) -> Result<bool>;
    /// Call IDs whose ring deadline is at or before `now`, from the expiry
    /// index. Callers still re-check status via `swap_status`.
    async fn expired_candidates(&self, now: DateTime<Utc>) -> Result<Vec<String>>;
    /// Drop a session from the expiry index once it is observed terminal.
    async fn remove_expiry(&self, call_id: &str) -> Result<()>;

    // Badge counter
    async fn increment_badge(&self, user_id: i64) -> Result<u64>;
    async fn clear_badge(&self, user_id: i64) -> Result<()>;
    async fn badge_count(&self, user_id: i64) -> Result<u64>;
}

// Swap the row only when its current status matches one of the expected
// pre-states. ARGV: expected statuses..., new row JSON last.
const SWAP_STATUS_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
    return 0
end
local row = cjson.decode(raw)
for i = 1, #ARGV - 1 do
    if row.status == ARGV[i] then
        redis.call('SET', KEYS[1], ARGV[#ARGV])
        return 1
    end
end
return 0
"#;

#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    swap_script: Script,
}

impl RedisStore {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self {
            redis,
            swap_script: Script::new(SWAP_STATUS_SCRIPT),
        })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn upsert_subscription(&self, sub: Subscription) -> Result<()> {
        let mut conn = self.redis.clone();
        let key = subscriptions_key(sub.user_id);
        let row = serde_json::to_string(&sub)?;
        conn.hset::<_, _, _, ()>(&key, &sub.endpoint, row).await?;
        Ok(())
    }

    async fn remove_subscription(&self, user_id: i64, endpoint: &str) -> Result<bool> {
        let mut conn = self.redis.clone();
        let removed: i64 = conn.hdel(subscriptions_key(user_id), endpoint).await?;
        Ok(removed > 0)
    }

    async fn subscriptions_for(&self, user_id: i64) -> Result<Vec<Subscription>> {
        let mut conn = self.redis.clone();
        let rows: Vec<String> = conn.hvals(subscriptions_key(user_id)).await?;
        Ok(rows
            .iter()
            .filter_map(|row| serde_json::from_str(row).ok())
            .collect())
    }

    async fn user_reachable(&self, user_id: i64) -> Result<bool> {
        let mut conn = self.redis.clone();
        let exists: bool = conn.exists(subscriptions_key(user_id)).await?;
        Ok(exists)
    }

    async fn insert_session(&self, session: &CallSession) -> Result<()> {
        let mut conn = self.redis.clone();
        let row = serde_json::to_string(session)?;
        // Row plus expiry-index entry; the row itself carries no TTL,
        // retention is an external policy.
        redis::pipe()
            .cmd("SET")
            .arg(call_key(&session.call_id))
            .arg(row)
            .ignore()
            .cmd("ZADD")
            .arg(EXPIRY_INDEX_KEY)
            .arg(session.expires_at.timestamp())
            .arg(&session.call_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_session(&self, call_id: &str) -> Result<Option<CallSession>> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(call_key(call_id)).await?;
        match raw {
            Some(row) => Ok(Some(serde_json::from_str(&row)?)),
            None => Ok(None),
        }
    }

    async fn swap_status(
        &self,
        call_id: &str,
        expected: &[CallStatus],
        next: &CallSession,
    ) -> Result<bool> {
        let mut conn = self.redis.clone();
        let row = serde_json::to_string(next)?;
        let mut invocation = self.swap_script.prepare_invoke();
        invocation.key(call_key(call_id));
        for status in expected {
            invocation.arg(status.as_str());
        }
        invocation.arg(row);
        let swapped: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(swapped == 1)
    }

    async fn expired_candidates(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .zrangebyscore(EXPIRY_INDEX_KEY, "-inf", now.timestamp())
            .await?;
        Ok(ids)
    }

    async fn remove_expiry(&self, call_id: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        conn.zrem::<_, _, ()>(EXPIRY_INDEX_KEY, call_id).await?;
        Ok(())
    }

    async fn increment_badge(&self, user_id: i64) -> Result<u64> {
        let mut conn = self.redis.clone();
        let count: u64 = conn.incr(badge_key(user_id), 1).await?;
        Ok(count)
    }

    async fn clear_badge(&self, user_id: i64) -> Result<()> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(badge_key(user_id), 0).await?;
        Ok(())
    }

    async fn badge_count(&self, user_id: i64) -> Result<u64> {
        let mut conn = self.redis.clone();
        let count: Option<u64> = conn.get(badge_key(user_id)).await?;
        Ok(count.unwrap_or(0))
    }
}

const EXPIRY_INDEX_KEY: &str = "calls:by_expiry";

fn subscriptions_key(user_id: i64) -> String {
    format!("user:{}:push_subs", user_id)
}

fn call_key(call_id: &str) -> String {
    format!("call:{}", call_id)
}

fn badge_key(user_id: i64) -> String {
    format!("user:{}:badge", user_id)
}

#[cfg(test)]
pub mod memory {
    //! In-memory `Store` used by the fan-out and coordinator tests. Applies
    //! the same expected-status compare-and-swap contract as the Redis
    //! implementation.

    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Inner {
        subs: HashMap<i64, HashMap<String, Subscription>>,
        sessions: HashMap<String, CallSession>,
        expiry: HashMap<String, DateTime<Utc>>,
        badges: HashMap<i64, u64>,
    }

    #[derive(Default)]
    pub struct MemoryStore {
        inner: Mutex<Inner>,
    }

    #[async_trait]
    impl Store for MemoryStore {
        async fn upsert_subscription(&self, sub: Subscription) -> Result<()> {
            let mut inner = self.inner.lock().await;
            inner
                .subs
                .entry(sub.user_id)
                .or_default()
                .insert(sub.endpoint.clone(), sub);
            Ok(())
        }

        async fn remove_subscription(&self, user_id: i64, endpoint: &str) -> Result<bool> {
            let mut inner = self.inner.lock().await;
            Ok(inner
                .subs
                .get_mut(&user_id)
                .map(|subs| subs.remove(endpoint).is_some())
                .unwrap_or(false))
        }

        async fn subscriptions_for(&self, user_id: i64) -> Result<Vec<Subscription>> {
            let inner = self.inner.lock().await;
            Ok(inner
                .subs
                .get(&user_id)
                .map(|subs| subs.values().cloned().collect())
                .unwrap_or_default())
        }

        async fn user_reachable(&self, user_id: i64) -> Result<bool> {
            let inner = self.inner.lock().await;
            Ok(inner.subs.get(&user_id).is_some_and(|subs| !subs.is_empty()))
        }

        async fn insert_session(&self, session: &CallSession) -> Result<()> {
            let mut inner = self.inner.lock().await;
            inner
                .sessions
                .insert(session.call_id.clone(), session.clone());
            inner
                .expiry
                .insert(session.call_id.clone(), session.expires_at);
            Ok(())
        }

        async fn get_session(&self, call_id: &str) -> Result<Option<CallSession>> {
            let inner = self.inner.lock().await;
            Ok(inner.sessions.get(call_id).cloned())
        }

        async fn swap_status(
            &self,
            call_id: &str,
            expected: &[CallStatus],
            next: &CallSession,
        ) -> Result<bool> {
            let mut inner = self.inner.lock().await;
            match inner.sessions.get(call_id) {
                Some(current) if expected.contains(&current.status) => {
                    inner.sessions.insert(call_id.to_string(), next.clone());
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn expired_candidates(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
            let inner = self.inner.lock().await;
            Ok(inner
                .expiry
                .iter()
                .filter(|(_, expires_at)| **expires_at <= now)
                .map(|(call_id, _)| call_id.clone())
                .collect())
        }

        async fn remove_expiry(&self, call_id: &str) -> Result<()> {
            let mut inner = self.inner.lock().await;
            inner.expiry.remove(call_id);
            Ok(())
        }

        async fn increment_badge(&self, user_id: i64) -> Result<u64> {
            let mut inner = self.inner.lock().await;
            let badge = inner.badges.entry(user_id).or_insert(0);
            *badge += 1;
            Ok(*badge)
        }

        async fn clear_badge(&self, user_id: i64) -> Result<()> {
            let mut inner = self.inner.lock().await;
            inner.badges.insert(user_id, 0);
            Ok(())
        }

        async fn badge_count(&self, user_id: i64) -> Result<u64> {
            let inner = self.inner.lock().await;
            Ok(inner.badges.get(&user_id).copied().unwrap_or(0))
        }
    }

    #[tokio::test]
    async fn resubscribe_updates_in_place() {
        let store = MemoryStore::default();
        let mut sub = Subscription::new(
            1,
            "https://push.example/ep1".into(),
            "key1".into(),
            "auth1".into(),
            None,
        );
        store.upsert_subscription(sub.clone()).await.unwrap();
        sub.p256dh = "key2".into();
        store.upsert_subscription(sub).await.unwrap();

        let subs = store.subscriptions_for(1).await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].p256dh, "key2");
    }

    #[tokio::test]
    async fn swap_requires_expected_status() {
        use crate::session::{CallType, EndReason};
        use chrono::Duration;
        use serde_json::json;

        let store = MemoryStore::default();
        let session = CallSession::new_offer(
            1,
            2,
            CallType::Video,
            json!({"sdp": "v=0"}),
            Duration::seconds(60),
        )
        .unwrap();
        store.insert_session(&session).await.unwrap();

        let resolved = session.resolved_with(EndReason::Ended);
        assert!(store
            .swap_status(&session.call_id, &[CallStatus::Pending], &resolved)
            .await
            .unwrap());
        // Second swap expects pending again and must lose.
        assert!(!store
            .swap_status(&session.call_id, &[CallStatus::Pending], &resolved)
            .await
            .unwrap());
        let row = store.get_session(&session.call_id).await.unwrap().unwrap();
        assert_eq!(row.status, CallStatus::Ended);
    }
}
