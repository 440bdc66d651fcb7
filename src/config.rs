use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,
    /// Ring window: how long an offer stays answerable.
    pub call_timeout_seconds: i64,
    /// How often the background sweeper expires overdue sessions.
    pub sweep_interval_seconds: u64,
    /// Per-attempt push request timeout.
    pub push_timeout_seconds: u64,
    pub vapid_subject: String,
    pub vapid_public_key: Option<String>,
    pub vapid_private_key_pem: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("SHORECALL_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            call_timeout_seconds: env::var("CALL_TIMEOUT")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(60),
            sweep_interval_seconds: env::var("SWEEP_INTERVAL")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(30),
            push_timeout_seconds: env::var("PUSH_TIMEOUT")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(10),
            vapid_subject: env::var("VAPID_SUBJECT")
                .unwrap_or_else(|_| "mailto:admin@localhost".to_string()),
            vapid_public_key: env::var("VAPID_PUBLIC_KEY").ok(),
            vapid_private_key_pem: env::var("VAPID_PRIVATE_KEY_PEM").ok(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            redis_url: "redis://localhost:6379".to_string(),
            call_timeout_seconds: 60,
            sweep_interval_seconds: 30,
            push_timeout_seconds: 10,
            vapid_subject: "mailto:admin@localhost".to_string(),
            vapid_public_key: None,
            vapid_private_key_pem: None,
        }
    }
}
