//! Transport-level retry with exponential backoff and jitter.
//!
//! This is the HTTP adapter's own retry loop for transient failures (429,
//! 5xx, dropped connections). It is unrelated to the engine's overflow
//! recovery: a truncated response is a successful HTTP exchange and never
//! reaches this module.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Backoff schedule for transient transport failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries (0 = fail on the first error).
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        if !self.jitter {
            return Duration::from_secs_f64(capped);
        }
        // Deterministic spread; avoids pulling in rand.
        const SPREAD: [f64; 4] = [0.75, 0.90, 0.60, 0.85];
        Duration::from_secs_f64(capped * SPREAD[attempt as usize % SPREAD.len()])
    }
}

/// How a transport error string should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth retrying: rate limits, gateway errors, dropped connections.
    Transient,
    /// Will fail again: bad request, auth, not found.
    Permanent,
}

const TRANSIENT_STATUSES: [&str; 5] = ["429", "500", "502", "503", "504"];
const PERMANENT_MARKERS: [&str; 8] = [
    "HTTP 400",
    "HTTP 401",
    "HTTP 403",
    "HTTP 404",
    "HTTP 422",
    "invalid",
    "bad request",
    "unauthorized",
];
const NETWORK_MARKERS: [&str; 7] = [
    "request failed:",
    "connection reset",
    "connection refused",
    "timed out",
    "timeout",
    "broken pipe",
    "network",
];

/// Classify an error string produced by the HTTP client.
pub fn classify(error: &str) -> FailureClass {
    if PERMANENT_MARKERS.iter().any(|m| error.contains(m)) {
        return FailureClass::Permanent;
    }
    if TRANSIENT_STATUSES
        .iter()
        .any(|s| error.contains(&format!("HTTP {s}")))
    {
        return FailureClass::Transient;
    }
    let lower = error.to_lowercase();
    if NETWORK_MARKERS.iter().any(|m| lower.contains(m)) {
        FailureClass::Transient
    } else {
        FailureClass::Permanent
    }
}

/// Run `call` until it succeeds, fails permanently, or retries run out.
pub async fn retry_transport<T, F, Fut>(config: &RetryConfig, mut call: F) -> Result<T, String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, String>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < config.max_retries && classify(&e) == FailureClass::Transient => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    "Transient transport error (attempt {}/{}): {e}. Retrying in {delay:?}...",
                    attempt + 1,
                    config.max_retries,
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn delay_grows_then_caps() {
        let config = RetryConfig {
            jitter: false,
            max_delay: Duration::from_secs(2),
            ..RetryConfig::with_retries(10)
        };
        assert!(config.delay_for_attempt(1) > config.delay_for_attempt(0));
        assert!(config.delay_for_attempt(2) > config.delay_for_attempt(1));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(2));
    }

    #[test]
    fn jitter_never_exceeds_base() {
        let jittered = RetryConfig::with_retries(3);
        let plain = RetryConfig {
            jitter: false,
            ..RetryConfig::with_retries(3)
        };
        for attempt in 0..6 {
            assert!(jittered.delay_for_attempt(attempt) <= plain.delay_for_attempt(attempt));
        }
    }

    #[test]
    fn classifies_transport_errors() {
        assert_eq!(classify("OpenRouter API HTTP 429 Too Many Requests: slow down"), FailureClass::Transient);
        assert_eq!(classify("OpenRouter API HTTP 503 Service Unavailable: x"), FailureClass::Transient);
        assert_eq!(classify("request failed: connection reset by peer"), FailureClass::Transient);
        assert_eq!(classify("OpenRouter API HTTP 401 Unauthorized: no key"), FailureClass::Permanent);
        assert_eq!(classify("OpenRouter API HTTP 400 Bad Request: bad schema"), FailureClass::Permanent);
        assert_eq!(classify("something odd"), FailureClass::Permanent);
    }

    #[test]
    fn config_round_trips_through_millis() {
        let config: RetryConfig =
            serde_json::from_str(r#"{"max_retries": 2, "initial_delay": 250}"#).unwrap();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.initial_delay, Duration::from_millis(250));
        assert_eq!(config.max_delay, Duration::from_secs(8));
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(1),
            ..RetryConfig::with_retries(3)
        };
        let calls = Cell::new(0);
        let result = retry_transport(&config, || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n < 3 {
                    Err("OpenRouter API HTTP 502 Bad Gateway: upstream".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(1),
            ..RetryConfig::with_retries(3)
        };
        let calls = Cell::new(0);
        let result: Result<(), String> = retry_transport(&config, || {
            calls.set(calls.get() + 1);
            async { Err("OpenRouter API HTTP 401 Unauthorized: no".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }
}
