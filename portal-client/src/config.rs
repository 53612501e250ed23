use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, num::NonZeroU64, time::Duration};
use url::Url;

/// Delays between retries of a failed request, in milliseconds. The last entry repeats.
pub const DEFAULT_RETRY_SCHEDULE_MS: [u64; 6] = [10, 100, 500, 2_000, 10_000, 20_000];

#[derive(Default, Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// URL of the portal dataset, e.g. `https://portal.sqd.dev/datasets/ethereum-mainnet`.
    pub url: Option<Url>,
    /// Timeout for receiving response headers.
    pub http_req_timeout_millis: Option<NonZeroU64>,
    /// Maximum time to wait for the next chunk of a response body.
    pub body_timeout_millis: Option<NonZeroU64>,
    /// Number of retries to attempt before returning error.
    pub retry_attempts: Option<usize>,
    /// Backoff delays between retries.
    pub retry_schedule_ms: Option<Vec<u64>>,
    /// Extra headers sent with every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Buffering and polling settings of a single stream.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Minimum number of bytes to return. Defaults to 10MB.
    pub min_bytes: Option<u64>,
    /// Number of buffered bytes at which the network reader pauses. Defaults to `min_bytes`.
    pub max_bytes: Option<u64>,
    /// Maximum time between stream data before returning what is buffered. Defaults to 300ms.
    pub max_idle_time_millis: Option<u64>,
    /// Maximum time to wait before returning what is buffered. Defaults to 5s.
    pub max_wait_time_millis: Option<u64>,
    /// Interval for polling the head once the portal has no new blocks. Defaults to 0.
    pub head_poll_interval_millis: Option<u64>,
    /// Finish the stream instead of polling once the head is reached.
    #[serde(default)]
    pub stop_on_head: bool,
}

/// [`StreamConfig`] with defaults applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    pub min_bytes: u64,
    pub max_bytes: u64,
    pub max_idle_time: Duration,
    pub max_wait_time: Duration,
    pub head_poll_interval: Duration,
    pub stop_on_head: bool,
}

impl StreamConfig {
    pub fn settings(&self) -> StreamSettings {
        let min_bytes = self.min_bytes.unwrap_or(10 * 1024 * 1024);

        StreamSettings {
            min_bytes,
            max_bytes: self.max_bytes.unwrap_or(min_bytes).max(min_bytes),
            max_idle_time: Duration::from_millis(self.max_idle_time_millis.unwrap_or(300)),
            max_wait_time: Duration::from_millis(self.max_wait_time_millis.unwrap_or(5_000)),
            head_poll_interval: Duration::from_millis(self.head_poll_interval_millis.unwrap_or(0)),
            stop_on_head: self.stop_on_head,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_bytes_never_below_min_bytes() {
        let settings = StreamConfig {
            min_bytes: Some(1000),
            max_bytes: Some(10),
            ..Default::default()
        }
        .settings();

        assert_eq!(settings.min_bytes, 1000);
        assert_eq!(settings.max_bytes, 1000);
    }

    #[test]
    fn defaults() {
        let settings = StreamConfig::default().settings();

        assert_eq!(settings.min_bytes, 10 * 1024 * 1024);
        assert_eq!(settings.max_bytes, settings.min_bytes);
        assert_eq!(settings.max_idle_time, Duration::from_millis(300));
        assert_eq!(settings.max_wait_time, Duration::from_secs(5));
        assert_eq!(settings.head_poll_interval, Duration::ZERO);
        assert!(!settings.stop_on_head);
    }

    #[test]
    fn client_config_from_json() {
        let cfg: ClientConfig = serde_json::from_str(
            r#"{"url":"http://localhost:8000/datasets/solana","retry_attempts":3,"retry_schedule_ms":[0]}"#,
        )
        .unwrap();

        assert_eq!(cfg.retry_attempts, Some(3));
        assert_eq!(cfg.retry_schedule_ms, Some(vec![0]));
        assert!(cfg.headers.is_empty());
    }
}
