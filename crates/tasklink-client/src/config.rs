//! Client configuration.

use std::time::Duration;

use rand::Rng;

/// Reconnection backoff for the status channel.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for any single delay.
    pub max_delay: Duration,

    /// Growth factor between attempts.
    pub multiplier: f64,

    /// Spread each delay by ±20% so clients do not reconnect in lockstep.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Fixed short delays, for tests and local development.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_millis() as f64);

        let delay = if self.jitter {
            capped * rand::thread_rng().gen_range(0.8..=1.2)
        } else {
            capped
        };

        Duration::from_millis(delay as u64)
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the Registry command endpoints.
    pub base_url: String,

    /// WebSocket URL of the status channel.
    pub channel_url: String,

    /// Upper bound on each command call.
    pub request_timeout: Duration,

    /// Status channel reconnect backoff.
    pub reconnect: ReconnectPolicy,

    /// Depth of the store's mutation queue.
    pub store_queue_capacity: usize,

    /// Buffered terminal notices per subscriber.
    pub notice_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:7860/api/tasks".to_string(),
            channel_url: "ws://127.0.0.1:7860/api/tasks/events".to_string(),
            request_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            store_queue_capacity: 256,
            notice_capacity: 64,
        }
    }
}

impl ClientConfig {
    /// Config for a Registry served from `base_url`, with the status channel
    /// at `<base_url>/events` over `ws`/`wss`.
    pub fn for_base_url(base_url: &str) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        let channel_url = if let Some(rest) = base_url.strip_prefix("https://") {
            format!("wss://{rest}/events")
        } else if let Some(rest) = base_url.strip_prefix("http://") {
            format!("ws://{rest}/events")
        } else {
            format!("{base_url}/events")
        };
        Self {
            base_url,
            channel_url,
            ..Default::default()
        }
    }

    /// Builder method to set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Builder method to set the reconnect policy.
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}
