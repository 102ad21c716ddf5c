use std::env;
use std::str::FromStr;
use std::time::Duration;

/// What the loop does when a single action fails to execute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionFailurePolicy {
    /// End the whole session in the error state.
    Abort,
    /// Record the failed action and continue with the rest of the batch.
    Skip,
}

impl FromStr for ActionFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "skip" => Ok(Self::Skip),
            other => Err(format!("unknown action failure policy: {other}")),
        }
    }
}

/// Bounded retry for model calls whose answer could not be used.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Attempts actually made. A policy of zero still makes one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before `attempt` (1-based). The first attempt never waits.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Process configuration. Built once at startup and handed to every component.
#[derive(Clone, Debug)]
pub struct OperateConfig {
    pub ollama_host: String,   // e.g. "http://localhost:11434"
    pub default_model: String, // e.g. "llava"
    pub max_loops: u32,
    pub retry: RetryPolicy,
    pub action_delay: Duration,
    pub call_delay: Duration,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub use_labeling: bool,
    pub verbose: bool,
    pub on_action_failure: ActionFailurePolicy,
    pub event_capacity: usize,
}

impl Default for OperateConfig {
    fn default() -> Self {
        Self {
            ollama_host: "http://localhost:11434".into(),
            default_model: "llava".into(),
            max_loops: 10,
            retry: RetryPolicy::default(),
            action_delay: Duration::from_secs(1),
            call_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            use_labeling: false,
            verbose: false,
            on_action_failure: ActionFailurePolicy::Abort,
            event_capacity: 256,
        }
    }
}

impl OperateConfig {
    /// Defaults overlaid with whatever `OLLAMA_HOST` / `OPERATE_*` variables are set.
    pub fn from_env() -> Self {
        let base = Self::default();
        let retry = RetryPolicy {
            max_attempts: env_or("OPERATE_MAX_ATTEMPTS", base.retry.max_attempts).max(1),
            base_backoff: Duration::from_millis(env_or(
                "OPERATE_BACKOFF_MS",
                base.retry.base_backoff.as_millis() as u64,
            )),
            max_backoff: base.retry.max_backoff,
        };
        Self {
            ollama_host: env::var("OLLAMA_HOST")
                .ok()
                .map(|h| normalize_host(&h))
                .filter(|h| !h.is_empty())
                .unwrap_or(base.ollama_host),
            default_model: env::var("OPERATE_MODEL")
                .ok()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or(base.default_model),
            max_loops: env_or("OPERATE_MAX_LOOPS", base.max_loops),
            retry,
            action_delay: Duration::from_millis(env_or(
                "OPERATE_ACTION_DELAY_MS",
                base.action_delay.as_millis() as u64,
            )),
            call_delay: Duration::from_millis(env_or(
                "OPERATE_CALL_DELAY_MS",
                base.call_delay.as_millis() as u64,
            )),
            request_timeout: Duration::from_secs(env_or(
                "OPERATE_REQUEST_TIMEOUT_SECS",
                base.request_timeout.as_secs(),
            )),
            connect_timeout: Duration::from_secs(env_or(
                "OPERATE_CONNECT_TIMEOUT_SECS",
                base.connect_timeout.as_secs(),
            )),
            use_labeling: env_or("OPERATE_LABELING", base.use_labeling),
            verbose: env_or("OPERATE_VERBOSE", base.verbose),
            on_action_failure: env_or("OPERATE_ON_ACTION_FAILURE", base.on_action_failure),
            event_capacity: env_or("OPERATE_EVENT_CAPACITY", base.event_capacity).max(1),
        }
    }

    /// Zero delays; handy for tests and dry runs.
    pub fn without_delays(mut self) -> Self {
        self.action_delay = Duration::ZERO;
        self.call_delay = Duration::ZERO;
        self.retry.base_backoff = Duration::ZERO;
        self
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparsable configuration value");
                default
            }
        },
        Err(_) => default,
    }
}

pub(crate) fn normalize_host(host: &str) -> String {
    let trimmed = host.trim().trim_end_matches('/');
    if trimmed.is_empty() || trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}
