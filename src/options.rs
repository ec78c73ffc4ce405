use std::time::Duration;

use crate::{retry::Backoff, NetworkEnv};

/// Configures HTTP timeout and retry behavior.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientOptions {
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Base retry backoff in milliseconds (exponential strategy).
    pub retry_backoff_ms: u64,
    /// Upper bound for a single backoff delay in milliseconds.
    pub max_backoff_ms: u64,
    /// Randomize each delay by a factor in `[0.5, 1.5)`.
    pub jitter: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_retries: 0,
            retry_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            jitter: true,
        }
    }
}

impl ClientOptions {
    /// Applies `CHROMATIC_RETRIES` and `CHROMATIC_TIMEOUT` on top of the defaults.
    pub fn from_env(env: &NetworkEnv) -> Self {
        let mut options = Self::default();
        if let Some(retries) = env.retries {
            options.max_retries = retries;
        }
        if let Some(timeout_ms) = env.timeout_ms {
            options.timeout_ms = timeout_ms;
        }
        options
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new()
            .with_base_delay(Duration::from_millis(self.retry_backoff_ms))
            .with_max_delay(Duration::from_millis(self.max_backoff_ms))
            .with_jitter(self.jitter)
    }
}

/// Connection settings applied to every agent a context builds.
///
/// Per-call overrides are merged on top with [`AgentOptions::merge`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AgentOptions {
    pub connect_timeout: Option<Duration>,
    pub user_agent: Option<String>,
}

impl AgentOptions {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Returns `self` with every field set in `overrides` replaced.
    pub fn merge(&self, overrides: &AgentOptions) -> AgentOptions {
        AgentOptions {
            connect_timeout: overrides.connect_timeout.or(self.connect_timeout),
            user_agent: overrides
                .user_agent
                .clone()
                .or_else(|| self.user_agent.clone()),
        }
    }

    pub(crate) fn client_builder(&self) -> reqwest::ClientBuilder {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = self.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.as_str());
        }
        builder
    }
}
