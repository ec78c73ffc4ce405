//! Snapshot of the environment variables this crate consumes.

/// Network-related settings read from the process environment.
///
/// A [`crate::NetworkContext`] re-reads the environment on every call unless
/// it was built with a fixed snapshot, so changes made at runtime are
/// picked up by the next request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkEnv {
    /// `HTTPS_PROXY` / `https_proxy`.
    pub https_proxy: Option<String>,
    /// `HTTP_PROXY` / `http_proxy`.
    pub http_proxy: Option<String>,
    /// `NO_PROXY` / `no_proxy`.
    pub no_proxy: Option<String>,
    /// `CHROMATIC_DNS_SERVERS`, comma-separated.
    pub dns_servers: Vec<String>,
    /// `CHROMATIC_DNS_FAILOVER_SERVERS`, comma-separated.
    pub dns_failover_servers: Vec<String>,
    /// `CHROMATIC_RETRIES`.
    pub retries: Option<u32>,
    /// `CHROMATIC_TIMEOUT`, in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl NetworkEnv {
    /// Reads the current process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a snapshot from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |upper: &str, lower: &str| {
            lookup(upper)
                .or_else(|| lookup(lower))
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };

        Self {
            https_proxy: var("HTTPS_PROXY", "https_proxy"),
            http_proxy: var("HTTP_PROXY", "http_proxy"),
            no_proxy: var("NO_PROXY", "no_proxy"),
            dns_servers: split_list(lookup("CHROMATIC_DNS_SERVERS")),
            dns_failover_servers: split_list(lookup("CHROMATIC_DNS_FAILOVER_SERVERS")),
            retries: parse_number("CHROMATIC_RETRIES", lookup("CHROMATIC_RETRIES")),
            timeout_ms: parse_number("CHROMATIC_TIMEOUT", lookup("CHROMATIC_TIMEOUT")),
        }
    }

    /// Proxy URL for a target scheme, falling back to the other variable.
    pub fn proxy_for_scheme(&self, scheme: &str) -> Option<&str> {
        let (preferred, fallback) = if scheme.eq_ignore_ascii_case("https") {
            (&self.https_proxy, &self.http_proxy)
        } else {
            (&self.http_proxy, &self.https_proxy)
        };
        preferred.as_deref().or(fallback.as_deref())
    }
}

fn split_list(raw: Option<String>) -> Vec<String> {
    raw.map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_owned)
            .collect()
    })
    .unwrap_or_default()
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
    let raw = raw?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(%key, value = %raw, "ignoring non-numeric environment value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::NetworkEnv;

    fn env_of(pairs: &[(&str, &str)]) -> NetworkEnv {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect();
        NetworkEnv::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn reads_upper_and_lower_case_proxy_vars() {
        let env = env_of(&[
            ("https_proxy", "http://proxy.local:3128"),
            ("NO_PROXY", "localhost,.internal"),
        ]);
        assert_eq!(env.https_proxy.as_deref(), Some("http://proxy.local:3128"));
        assert_eq!(env.http_proxy, None);
        assert_eq!(env.no_proxy.as_deref(), Some("localhost,.internal"));
    }

    #[test]
    fn splits_dns_server_lists() {
        let env = env_of(&[
            ("CHROMATIC_DNS_SERVERS", "1.1.1.1, 8.8.8.8:53,,"),
            ("CHROMATIC_DNS_FAILOVER_SERVERS", "9.9.9.9"),
        ]);
        assert_eq!(env.dns_servers, vec!["1.1.1.1", "8.8.8.8:53"]);
        assert_eq!(env.dns_failover_servers, vec!["9.9.9.9"]);
    }

    #[test]
    fn ignores_invalid_numbers() {
        let env = env_of(&[("CHROMATIC_RETRIES", "many"), ("CHROMATIC_TIMEOUT", "250")]);
        assert_eq!(env.retries, None);
        assert_eq!(env.timeout_ms, Some(250));
    }

    #[test]
    fn proxy_for_scheme_prefers_matching_variable() {
        let env = env_of(&[
            ("HTTPS_PROXY", "http://secure:1"),
            ("HTTP_PROXY", "http://plain:2"),
        ]);
        assert_eq!(env.proxy_for_scheme("https"), Some("http://secure:1"));
        assert_eq!(env.proxy_for_scheme("http"), Some("http://plain:2"));

        let only_http = env_of(&[("HTTP_PROXY", "http://plain:2")]);
        assert_eq!(only_http.proxy_for_scheme("https"), Some("http://plain:2"));
    }
}
