//! Proxy routing driven by `HTTPS_PROXY` / `HTTP_PROXY` / `NO_PROXY`.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use tracing::debug;
use url::Url;

use crate::{
    agent::{Agent, AgentKind},
    AgentOptions, ChromaticError, NetworkEnv, Result,
};

/// Proxy settings that apply to one target URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyConfig {
    pub proxy: Url,
    pub no_proxy: NoProxy,
}

impl ProxyConfig {
    /// Picks the proxy for the target's scheme. Returns `None` when no proxy
    /// variable is set.
    pub fn from_env(env: &NetworkEnv, target: &Url) -> Result<Option<Self>> {
        let Some(raw) = env.proxy_for_scheme(target.scheme()) else {
            return Ok(None);
        };
        Ok(Some(Self {
            proxy: parse_proxy_url(raw)?,
            no_proxy: NoProxy::parse(env.no_proxy.as_deref().unwrap_or_default()),
        }))
    }

    /// Whether requests to `target` go through the proxy.
    pub fn applies_to(&self, target: &Url) -> bool {
        !self.no_proxy.matches(target)
    }

    /// `scheme://host:port` without credentials, for logs.
    pub fn redacted(&self) -> String {
        format!(
            "{}://{}:{}",
            self.proxy.scheme(),
            self.proxy.host_str().unwrap_or_default(),
            self.proxy.port_or_known_default().unwrap_or_default()
        )
    }
}

fn parse_proxy_url(raw: &str) -> Result<Url> {
    let candidate = if raw.contains("://") {
        raw.to_owned()
    } else {
        format!("http://{raw}")
    };
    let url = Url::parse(&candidate)
        .map_err(|err| ChromaticError::Config(format!("invalid proxy URL: {err}")))?;
    if url.host_str().is_none() {
        return Err(ChromaticError::Config("proxy URL has no host".to_owned()));
    }
    Ok(url)
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Rule {
    Any,
    Exact { host: String, port: Option<u16> },
    Suffix { suffix: String, port: Option<u16> },
}

/// Parsed `NO_PROXY` rules.
///
/// Entries are separated by commas or whitespace. `*` exempts everything,
/// `.example.com` and `*.example.com` match subdomains by suffix, and any
/// other entry matches the hostname exactly. An entry may end in `:port`,
/// in which case it only matches that port.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NoProxy {
    rules: Vec<Rule>,
}

impl NoProxy {
    pub fn parse(raw: &str) -> Self {
        let rules = raw
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(parse_rule)
            .collect();
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn matches(&self, target: &Url) -> bool {
        let Some(host) = target.host_str() else {
            return false;
        };
        let host = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_ascii_lowercase();
        let port = target.port_or_known_default();

        self.rules.iter().any(|rule| match rule {
            Rule::Any => true,
            Rule::Exact {
                host: expected,
                port: rule_port,
            } => port_matches(*rule_port, port) && host == *expected,
            Rule::Suffix {
                suffix,
                port: rule_port,
            } => port_matches(*rule_port, port) && host.ends_with(suffix.as_str()),
        })
    }
}

fn port_matches(rule: Option<u16>, actual: Option<u16>) -> bool {
    rule.map_or(true, |expected| actual == Some(expected))
}

fn parse_rule(entry: &str) -> Rule {
    if entry == "*" {
        return Rule::Any;
    }

    let (host, port) = split_port(entry);
    let host = host.to_ascii_lowercase();
    if let Some(rest) = host.strip_prefix('*') {
        Rule::Suffix {
            suffix: rest.to_owned(),
            port,
        }
    } else if host.starts_with('.') {
        Rule::Suffix { suffix: host, port }
    } else {
        Rule::Exact { host, port }
    }
}

fn split_port(entry: &str) -> (&str, Option<u16>) {
    if let Some(rest) = entry.strip_prefix('[') {
        // [ipv6]:port
        return match rest.split_once(']') {
            Some((host, tail)) => (host, tail.strip_prefix(':').and_then(|p| p.parse().ok())),
            None => (entry, None),
        };
    }
    match entry.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (entry, None),
        },
        _ => (entry, None),
    }
}

/// Hands out proxy agents, one per target host.
///
/// Agents are cached for the lifetime of the resolver and never evicted,
/// so one resolver should back one long-lived client.
#[derive(Debug, Default)]
pub struct ProxyAgentResolver {
    agents: Mutex<HashMap<String, Agent>>,
}

impl ProxyAgentResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the proxy agent for `target`, or `None` for a direct
    /// connection (no proxy configured, or the host is exempted).
    pub fn resolve(
        &self,
        env: &NetworkEnv,
        target: &Url,
        options: &AgentOptions,
    ) -> Result<Option<Agent>> {
        let Some(config) = ProxyConfig::from_env(env, target)? else {
            return Ok(None);
        };
        if !config.applies_to(target) {
            debug!(url = %target, "target exempted from proxy by NO_PROXY");
            return Ok(None);
        }

        let key = host_key(target)?;
        let mut agents = self.agents.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(agent) = agents.get(&key) {
            return Ok(Some(agent.clone()));
        }

        let proxy = config.redacted();
        debug!(target_host = %key, %proxy, "creating proxy agent");
        // reqwest reads basic-auth credentials from the proxy URL's userinfo.
        let route = reqwest::Proxy::all(config.proxy.as_str())
            .map_err(|err| ChromaticError::Config(format!("invalid proxy {proxy}: {err}")))?;
        let client = options
            .client_builder()
            .proxy(route)
            .build()
            .map_err(|err| ChromaticError::Config(format!("failed to build proxy agent: {err}")))?;

        let agent = Agent::new(
            AgentKind::Proxy {
                proxy,
                target_host: key.clone(),
            },
            client,
        );
        agents.insert(key, agent.clone());
        Ok(Some(agent))
    }

    /// Number of cached agents.
    pub fn len(&self) -> usize {
        self.agents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn host_key(target: &Url) -> Result<String> {
    let host = target
        .host_str()
        .ok_or_else(|| ChromaticError::Config(format!("URL has no host: {target}")))?;
    Ok(match target.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    })
}
