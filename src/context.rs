//! Network state shared by every client built from one context.
//!
//! The proxy-agent cache, the active DNS servers and the DNS-failover agent
//! are process-wide concerns. They live here, in an object the caller owns
//! and hands to each client, so tests can build an isolated context and a
//! DNS server switch is visible as an explicit, context-global effect.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};
use url::Url;

use crate::{
    agent::{Agent, AgentKind},
    dns::{DnsConfig, DnsFailoverResolver},
    proxy::ProxyAgentResolver,
    AgentOptions, ChromaticError, NetworkEnv, Result,
};

#[derive(Clone, Debug)]
enum EnvSource {
    /// Re-read the process environment on every call.
    Process,
    Fixed(NetworkEnv),
}

/// What [`NetworkContext::escalate_dns_failure`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DnsEscalation {
    /// The call switched from its previous route to the DNS-failover agent.
    SwitchedToFailoverAgent,
    /// The context's active DNS servers were replaced by the failover list.
    SwitchedServers,
    /// Nothing left to try.
    Exhausted,
}

/// Caller-owned network state. Cloning shares the state.
#[derive(Clone, Debug)]
pub struct NetworkContext {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    env: EnvSource,
    agent_options: AgentOptions,
    proxies: ProxyAgentResolver,
    dns: Arc<DnsConfig>,
    direct: Mutex<Option<Agent>>,
    dns_failover: Mutex<Option<Agent>>,
}

impl Default for NetworkContext {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkContext {
    /// A context that reads the process environment on every call.
    pub fn new() -> Self {
        Self::build(EnvSource::Process, AgentOptions::default())
    }

    /// A context pinned to a fixed environment snapshot.
    pub fn with_env(env: NetworkEnv) -> Self {
        Self::build(EnvSource::Fixed(env), AgentOptions::default())
    }

    /// Replaces the connection settings used for agents built from now on.
    ///
    /// Returns a fresh context: caches are not carried over.
    pub fn with_agent_options(self, agent_options: AgentOptions) -> Self {
        Self::build(self.inner.env.clone(), agent_options)
    }

    fn build(env: EnvSource, agent_options: AgentOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                env,
                agent_options,
                proxies: ProxyAgentResolver::new(),
                dns: Arc::new(DnsConfig::new()),
                direct: Mutex::new(None),
                dns_failover: Mutex::new(None),
            }),
        }
    }

    /// Current environment snapshot.
    pub fn env(&self) -> NetworkEnv {
        match &self.inner.env {
            EnvSource::Process => NetworkEnv::from_env(),
            EnvSource::Fixed(env) => env.clone(),
        }
    }

    pub fn agent_options(&self) -> &AgentOptions {
        &self.inner.agent_options
    }

    pub fn proxies(&self) -> &ProxyAgentResolver {
        &self.inner.proxies
    }

    /// The active DNS configuration shared by every client of this context.
    pub fn dns(&self) -> &DnsConfig {
        &self.inner.dns
    }

    /// Proxy agent for `target`, if the environment routes it through one.
    pub fn proxy_agent(&self, target: &Url, overrides: &AgentOptions) -> Result<Option<Agent>> {
        let options = self.inner.agent_options.merge(overrides);
        self.inner.proxies.resolve(&self.env(), target, &options)
    }

    /// Plain client using system DNS and no proxy.
    pub fn direct_agent(&self) -> Result<Agent> {
        cached(&self.inner.direct, || {
            let client = self
                .inner
                .agent_options
                .client_builder()
                .no_proxy()
                .build()
                .map_err(|err| {
                    ChromaticError::Config(format!("failed to build HTTP client: {err}"))
                })?;
            Ok(Agent::new(AgentKind::Direct, client))
        })
    }

    /// Client that resolves hostnames through the context's DNS servers.
    pub fn dns_failover_agent(&self) -> Result<Agent> {
        cached(&self.inner.dns_failover, || {
            let resolver = Arc::new(DnsFailoverResolver::new(Arc::clone(&self.inner.dns)));
            let client = self
                .inner
                .agent_options
                .client_builder()
                .no_proxy()
                .dns_resolver(resolver)
                .build()
                .map_err(|err| {
                    ChromaticError::Config(format!("failed to build DNS failover client: {err}"))
                })?;
            Ok(Agent::new(AgentKind::DnsFailover, client))
        })
    }

    /// Picks the route for a request: the explicit agent, else a proxy
    /// agent, else the DNS-failover agent when custom DNS servers are
    /// configured. `None` means the direct client.
    pub fn select_agent(
        &self,
        env: &NetworkEnv,
        target: &Url,
        explicit: Option<&Agent>,
        overrides: &AgentOptions,
    ) -> Result<Option<Agent>> {
        if let Some(agent) = explicit {
            return Ok(Some(agent.clone()));
        }

        let options = self.inner.agent_options.merge(overrides);
        let mut agent = self.inner.proxies.resolve(env, target, &options)?;

        if !env.dns_servers.is_empty() {
            debug!(servers = ?env.dns_servers, "using custom DNS servers");
            self.inner.dns.apply_primary(&env.dns_servers)?;
            agent = Some(self.dns_failover_agent()?);
        }
        Ok(agent)
    }

    /// Reacts to an unresolved-hostname failure of one call.
    ///
    /// The first escalation moves the call onto the DNS-failover agent. If
    /// the call already uses it (or another agent), the context's DNS
    /// servers are switched to `CHROMATIC_DNS_FAILOVER_SERVERS`. The server
    /// switch applies to every request sharing this context.
    pub fn escalate_dns_failure(
        &self,
        env: &NetworkEnv,
        active: &mut Option<Agent>,
    ) -> Result<DnsEscalation> {
        if active.is_none() {
            warn!("request failed due to DNS lookup; switching to custom DNS resolver");
            *active = Some(self.dns_failover_agent()?);
            return Ok(DnsEscalation::SwitchedToFailoverAgent);
        }
        if !env.dns_failover_servers.is_empty() {
            warn!(
                servers = ?env.dns_failover_servers,
                "request failed due to DNS lookup; switching to failover DNS servers"
            );
            self.inner.dns.fail_over(&env.dns_failover_servers)?;
            return Ok(DnsEscalation::SwitchedServers);
        }
        Ok(DnsEscalation::Exhausted)
    }
}

fn cached(slot: &Mutex<Option<Agent>>, build: impl FnOnce() -> Result<Agent>) -> Result<Agent> {
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(agent) = slot.as_ref() {
        return Ok(agent.clone());
    }
    let agent = build()?;
    *slot = Some(agent.clone());
    Ok(agent)
}
