//! Explicit DNS resolution for the failover connection path.
//!
//! The system resolver is the default path for every fresh context. Once a
//! request fails with an unresolved hostname, the transport switches to an
//! agent whose lookups go through [`DnsFailoverResolver`], which queries the
//! servers held in the context's [`DnsConfig`] and only ever returns one
//! IPv4 address.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex, PoisonError},
};

use hickory_resolver::{
    config::{NameServerConfig, NameServerConfigGroup, Protocol, ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tracing::{debug, info};

use crate::{ChromaticError, Result};

const DEFAULT_DNS_PORT: u16 = 53;

/// Failure of an explicit DNS lookup.
///
/// Kept as a distinct type so the transport can recognize DNS failures
/// structurally in the error chain.
#[derive(Debug, thiserror::Error)]
#[error("DNS lookup for {host} failed: {source}")]
pub struct DnsLookupError {
    pub host: String,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

#[derive(Debug, thiserror::Error)]
#[error("no IPv4 address found")]
struct NoAddress;

/// The active DNS server list of a [`crate::NetworkContext`].
///
/// An empty list means "use the system resolver configuration".
#[derive(Default)]
pub struct DnsConfig {
    state: Mutex<DnsState>,
}

#[derive(Default)]
struct DnsState {
    servers: Vec<SocketAddr>,
    resolver: Option<Arc<TokioAsyncResolver>>,
    /// Set once the failover list replaced the primary one.
    failed_over: bool,
}

impl std::fmt::Debug for DnsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsConfig")
            .field("servers", &self.servers())
            .finish()
    }
}

impl DnsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently active servers.
    pub fn servers(&self) -> Vec<SocketAddr> {
        self.lock().servers.clone()
    }

    /// Replaces the active server list. Returns `false` when the list was
    /// already active, in which case nothing changes.
    ///
    /// This affects every request sharing the context, including ones
    /// already in flight on the DNS-failover agent.
    pub fn set_servers(&self, servers: &[SocketAddr]) -> bool {
        replace_servers(&mut self.lock(), servers)
    }

    /// Parses and applies a server list taken from the environment.
    pub fn set_servers_from(&self, entries: &[String]) -> Result<bool> {
        let servers = parse_servers(entries)?;
        Ok(self.set_servers(&servers))
    }

    /// Applies the primary server list unless a failover list has already
    /// replaced it.
    pub fn apply_primary(&self, entries: &[String]) -> Result<bool> {
        let servers = parse_servers(entries)?;
        let mut state = self.lock();
        if state.failed_over {
            return Ok(false);
        }
        Ok(replace_servers(&mut state, &servers))
    }

    /// Switches to the failover server list. The switch is permanent for
    /// this config: later [`DnsConfig::apply_primary`] calls are ignored.
    pub fn fail_over(&self, entries: &[String]) -> Result<bool> {
        let servers = parse_servers(entries)?;
        let mut state = self.lock();
        state.failed_over = true;
        Ok(replace_servers(&mut state, &servers))
    }

    /// Whether [`DnsConfig::fail_over`] has been applied.
    pub fn is_failed_over(&self) -> bool {
        self.lock().failed_over
    }

    /// Resolver for the active servers, built on first use after a change.
    pub(crate) fn resolver(&self) -> Arc<TokioAsyncResolver> {
        let mut state = self.lock();
        if let Some(resolver) = &state.resolver {
            return Arc::clone(resolver);
        }
        let resolver = Arc::new(build_resolver(&state.servers));
        state.resolver = Some(Arc::clone(&resolver));
        resolver
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DnsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn replace_servers(state: &mut DnsState, servers: &[SocketAddr]) -> bool {
    if state.servers == servers {
        return false;
    }
    info!(servers = ?servers, "switching DNS servers");
    state.servers = servers.to_vec();
    state.resolver = None;
    true
}

fn build_resolver(servers: &[SocketAddr]) -> TokioAsyncResolver {
    if servers.is_empty() {
        return TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|err| {
            debug!(error = %err, "system resolver configuration unavailable; using defaults");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
    }

    let name_servers: Vec<NameServerConfig> = servers
        .iter()
        .flat_map(|address| {
            [
                NameServerConfig::new(*address, Protocol::Udp),
                NameServerConfig::new(*address, Protocol::Tcp),
            ]
        })
        .collect();
    let config = ResolverConfig::from_parts(
        None,
        Vec::new(),
        NameServerConfigGroup::from(name_servers),
    );
    TokioAsyncResolver::tokio(config, ResolverOpts::default())
}

/// Parses `ip` or `ip:port` entries; port 53 is the default.
pub fn parse_servers(entries: &[String]) -> Result<Vec<SocketAddr>> {
    entries
        .iter()
        .map(|entry| {
            let entry = entry.trim();
            entry
                .parse::<SocketAddr>()
                .or_else(|_| {
                    entry
                        .parse::<IpAddr>()
                        .map(|ip| SocketAddr::new(ip, DEFAULT_DNS_PORT))
                })
                .map_err(|_| ChromaticError::Config(format!("invalid DNS server '{entry}'")))
        })
        .collect()
}

/// `reqwest` resolver hook backed by the context's [`DnsConfig`].
pub struct DnsFailoverResolver {
    dns: Arc<DnsConfig>,
}

impl DnsFailoverResolver {
    pub fn new(dns: Arc<DnsConfig>) -> Self {
        Self { dns }
    }
}

impl Resolve for DnsFailoverResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let resolver = self.dns.resolver();
        Box::pin(async move {
            let address = lookup_ipv4(&resolver, name.as_str()).await?;
            let addrs: Addrs = Box::new(std::iter::once(SocketAddr::new(IpAddr::V4(address), 0)));
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(addrs)
        })
    }
}

/// Resolves `host` to its first IPv4 address.
pub async fn lookup_ipv4(
    resolver: &TokioAsyncResolver,
    host: &str,
) -> std::result::Result<Ipv4Addr, DnsLookupError> {
    let lookup = resolver
        .ipv4_lookup(host)
        .await
        .map_err(|source| DnsLookupError {
            host: host.to_owned(),
            source: Box::new(source),
        })?;
    let address = lookup
        .iter()
        .next()
        .map(|record| record.0)
        .ok_or_else(|| DnsLookupError {
            host: host.to_owned(),
            source: Box::new(NoAddress),
        })?;
    debug!(%host, %address, "resolved host with explicit DNS lookup");
    Ok(address)
}
