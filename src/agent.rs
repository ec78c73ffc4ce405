use std::{fmt, sync::Arc};

/// Which route an [`Agent`] sends requests through.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AgentKind {
    /// System DNS, no proxy.
    Direct,
    /// Tunnels through an HTTP(S) proxy. `proxy` never contains credentials.
    Proxy { proxy: String, target_host: String },
    /// Resolves hostnames with explicit DNS lookups against the context's
    /// configured servers.
    DnsFailover,
    /// Supplied by the caller.
    Custom,
}

/// A configured connection client.
///
/// Cloning is cheap and clones share identity; use [`Agent::same`] to check
/// whether two handles refer to the same cached agent.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    kind: AgentKind,
    client: reqwest::Client,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("kind", &self.inner.kind)
            .finish_non_exhaustive()
    }
}

impl Agent {
    pub(crate) fn new(kind: AgentKind, client: reqwest::Client) -> Self {
        Self {
            inner: Arc::new(AgentInner { kind, client }),
        }
    }

    /// Wraps a caller-built client so it can be passed as an explicit agent.
    pub fn custom(client: reqwest::Client) -> Self {
        Self::new(AgentKind::Custom, client)
    }

    pub fn kind(&self) -> &AgentKind {
        &self.inner.kind
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.inner.client
    }

    pub fn is_dns_failover(&self) -> bool {
        self.inner.kind == AgentKind::DnsFailover
    }

    /// Whether both handles point at the same agent instance.
    pub fn same(a: &Agent, b: &Agent) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}
