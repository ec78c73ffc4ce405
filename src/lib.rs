//! `chromatic-http` is the outbound networking layer of a build-publishing CLI.
//!
//! It covers three concerns:
//! - [`HttpClient::fetch`]: HTTP with retries, proxy routing and DNS failover
//! - [`GraphQlClient::run_query`]: GraphQL operations over that transport
//! - [`ArtifactUploader::upload`]: concurrent signed-URL uploads of a build
//!
//! All shared state (proxy agent cache, DNS servers, failover agent) lives
//! in a [`NetworkContext`] that callers create once and pass around.

mod agent;
mod client;
mod context;
mod env;
mod error;
mod options;
mod transport;
mod types;
mod wire;

pub mod dns;
pub mod progress;
pub mod proxy;
pub mod retry;
pub mod upload;

pub use agent::{Agent, AgentKind};
pub use client::{GraphQlClient, QueryOptions, DEFAULT_QUERY_RETRIES};
pub use context::{DnsEscalation, NetworkContext};
pub use env::NetworkEnv;
pub use error::{ChromaticError, HttpClientError};
pub use options::{AgentOptions, ClientOptions};
#[cfg(feature = "progress-bar")]
pub use progress::ProgressBarReporter;
pub use progress::{NoopReporter, ProgressReporter, ProgressTracker};
pub use retry::{Backoff, Outcome, RetryPolicy};
pub use transport::{FetchOptions, FetchRequest, HttpClient};
pub use types::{Extensions, GraphQlError, Location, RETRYABLE_ERROR_CODE};
pub use upload::{ArtifactUploader, UploadOptions, UploadSummary, UploadTarget};

pub type Result<T> = std::result::Result<T, ChromaticError>;
