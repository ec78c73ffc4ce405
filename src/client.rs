use std::fmt;

use bytes::Bytes;
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{
    retry::{self, Backoff, Outcome, RetryPolicy},
    transport::{FetchOptions, FetchRequest},
    wire::{GraphQlRequest, GraphQlResponse},
    ChromaticError, GraphQlError, HttpClient, NetworkContext, Result,
};

/// Operation-level retries used when a query does not set its own.
pub const DEFAULT_QUERY_RETRIES: u32 = 2;

/// Per-query overrides for [`GraphQlClient::run_query`].
#[derive(Clone, Debug)]
pub struct QueryOptions {
    /// Send to this endpoint instead of the client's.
    pub endpoint: Option<String>,
    /// Merged over the client's default headers.
    pub headers: HeaderMap,
    /// Operation-level retries; also forwarded to the HTTP layer.
    pub retries: u32,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            endpoint: None,
            headers: HeaderMap::new(),
            retries: DEFAULT_QUERY_RETRIES,
        }
    }
}

impl QueryOptions {
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn header(mut self, name: header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// GraphQL client for the index API.
#[derive(Clone)]
pub struct GraphQlClient {
    http: HttpClient,
    endpoint: String,
    headers: HeaderMap,
    backoff: Backoff,
}

impl fmt::Debug for GraphQlClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let authorization = self
            .headers
            .contains_key(header::AUTHORIZATION)
            .then_some("<redacted>");
        f.debug_struct("GraphQlClient")
            .field("endpoint", &self.endpoint)
            .field("authorization", &authorization)
            .field("http", &self.http)
            .finish()
    }
}

impl GraphQlClient {
    /// Creates a client for `endpoint` on top of an existing HTTP client.
    pub fn new(endpoint: impl Into<String>, http: HttpClient) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let backoff = http.options().backoff();
        Self {
            http,
            endpoint: endpoint.into(),
            headers,
            backoff,
        }
    }

    /// Creates a client whose HTTP options come from the context's environment.
    pub fn from_context(endpoint: impl Into<String>, context: NetworkContext) -> Self {
        Self::new(endpoint, HttpClient::from_context(context))
    }

    /// Sends `Authorization: Bearer <token>` with every query.
    ///
    /// If the token already carries the `Bearer ` prefix it is kept as is.
    pub fn set_authorization(&mut self, token: impl AsRef<str>) -> Result<()> {
        let value = HeaderValue::from_str(&normalize_bearer_authorization(token.as_ref()))
            .map_err(|err| ChromaticError::Config(format!("invalid authorization token: {err}")))?;
        self.headers.insert(header::AUTHORIZATION, value);
        Ok(())
    }

    /// Builder form of [`GraphQlClient::set_authorization`].
    pub fn with_authorization(mut self, token: impl AsRef<str>) -> Result<Self> {
        self.set_authorization(token)?;
        Ok(self)
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    /// Executes one GraphQL operation and decodes its `data`.
    ///
    /// Errors tagged with the retryable code re-run the whole operation, up
    /// to `options.retries` times. Any other error fails at once: a single
    /// error as [`ChromaticError::GraphQl`], several as
    /// [`ChromaticError::GraphQlErrors`]. Transport failures are returned as
    /// the HTTP layer reported them.
    pub async fn run_query<T, V>(
        &self,
        query: &str,
        variables: &V,
        options: QueryOptions,
    ) -> Result<T>
    where
        T: DeserializeOwned,
        V: Serialize,
    {
        let payload = serde_json::to_vec(&GraphQlRequest { query, variables })
            .map(Bytes::from)
            .map_err(|err| {
                ChromaticError::Decode(format!("failed to encode GraphQL request: {err}"))
            })?;

        let endpoint = options.endpoint.as_deref().unwrap_or(&self.endpoint);
        let mut headers = self.headers.clone();
        for (name, value) in &options.headers {
            headers.insert(name.clone(), value.clone());
        }
        let retries = options.retries;

        retry::run(&RetryPolicy::new(retries), &self.backoff, |attempt| {
            let request = FetchRequest::post().headers(&headers).body(payload.clone());
            async move {
                if attempt > 0 {
                    debug!(%endpoint, retry = attempt, "re-running GraphQL operation");
                }
                let response = match self
                    .http
                    .fetch(endpoint, request, FetchOptions::default().retries(retries))
                    .await
                {
                    Ok(response) => response,
                    Err(err) => return Outcome::Fatal(err),
                };
                let body = match response.bytes().await {
                    Ok(body) => body,
                    Err(err) => return Outcome::Fatal(ChromaticError::Transport(err)),
                };
                match serde_json::from_slice::<GraphQlResponse>(&body) {
                    Ok(parsed) => classify(parsed),
                    Err(err) => Outcome::Fatal(ChromaticError::Decode(format!(
                        "invalid GraphQL response JSON: {err}"
                    ))),
                }
            }
        })
        .await
    }
}

/// Turns a GraphQL response into data, a retry request, or a fatal error.
fn classify<T: DeserializeOwned>(response: GraphQlResponse) -> Outcome<T> {
    let errors = match response.errors {
        None => {
            let data = response.data.unwrap_or(JsonValue::Null);
            return match serde_json::from_value(data) {
                Ok(data) => Outcome::Success(data),
                Err(err) => Outcome::Fatal(ChromaticError::Decode(format!(
                    "unexpected GraphQL data shape: {err}"
                ))),
            };
        }
        Some(JsonValue::Array(errors)) => errors,
        Some(other) => return Outcome::Fatal(ChromaticError::GraphQl(single_error(other))),
    };

    let mut classified = Vec::with_capacity(errors.len());
    for raw in errors {
        let error = match serde_json::from_value::<GraphQlError>(raw.clone()) {
            Ok(error) => error,
            Err(_) => GraphQlError::new(raw.to_string()),
        };
        if error.is_retryable() {
            return Outcome::Retry(ChromaticError::GraphQl(error));
        }
        classified.push(error.classify());
    }

    if classified.len() == 1 {
        if let Some(error) = classified.pop() {
            return Outcome::Fatal(ChromaticError::GraphQl(error));
        }
    }
    Outcome::Fatal(ChromaticError::GraphQlErrors(classified))
}

/// A non-array `errors` payload, surfaced as-is.
fn single_error(payload: JsonValue) -> GraphQlError {
    match payload {
        JsonValue::String(message) => GraphQlError::new(message),
        other => serde_json::from_value::<GraphQlError>(other.clone())
            .unwrap_or_else(|_| GraphQlError::new(other.to_string())),
    }
}

fn normalize_bearer_authorization(token: &str) -> String {
    let trimmed = token.trim();
    let prefix = trimmed.get(..7);
    if prefix.is_some_and(|value| value.eq_ignore_ascii_case("bearer ")) {
        trimmed.to_owned()
    } else {
        format!("Bearer {trimmed}")
    }
}
