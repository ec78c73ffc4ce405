use std::{
    fmt,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Method, Response,
};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use crate::{
    agent::Agent,
    retry::{self, Backoff, Outcome, RetryHook, RetryPolicy},
    AgentOptions, ChromaticError, ClientOptions, HttpClientError, NetworkContext, Result,
};

/// Body of a [`FetchRequest`].
enum RequestBody {
    /// Replayed on every attempt.
    Bytes(Bytes),
    /// Consumed by the first attempt.
    Stream(Option<reqwest::Body>),
}

/// Method, headers and body of one logical request.
pub struct FetchRequest {
    method: Method,
    headers: HeaderMap,
    body: Option<RequestBody>,
    /// `Some(None)` disables the timeout; `None` uses the client default.
    timeout: Option<Option<Duration>>,
}

impl fmt::Debug for FetchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchRequest")
            .field("method", &self.method)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Default for FetchRequest {
    fn default() -> Self {
        Self::new(Method::GET)
    }
}

impl FetchRequest {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn post() -> Self {
        Self::new(Method::POST)
    }

    pub fn put() -> Self {
        Self::new(Method::PUT)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Adds every header in `headers`, replacing existing values.
    pub fn headers(mut self, headers: &HeaderMap) -> Self {
        for (name, value) in headers {
            self.headers.insert(name.clone(), value.clone());
        }
        self
    }

    /// A body that is resent unchanged on every retry.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(RequestBody::Bytes(body.into()));
        self
    }

    /// A streaming body. It can only be sent once, so a retry after the
    /// first attempt fails with [`ChromaticError::Config`].
    pub fn stream(mut self, body: reqwest::Body) -> Self {
        self.body = Some(RequestBody::Stream(Some(body)));
        self
    }

    /// Overrides the client's default timeout for this request.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(Some(timeout));
        self
    }

    /// Lets this request run as long as it needs, ignoring the client's
    /// default timeout.
    pub fn no_timeout(mut self) -> Self {
        self.timeout = Some(None);
        self
    }

    fn take_body(&mut self) -> Result<Option<reqwest::Body>> {
        match &mut self.body {
            None => Ok(None),
            Some(RequestBody::Bytes(bytes)) => Ok(Some(reqwest::Body::from(bytes.clone()))),
            Some(RequestBody::Stream(stream)) => stream.take().map(Some).ok_or_else(|| {
                ChromaticError::Config("streaming request body cannot be replayed".to_owned())
            }),
        }
    }
}

/// Per-call knobs for [`HttpClient::fetch`].
#[derive(Clone, Default)]
pub struct FetchOptions {
    /// Overrides the client's default retry count; `Some(0)` disables retries.
    pub retries: Option<u32>,
    /// Route the request through this agent instead of the selected one.
    pub agent: Option<Agent>,
    /// Overrides for proxy agents created for this call.
    pub proxy: AgentOptions,
    /// Do not read the body of a non-ok response.
    pub no_log_error_body: bool,
    pub on_retry: Option<RetryHook>,
}

impl fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOptions")
            .field("retries", &self.retries)
            .field("agent", &self.agent)
            .field("proxy", &self.proxy)
            .field("no_log_error_body", &self.no_log_error_body)
            .finish_non_exhaustive()
    }
}

impl FetchOptions {
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn agent(mut self, agent: Agent) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn no_log_error_body(mut self) -> Self {
        self.no_log_error_body = true;
        self
    }

    pub fn on_retry(
        mut self,
        hook: impl Fn(&ChromaticError, u32) + Send + Sync + 'static,
    ) -> Self {
        self.on_retry = Some(std::sync::Arc::new(hook));
        self
    }
}

/// Retrying HTTP client with proxy and DNS-failover routing.
#[derive(Clone)]
pub struct HttpClient {
    context: NetworkContext,
    options: ClientOptions,
    backoff: Backoff,
    default_headers: HeaderMap,
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("options", &self.options)
            .field("backoff", &self.backoff)
            .field("default_headers", &self.default_headers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl HttpClient {
    pub fn new(context: NetworkContext, options: ClientOptions) -> Self {
        let backoff = options.backoff();
        Self {
            context,
            options,
            backoff,
            default_headers: HeaderMap::new(),
        }
    }

    /// A client with options taken from the context's environment.
    pub fn from_context(context: NetworkContext) -> Self {
        let options = ClientOptions::from_env(&context.env());
        Self::new(context, options)
    }

    /// Header sent with every request unless the request sets it itself.
    pub fn with_default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn context(&self) -> &NetworkContext {
        &self.context
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Sends `request`, retrying any failed attempt.
    ///
    /// Fails with [`ChromaticError::Http`] for a non-2xx status and with
    /// [`ChromaticError::Transport`] when no response was received, once
    /// the retry budget is spent.
    pub async fn fetch(
        &self,
        url: &str,
        request: FetchRequest,
        options: FetchOptions,
    ) -> Result<Response> {
        let target = Url::parse(url)
            .map_err(|err| ChromaticError::Config(format!("invalid URL '{url}': {err}")))?;
        let env = self.context.env();
        let initial = self.context.select_agent(
            &env,
            &target,
            options.agent.as_ref(),
            &options.proxy,
        )?;

        let retries = options.retries.unwrap_or(self.options.max_retries);
        let policy = RetryPolicy {
            max_retries: retries,
            on_retry: options.on_retry.clone(),
        };
        let timeout = request
            .timeout
            .unwrap_or_else(|| Some(self.options.timeout()));
        let no_log_error_body = options.no_log_error_body;

        let active = Mutex::new(initial);
        let mut request = request;

        retry::run_observed(
            &policy,
            &self.backoff,
            |_attempt| {
                let agent = lock(&active).clone();
                let prepared = self.prepare(&target, &mut request, agent.as_ref(), timeout);
                async move {
                    let builder = match prepared {
                        Ok(builder) => builder,
                        Err(err) => return Outcome::Fatal(err),
                    };
                    match builder.send().await {
                        Ok(response) if response.status().is_success() => {
                            Outcome::Success(response)
                        }
                        Ok(response) => Outcome::Retry(ChromaticError::Http(
                            client_error(response, no_log_error_body).await,
                        )),
                        Err(err) => Outcome::Retry(ChromaticError::Transport(err)),
                    }
                }
            },
            |err, attempt| {
                debug!(
                    url = %target,
                    retry = attempt,
                    max_retries = retries,
                    error = %err,
                    "fetch failed; retrying"
                );
                if err.is_dns_failure() {
                    let mut active = lock(&active);
                    if let Err(escalation) = self.context.escalate_dns_failure(&env, &mut active) {
                        warn!(error = %escalation, "could not switch DNS resolution");
                    }
                }
            },
        )
        .await
    }

    /// Performs [`HttpClient::fetch`] and reads the whole body.
    pub async fn fetch_buffer(&self, url: &str, request: FetchRequest) -> Result<Bytes> {
        let response = self.fetch(url, request, FetchOptions::default()).await?;
        response.bytes().await.map_err(ChromaticError::Transport)
    }

    /// Performs [`HttpClient::fetch`] and decodes the body as JSON.
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        request: FetchRequest,
        options: FetchOptions,
    ) -> Result<T> {
        let response = self.fetch(url, request, options).await?;
        let body = response.bytes().await.map_err(ChromaticError::Transport)?;
        serde_json::from_slice(&body).map_err(|err| {
            ChromaticError::Decode(format!("invalid JSON response from {url}: {err}"))
        })
    }

    fn prepare(
        &self,
        target: &Url,
        request: &mut FetchRequest,
        agent: Option<&Agent>,
        timeout: Option<Duration>,
    ) -> Result<reqwest::RequestBuilder> {
        let client = match agent {
            Some(agent) => agent.client().clone(),
            None => self.context.direct_agent()?.client().clone(),
        };

        let mut headers = self.default_headers.clone();
        for (name, value) in &request.headers {
            headers.insert(name.clone(), value.clone());
        }

        let mut builder = client
            .request(request.method.clone(), target.clone())
            .headers(headers);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = request.take_body()? {
            builder = builder.body(body);
        }
        Ok(builder)
    }
}

/// Builds the error for a non-ok response, reading the body at most once.
async fn client_error(response: Response, no_log_error_body: bool) -> HttpClientError {
    let url = response.url().to_string();
    let status = response.status();
    let headers = response.headers().clone();

    let body = if no_log_error_body {
        None
    } else {
        match response.text().await {
            Ok(body) => Some(body),
            Err(err) => {
                debug!(%url, error = %err, "failed to read error response body");
                None
            }
        }
    };

    let error = HttpClientError {
        url,
        status,
        headers,
        body,
    };
    debug!(status = status.as_u16(), body = ?error.body, "{error}");
    error
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use reqwest::Method;

    use super::{FetchOptions, FetchRequest, HttpClient};
    use crate::{ChromaticError, ClientOptions, NetworkContext, NetworkEnv};

    #[test]
    fn byte_bodies_can_be_taken_repeatedly() {
        let mut request = FetchRequest::post().body(Bytes::from_static(b"{}"));
        assert!(request.take_body().expect("first take").is_some());
        assert!(request.take_body().expect("second take").is_some());
    }

    #[test]
    fn streaming_bodies_are_single_use() {
        let mut request = FetchRequest::new(Method::PUT).stream(reqwest::Body::from("abc"));
        assert!(request.take_body().expect("first take").is_some());
        assert!(matches!(
            request.take_body(),
            Err(ChromaticError::Config(_))
        ));
    }

    #[tokio::test]
    async fn invalid_url_is_a_config_error() {
        let client = HttpClient::new(
            NetworkContext::with_env(NetworkEnv::default()),
            ClientOptions::default(),
        );
        let err = client
            .fetch("not a url", FetchRequest::get(), FetchOptions::default())
            .await
            .expect_err("fetch must fail");
        assert!(matches!(err, ChromaticError::Config(_)));
    }
}
