use std::{error::Error as StdError, path::PathBuf};

use reqwest::{header::HeaderMap, StatusCode};

use crate::{dns::DnsLookupError, GraphQlError};

/// Substrings that identify an unresolved-hostname failure in an error chain.
const DNS_FAILURE_MARKERS: &[&str] = &[
    "ENOTFOUND",
    "dns error",
    "failed to lookup address",
    "Name or service not known",
    "nodename nor servname",
    "no record found",
];

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum ChromaticError {
    /// Network or request execution error from `reqwest`.
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
    /// Non-success HTTP status, with the response metadata and body attached.
    #[error(transparent)]
    Http(HttpClientError),
    /// A single fatal GraphQL error.
    #[error("{0}")]
    GraphQl(GraphQlError),
    /// Several fatal GraphQL errors returned together.
    #[error("{}", join_messages(.0))]
    GraphQlErrors(Vec<GraphQlError>),
    /// Response decoding or protocol-shape validation error.
    #[error("decode error: {0}")]
    Decode(String),
    /// Local filesystem error while reading build artifacts.
    #[error("i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The upload-URL mutation did not issue a URL for a local file.
    #[error("no upload URL issued for '{0}'")]
    MissingUploadUrl(String),
    /// A file exhausted its retry budget.
    #[error("failed to upload '{path}': {source}")]
    Upload {
        path: String,
        #[source]
        source: Box<ChromaticError>,
    },
    /// The operation was cancelled before it could finish.
    #[error("operation was cancelled")]
    Cancelled,
    /// Invalid proxy, DNS or request configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ChromaticError {
    /// Returns `true` when the error is an unresolved-hostname failure.
    ///
    /// Checks the error chain for this crate's [`DnsLookupError`] first and
    /// falls back to the well-known resolver messages emitted by the system
    /// resolver.
    pub fn is_dns_failure(&self) -> bool {
        match self {
            Self::Transport(err) => {
                let mut current: Option<&(dyn StdError + 'static)> = Some(err);
                while let Some(error) = current {
                    if error.is::<DnsLookupError>() {
                        return true;
                    }
                    let message = error.to_string();
                    if DNS_FAILURE_MARKERS
                        .iter()
                        .any(|marker| message.contains(marker))
                    {
                        return true;
                    }
                    current = error.source();
                }
                false
            }
            Self::Upload { source, .. } => source.is_dns_failure(),
            _ => false,
        }
    }

    /// Returns the HTTP status when the error carries a response.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Http(err) => Some(err.status),
            Self::Transport(err) => err.status(),
            Self::Upload { source, .. } => source.status(),
            _ => None,
        }
    }
}

/// A non-2xx response, surfaced after the retry budget is exhausted.
///
/// The response body is a single-read stream, so it is read at most once
/// when the error is built and kept here for diagnostics.
#[derive(Debug, thiserror::Error)]
#[error(
    "HTTPClient failed to fetch {url}, got {}/{}",
    .status.as_u16(),
    .status.canonical_reason().unwrap_or("Unknown")
)]
pub struct HttpClientError {
    pub url: String,
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// `None` when the caller asked not to read the error body.
    pub body: Option<String>,
}

fn join_messages(errors: &[GraphQlError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::{ChromaticError, HttpClientError};
    use crate::GraphQlError;
    use reqwest::{header::HeaderMap, StatusCode};

    #[test]
    fn http_error_message_names_url_and_status() {
        let err = HttpClientError {
            url: "https://index.example.com/graphql".to_owned(),
            status: StatusCode::BAD_GATEWAY,
            headers: HeaderMap::new(),
            body: None,
        };
        assert_eq!(
            err.to_string(),
            "HTTPClient failed to fetch https://index.example.com/graphql, got 502/Bad Gateway"
        );
    }

    #[test]
    fn multiple_graphql_errors_are_joined_line_by_line() {
        let err = ChromaticError::GraphQlErrors(vec![
            GraphQlError::new("first"),
            GraphQlError::new("second"),
        ]);
        assert_eq!(err.to_string(), "first\nsecond");
    }

    #[test]
    fn non_transport_errors_are_not_dns_failures() {
        assert!(!ChromaticError::Decode("dns error".to_owned()).is_dns_failure());
        assert!(!ChromaticError::Cancelled.is_dns_failure());
    }
}
