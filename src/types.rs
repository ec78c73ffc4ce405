use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Error code the API uses to tag errors that are safe to retry.
pub const RETRYABLE_ERROR_CODE: &str = "RETRYABLE_ERROR_CODE";

/// Default `name` given to classified GraphQL errors.
pub const GRAPHQL_ERROR_NAME: &str = "GraphQLError";

/// Source location of a GraphQL error inside the query document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

/// Free-form `extensions` object of a GraphQL error.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Extensions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(flatten)]
    pub other: Map<String, JsonValue>,
}

/// A GraphQL error as returned by the server.
///
/// `name` and `at` are filled in when the error is classified as fatal.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQlError {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<JsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<Location>>,
    #[serde(default)]
    pub extensions: Extensions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
}

impl GraphQlError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    /// The `extensions.code` value, if any.
    pub fn code(&self) -> Option<&str> {
        self.extensions.code.as_deref()
    }

    /// Whether the server tagged this error as safe to retry.
    pub fn is_retryable(&self) -> bool {
        self.code() == Some(RETRYABLE_ERROR_CODE)
    }

    /// Defaults `name` and derives the human-readable `at` field.
    pub(crate) fn classify(mut self) -> Self {
        if self.name.is_none() {
            self.name = Some(GRAPHQL_ERROR_NAME.to_owned());
        }
        self.at = Some(self.describe_location());
        self
    }

    /// Formats `"<dot-joined path> <line>:<col>, <line>:<col>"`.
    fn describe_location(&self) -> String {
        let path = self
            .path
            .iter()
            .flatten()
            .map(|segment| match segment {
                JsonValue::String(field) => field.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(".");
        let locations = self
            .locations
            .iter()
            .flatten()
            .map(|location| format!("{}:{}", location.line, location.column))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{path} {locations}")
    }
}

impl fmt::Display for GraphQlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.at.as_deref().map(str::trim) {
            Some(at) if !at.is_empty() => write!(f, "{} (at {at})", self.message),
            _ => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for GraphQlError {}
