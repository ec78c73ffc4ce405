use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Serialize)]
pub struct GraphQlRequest<'a, V> {
    pub query: &'a str,
    pub variables: &'a V,
}

/// Response envelope. `errors` stays untyped so a non-array payload can be
/// told apart from a list of errors.
#[derive(Debug, Deserialize)]
pub struct GraphQlResponse {
    #[serde(default)]
    pub data: Option<JsonValue>,
    #[serde(default)]
    pub errors: Option<JsonValue>,
}

#[derive(Debug, Serialize)]
pub struct GetUploadUrlsVariables<'a> {
    pub paths: &'a [String],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetUploadUrlsData {
    pub get_upload_urls: UploadUrls,
}

#[derive(Debug, Deserialize)]
pub struct UploadUrls {
    pub domain: String,
    pub urls: Vec<UploadUrl>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrl {
    pub path: String,
    pub url: String,
    pub content_type: String,
}
