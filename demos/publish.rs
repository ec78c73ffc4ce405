use std::path::PathBuf;

use chromatic_http::{ArtifactUploader, GraphQlClient, NetworkContext, UploadOptions};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let endpoint = std::env::var("CHROMATIC_INDEX_URL")?;
    let token = std::env::var("CHROMATIC_APP_TOKEN")?;
    let build_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("storybook-static"));

    let context = NetworkContext::new();
    let graphql = GraphQlClient::from_context(endpoint, context.clone()).with_authorization(token)?;

    let options = UploadOptions::from_env(&context.env()).with_progress_bar();
    let entry = ArtifactUploader::new(options)
        .upload(&build_dir, &graphql)
        .await?;

    println!("{entry}");
    Ok(())
}
