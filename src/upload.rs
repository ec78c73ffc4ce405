//! Concurrent signed-URL uploads of a static build directory.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use futures::{StreamExt, TryStreamExt};
use reqwest::header::{self, HeaderValue};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{
    progress::{AttemptProgress, FileProgress, NoopReporter, ProgressReporter, ProgressTracker},
    retry::{self, Backoff, Outcome, RetryPolicy},
    transport::{FetchOptions, FetchRequest},
    wire::{GetUploadUrlsData, GetUploadUrlsVariables, UploadUrl},
    ChromaticError, GraphQlClient, HttpClient, NetworkEnv, QueryOptions, Result,
};

/// Mutation that issues one signed PUT URL per relative path.
pub const GET_UPLOAD_URLS_MUTATION: &str = r#"
  mutation GetUploadUrlsMutation($paths: [String!]!) {
    getUploadUrls(paths: $paths) {
      domain
      urls {
        path
        url
        contentType
      }
    }
  }
"#;

/// Entry file of a static Storybook build.
pub const ENTRY_FILE: &str = "iframe.html";

pub const DEFAULT_UPLOAD_RETRIES: u32 = 5;
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// A regular file found under the build directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalFile {
    pub local_path: PathBuf,
    /// Relative, `/`-separated.
    pub remote_path: String,
    pub content_length: u64,
}

/// One file paired with its signed upload URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadTarget {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub signed_url: String,
    pub content_type: String,
    /// Measured once at discovery and sent as `content-length`.
    pub content_length: u64,
}

/// Settings for [`ArtifactUploader`].
#[derive(Clone)]
pub struct UploadOptions {
    /// Retries per file after its first attempt.
    pub retries: u32,
    pub max_concurrency: usize,
    pub backoff: Backoff,
    /// Per-PUT timeout; `None` lets large files take as long as they need.
    pub timeout: Option<Duration>,
    /// Cancels the whole upload when triggered.
    pub cancel: CancellationToken,
    pub reporter: Arc<dyn ProgressReporter>,
}

impl fmt::Debug for UploadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadOptions")
            .field("retries", &self.retries)
            .field("max_concurrency", &self.max_concurrency)
            .field("backoff", &self.backoff)
            .field("timeout", &self.timeout)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("reporter", &self.reporter)
            .finish()
    }
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            retries: DEFAULT_UPLOAD_RETRIES,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            backoff: Backoff::default(),
            timeout: None,
            cancel: CancellationToken::new(),
            reporter: default_reporter(),
        }
    }
}

/// A terminal bar when the `progress-bar` feature is on. indicatif hides it
/// when stderr is not a terminal.
#[cfg(feature = "progress-bar")]
fn default_reporter() -> Arc<dyn ProgressReporter> {
    Arc::new(crate::progress::ProgressBarReporter::new())
}

#[cfg(not(feature = "progress-bar"))]
fn default_reporter() -> Arc<dyn ProgressReporter> {
    Arc::new(NoopReporter)
}

impl UploadOptions {
    /// Defaults with the retry budget taken from `CHROMATIC_RETRIES`.
    pub fn from_env(env: &NetworkEnv) -> Self {
        Self {
            retries: env.retries.unwrap_or(DEFAULT_UPLOAD_RETRIES),
            ..Self::default()
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Reports to a terminal progress bar.
    #[cfg(feature = "progress-bar")]
    pub fn with_progress_bar(self) -> Self {
        self.with_reporter(Arc::new(crate::progress::ProgressBarReporter::new()))
    }

    /// Discards progress updates.
    pub fn without_progress(self) -> Self {
        self.with_reporter(Arc::new(NoopReporter))
    }
}

/// Result of a successful [`ArtifactUploader::upload_targets`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UploadSummary {
    pub files: usize,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
}

/// Uploads build artifacts through signed URLs.
#[derive(Clone, Debug, Default)]
pub struct ArtifactUploader {
    options: UploadOptions,
}

impl ArtifactUploader {
    pub fn new(options: UploadOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &UploadOptions {
        &self.options
    }

    /// Uploads every file under `source_dir` and returns the URL of the
    /// uploaded entry file.
    pub async fn upload(&self, source_dir: &Path, graphql: &GraphQlClient) -> Result<String> {
        let files = collect_files(source_dir)?;
        let paths: Vec<String> = files.iter().map(|file| file.remote_path.clone()).collect();
        debug!(files = paths.len(), "requesting upload URLs");

        let data: GetUploadUrlsData = graphql
            .run_query(
                GET_UPLOAD_URLS_MUTATION,
                &GetUploadUrlsVariables { paths: &paths },
                QueryOptions::default(),
            )
            .await?;
        let issued = data.get_upload_urls;

        let targets = pair_targets(files, issued.urls)?;
        self.upload_targets(graphql.http(), targets).await?;

        Ok(entry_url(&issued.domain))
    }

    /// Uploads `targets` concurrently, each with its own retry budget.
    ///
    /// The first file to fail permanently fails the whole call; the shared
    /// cancellation token then stops every other upload at its next I/O step.
    pub async fn upload_targets(
        &self,
        http: &HttpClient,
        targets: Vec<UploadTarget>,
    ) -> Result<UploadSummary> {
        let total_bytes = targets.iter().map(|target| target.content_length).sum();
        let files = targets.len();
        let tracker = Arc::new(ProgressTracker::new(
            total_bytes,
            Arc::clone(&self.options.reporter),
        ));
        tracker.reporter().start(total_bytes, files);
        info!(files, total_bytes, "uploading build artifacts");

        let cancel = self.options.cancel.child_token();
        let mut uploads = futures::stream::iter(
            targets
                .iter()
                .map(|target| self.upload_file(http, target, &tracker, &cancel)),
        )
        .buffer_unordered(self.options.max_concurrency.max(1));

        while let Some(result) = uploads.next().await {
            if let Err(err) = result {
                cancel.cancel();
                tracker.reporter().finish(false);
                warn!(error = %err, "upload failed; cancelling remaining files");
                return Err(err);
            }
        }

        tracker.reporter().finish(true);
        let summary = UploadSummary {
            files,
            total_bytes,
            transferred_bytes: tracker.transferred_bytes(),
        };
        info!(files, total_bytes, "upload complete");
        Ok(summary)
    }

    async fn upload_file(
        &self,
        http: &HttpClient,
        target: &UploadTarget,
        tracker: &Arc<ProgressTracker>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let progress = Arc::new(FileProgress::new(Arc::clone(tracker)));
        let policy = RetryPolicy::new(self.options.retries);

        let result = retry::run_observed(
            &policy,
            &self.options.backoff,
            |_attempt| {
                let attempt = progress.begin_attempt();
                async move {
                    if cancel.is_cancelled() {
                        return Outcome::Fatal(ChromaticError::Cancelled);
                    }
                    let request = match self.put_request(target, attempt).await {
                        Ok(request) => request,
                        Err(err) => return Outcome::Fatal(err),
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => Outcome::Fatal(ChromaticError::Cancelled),
                        sent = http.fetch(&target.signed_url, request, no_retries()) => {
                            match sent {
                                Ok(_) => Outcome::Success(()),
                                Err(err) => Outcome::Retry(err),
                            }
                        }
                    }
                }
            },
            |err, attempt| {
                warn!(
                    path = %target.remote_path,
                    retry = attempt,
                    error = %err,
                    "file upload failed; retrying"
                );
            },
        )
        .await;

        match result {
            Ok(()) => {
                debug!(path = %target.remote_path, bytes = target.content_length, "uploaded file");
                Ok(())
            }
            Err(ChromaticError::Cancelled) => Err(ChromaticError::Cancelled),
            Err(err) => Err(ChromaticError::Upload {
                path: target.remote_path.clone(),
                source: Box::new(err),
            }),
        }
    }

    async fn put_request(
        &self,
        target: &UploadTarget,
        progress: AttemptProgress,
    ) -> Result<FetchRequest> {
        let content_type = HeaderValue::from_str(&target.content_type).map_err(|err| {
            ChromaticError::Config(format!(
                "invalid content type '{}' for {}: {err}",
                target.content_type, target.remote_path
            ))
        })?;

        let file = tokio::fs::File::open(&target.local_path)
            .await
            .map_err(|source| ChromaticError::Io {
                path: target.local_path.clone(),
                source,
            })?;
        let counted = ReaderStream::new(file).inspect_ok(move |chunk| {
            progress.record(chunk.len() as u64);
        });

        let mut request = FetchRequest::put()
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CONTENT_LENGTH, HeaderValue::from(target.content_length))
            .stream(reqwest::Body::wrap_stream(counted));
        request = match self.options.timeout {
            Some(timeout) => request.timeout(timeout),
            None => request.no_timeout(),
        };
        Ok(request)
    }
}

/// Lists every regular file under `root`, sorted by relative path.
pub fn collect_files(root: &Path) -> Result<Vec<LocalFile>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry.map_err(|err| {
            let path = err.path().unwrap_or(root).to_path_buf();
            ChromaticError::Io {
                path,
                source: err.into(),
            }
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let metadata = entry.metadata().map_err(|err| ChromaticError::Io {
            path: entry.path().to_path_buf(),
            source: err.into(),
        })?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| ChromaticError::Config(format!(
                "{} is outside {}",
                entry.path().display(),
                root.display()
            )))?;

        files.push(LocalFile {
            local_path: entry.path().to_path_buf(),
            remote_path: to_posix(relative),
            content_length: metadata.len(),
        });
    }
    files.sort_by(|a, b| a.remote_path.cmp(&b.remote_path));
    Ok(files)
}

/// Streaming bodies cannot be replayed, so the uploader drives retries.
fn no_retries() -> FetchOptions {
    FetchOptions::default().retries(0)
}

fn to_posix(relative: &Path) -> String {
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn pair_targets(files: Vec<LocalFile>, urls: Vec<UploadUrl>) -> Result<Vec<UploadTarget>> {
    let mut issued: HashMap<String, UploadUrl> = urls
        .into_iter()
        .map(|url| (url.path.clone(), url))
        .collect();

    files
        .into_iter()
        .map(|file| {
            let url = issued
                .remove(&file.remote_path)
                .ok_or_else(|| ChromaticError::MissingUploadUrl(file.remote_path.clone()))?;
            Ok(UploadTarget {
                local_path: file.local_path,
                remote_path: file.remote_path,
                signed_url: url.url,
                content_type: url.content_type,
                content_length: file.content_length,
            })
        })
        .collect()
}

fn entry_url(domain: &str) -> String {
    format!("{}/{ENTRY_FILE}", domain.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use super::{collect_files, entry_url, pair_targets, LocalFile, UploadOptions};
    use crate::{wire::UploadUrl, ChromaticError, NetworkEnv};

    #[test]
    fn collect_files_walks_nested_directories() {
        let dir = tempfile::tempdir().expect("temp dir");
        fs::write(dir.path().join("iframe.html"), vec![b'a'; 100]).expect("write iframe");
        fs::create_dir_all(dir.path().join("assets/js")).expect("create dirs");
        fs::write(dir.path().join("assets/js/main.js"), b"console.log(1)").expect("write js");
        fs::create_dir_all(dir.path().join("empty")).expect("create empty dir");

        let files = collect_files(dir.path()).expect("walk must succeed");
        let listed: Vec<(&str, u64)> = files
            .iter()
            .map(|file| (file.remote_path.as_str(), file.content_length))
            .collect();

        assert_eq!(listed, vec![("assets/js/main.js", 14), ("iframe.html", 100)]);
    }

    #[test]
    fn collect_files_reports_missing_directory() {
        let err = collect_files(&PathBuf::from("/definitely/not/here")).expect_err("must fail");
        assert!(matches!(err, ChromaticError::Io { .. }));
    }

    #[test]
    fn pair_targets_requires_a_url_per_file() {
        let files = vec![LocalFile {
            local_path: PathBuf::from("/tmp/sb/index.html"),
            remote_path: "index.html".to_owned(),
            content_length: 50,
        }];
        let err = pair_targets(files, Vec::new()).expect_err("must fail");
        assert!(matches!(err, ChromaticError::MissingUploadUrl(path) if path == "index.html"));
    }

    #[test]
    fn pair_targets_carries_metadata() {
        let files = vec![LocalFile {
            local_path: PathBuf::from("/tmp/sb/index.html"),
            remote_path: "index.html".to_owned(),
            content_length: 50,
        }];
        let urls = vec![UploadUrl {
            path: "index.html".to_owned(),
            url: "https://bucket.example/index.html?sig=1".to_owned(),
            content_type: "text/html".to_owned(),
        }];
        let targets = pair_targets(files, urls).expect("pairing must succeed");
        assert_eq!(targets[0].content_length, 50);
        assert_eq!(targets[0].content_type, "text/html");
        assert_eq!(targets[0].signed_url, "https://bucket.example/index.html?sig=1");
    }

    #[test]
    fn default_reporter_follows_progress_bar_feature() {
        let options = UploadOptions::default();
        let debug = format!("{options:?}");
        if cfg!(feature = "progress-bar") {
            assert!(debug.contains("ProgressBarReporter"), "{debug}");
        } else {
            assert!(debug.contains("NoopReporter"), "{debug}");
        }

        let quiet = UploadOptions::from_env(&NetworkEnv::default()).without_progress();
        let quiet = format!("{quiet:?}");
        assert!(quiet.contains("NoopReporter"), "{quiet}");
    }

    #[test]
    fn entry_url_joins_domain() {
        assert_eq!(
            entry_url("https://abc.chromatic.com/"),
            "https://abc.chromatic.com/iframe.html"
        );
        assert_eq!(
            entry_url("https://abc.chromatic.com"),
            "https://abc.chromatic.com/iframe.html"
        );
    }
}
