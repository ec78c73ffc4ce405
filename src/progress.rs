//! Aggregate byte progress across concurrent uploads.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, PoisonError,
};

/// Receives aggregate progress updates for one upload session.
pub trait ProgressReporter: std::fmt::Debug + Send + Sync {
    fn start(&self, _total_bytes: u64, _files: usize) {}

    fn update(&self, transferred_bytes: u64, total_bytes: u64);

    fn finish(&self, _success: bool) {}
}

/// Discards all updates.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn update(&self, _transferred_bytes: u64, _total_bytes: u64) {}
}

/// Terminal progress bar.
#[cfg(feature = "progress-bar")]
#[derive(Debug)]
pub struct ProgressBarReporter {
    bar: indicatif::ProgressBar,
}

#[cfg(feature = "progress-bar")]
impl Default for ProgressBarReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "progress-bar")]
impl ProgressBarReporter {
    pub fn new() -> Self {
        let bar = indicatif::ProgressBar::new(0);
        let style = indicatif::ProgressStyle::with_template(
            "{spinner:.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}",
        )
        .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
        .progress_chars("=> ");
        bar.set_style(style);
        Self { bar }
    }
}

#[cfg(feature = "progress-bar")]
impl ProgressReporter for ProgressBarReporter {
    fn start(&self, total_bytes: u64, files: usize) {
        self.bar.set_length(total_bytes);
        self.bar.set_position(0);
        self.bar.set_message(format!("uploading {files} files"));
    }

    fn update(&self, transferred_bytes: u64, _total_bytes: u64) {
        self.bar.set_position(transferred_bytes);
    }

    fn finish(&self, success: bool) {
        if success {
            self.bar.finish_with_message("upload complete");
        } else {
            self.bar.abandon_with_message("upload failed");
        }
    }
}

/// Shared counter of bytes sent across every file of one upload session.
pub struct ProgressTracker {
    total_bytes: u64,
    transferred_bytes: AtomicU64,
    reporter: Arc<dyn ProgressReporter>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("total_bytes", &self.total_bytes)
            .field("transferred_bytes", &self.transferred_bytes())
            .finish_non_exhaustive()
    }
}

impl ProgressTracker {
    pub fn new(total_bytes: u64, reporter: Arc<dyn ProgressReporter>) -> Self {
        Self {
            total_bytes,
            transferred_bytes: AtomicU64::new(0),
            reporter,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::SeqCst)
    }

    fn advance(&self, bytes: u64) {
        let transferred = self.transferred_bytes.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.reporter.update(transferred, self.total_bytes);
    }

    fn rollback(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let transferred = self.transferred_bytes.fetch_sub(bytes, Ordering::SeqCst) - bytes;
        self.reporter.update(transferred, self.total_bytes);
    }

    pub(crate) fn reporter(&self) -> &dyn ProgressReporter {
        self.reporter.as_ref()
    }
}

/// One file's share of a [`ProgressTracker`].
///
/// Every attempt gets a new generation; bytes reported by an older attempt's
/// stream are ignored so a retry can never be counted twice.
#[derive(Debug)]
pub struct FileProgress {
    tracker: Arc<ProgressTracker>,
    state: Mutex<FileState>,
}

#[derive(Debug, Default)]
struct FileState {
    generation: u64,
    sent: u64,
}

impl FileProgress {
    pub fn new(tracker: Arc<ProgressTracker>) -> Self {
        Self {
            tracker,
            state: Mutex::new(FileState::default()),
        }
    }

    /// Rolls this file's contribution back to zero and opens a new attempt.
    pub fn begin_attempt(self: &Arc<Self>) -> AttemptProgress {
        let mut state = self.lock();
        self.tracker.rollback(state.sent);
        state.sent = 0;
        state.generation += 1;
        AttemptProgress {
            file: Arc::clone(self),
            generation: state.generation,
        }
    }

    /// Bytes counted for the current attempt.
    pub fn sent(&self) -> u64 {
        self.lock().sent
    }

    fn record(&self, generation: u64, bytes: u64) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        state.sent += bytes;
        self.tracker.advance(bytes);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FileState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Counting handle owned by one attempt's body stream.
#[derive(Clone, Debug)]
pub struct AttemptProgress {
    file: Arc<FileProgress>,
    generation: u64,
}

impl AttemptProgress {
    pub fn record(&self, bytes: u64) {
        self.file.record(self.generation, bytes);
    }
}
