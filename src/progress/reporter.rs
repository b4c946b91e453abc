//! Progress reporter implementation
//!
//! Uses indicatif progress bars for file count and byte transfer. Listings
//! are lazy, so totals are not known up front: they grow as the dispatcher
//! discovers entries, and the bars chase them.

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Progress reporter for copy operations
pub struct ProgressReporter {
    /// Multi-progress container
    multi: MultiProgress,
    /// Byte transfer bar
    bytes_bar: ProgressBar,
    /// File count bar
    files_bar: ProgressBar,
    /// Status line
    status: ProgressBar,
    start_time: Instant,
    discovered_bytes: AtomicU64,
    discovered_files: AtomicU64,
    bytes_copied: AtomicU64,
    files_copied: AtomicU64,
    files_failed: AtomicU64,
    enabled: AtomicBool,
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

impl ProgressReporter {
    /// Create a progress reporter drawing to stderr
    pub fn new() -> Self {
        let multi = MultiProgress::new();

        let status = multi.add(ProgressBar::new_spinner());
        status.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        status.enable_steady_tick(Duration::from_millis(120));

        let files_bar = multi.add(ProgressBar::new(0));
        files_bar.set_style(style(
            "{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} files",
        ));
        files_bar.set_prefix("Files");

        let bytes_bar = multi.add(ProgressBar::new(0));
        bytes_bar.set_style(style(
            "{prefix:.bold.dim} [{bar:40.green/white}] {bytes}/{total_bytes} ({bytes_per_sec})",
        ));
        bytes_bar.set_prefix("Data ");

        Self {
            multi,
            bytes_bar,
            files_bar,
            status,
            start_time: Instant::now(),
            discovered_bytes: AtomicU64::new(0),
            discovered_files: AtomicU64::new(0),
            bytes_copied: AtomicU64::new(0),
            files_copied: AtomicU64::new(0),
            files_failed: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
        }
    }

    /// Create a reporter that counts but never draws (quiet mode, tests)
    pub fn disabled() -> Self {
        let reporter = Self::new();
        reporter.enabled.store(false, Ordering::SeqCst);
        reporter.status.disable_steady_tick();
        reporter.multi.set_draw_target(ProgressDrawTarget::hidden());
        reporter
    }

    /// A listed entry was handed to the worker pool
    pub fn entry_discovered(&self, size: u64) {
        let files = self.discovered_files.fetch_add(1, Ordering::Relaxed) + 1;
        let bytes = self.discovered_bytes.fetch_add(size, Ordering::Relaxed) + size;
        self.files_bar.set_length(files);
        self.bytes_bar.set_length(bytes);
    }

    /// Bytes moved by a worker
    pub fn bytes_transferred(&self, bytes: u64) {
        self.bytes_copied.fetch_add(bytes, Ordering::Relaxed);
        self.bytes_bar.inc(bytes);
    }

    /// A file finished copying
    pub fn file_completed(&self, path: &str) {
        self.files_copied.fetch_add(1, Ordering::Relaxed);
        self.files_bar.inc(1);
        self.set_current_file(path);
    }

    /// A file failed to copy
    pub fn file_failed(&self, path: &str, size: u64) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
        self.files_bar.inc(1);
        // Keep the byte bar reachable
        self.bytes_bar.inc(size);
        self.status.set_message(format!("failed: {}", path));
    }

    /// Set current status message
    pub fn set_status(&self, msg: &str) {
        self.status.set_message(msg.to_string());
    }

    fn set_current_file(&self, path: &str) {
        let display = match path.char_indices().rev().nth(56) {
            Some((idx, _)) if path.len() > 60 => format!("...{}", &path[idx..]),
            _ => path.to_string(),
        };
        self.status.set_message(display);
    }

    /// Elapsed time since the reporter was created
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Current throughput in bytes/second
    pub fn throughput(&self) -> f64 {
        let bytes = self.bytes_copied.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            bytes as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Finish progress with success message
    pub fn finish_success(&self, message: &str) {
        self.status.finish_with_message(format!("✓ {}", message));
        self.files_bar.finish();
        self.bytes_bar.finish();
    }

    /// Finish progress with error message
    pub fn finish_error(&self, message: &str) {
        self.status.finish_with_message(format!("✗ {}", message));
        self.files_bar.abandon();
        self.bytes_bar.abandon();
    }

    /// Check if progress is drawn
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Snapshot of the counters
    pub fn summary(&self) -> ProgressSummary {
        ProgressSummary {
            discovered_files: self.discovered_files.load(Ordering::Relaxed),
            discovered_bytes: self.discovered_bytes.load(Ordering::Relaxed),
            files_copied: self.files_copied.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            bytes_copied: self.bytes_copied.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            throughput: self.throughput(),
        }
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress summary
#[derive(Debug, Clone)]
pub struct ProgressSummary {
    /// Entries dispatched so far
    pub discovered_files: u64,
    /// Bytes in the entries dispatched so far
    pub discovered_bytes: u64,
    /// Files copied
    pub files_copied: u64,
    /// Files that failed
    pub files_failed: u64,
    /// Bytes copied
    pub bytes_copied: u64,
    /// Elapsed time
    pub elapsed: Duration,
    /// Throughput in bytes/second
    pub throughput: f64,
}

impl ProgressSummary {
    /// Share of discovered bytes already copied
    pub fn percentage(&self) -> f64 {
        if self.discovered_bytes == 0 {
            0.0
        } else {
            (self.bytes_copied as f64 / self.discovered_bytes as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_grow_with_discovery() {
        let reporter = ProgressReporter::disabled();
        assert!(!reporter.is_enabled());

        reporter.entry_discovered(600);
        reporter.entry_discovered(400);
        reporter.bytes_transferred(500);
        reporter.file_completed("a/b.txt");

        let summary = reporter.summary();
        assert_eq!(summary.discovered_files, 2);
        assert_eq!(summary.discovered_bytes, 1000);
        assert_eq!(summary.files_copied, 1);
        assert_eq!(summary.percentage(), 50.0);
    }

    #[test]
    fn test_failures_are_counted() {
        let reporter = ProgressReporter::disabled();
        reporter.entry_discovered(10);
        reporter.file_failed("x", 10);
        let summary = reporter.summary();
        assert_eq!(summary.files_failed, 1);
        assert_eq!(summary.files_copied, 0);
    }

    #[test]
    fn test_long_paths_are_shortened() {
        let reporter = ProgressReporter::disabled();
        let long = "d/".repeat(50);
        reporter.file_completed(&long);
        assert_eq!(reporter.summary().files_copied, 1);
    }
}
