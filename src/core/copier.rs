//! Main copy engine
//!
//! Pairs a directory listing with a destination address and drives a fixed
//! pool of transfer workers. The dispatcher advances the listing on the
//! calling thread; workers stream bytes from source readers to destination
//! writers and report back through the scheduler's result channel.
//!
//! Stopping (an external [`CopyEngine::cancel`] or the first failure under
//! [`FailurePolicy::FailFast`]) drains: no new entries are dispatched,
//! transfers already running finish, and queued entries are skipped.

use crate::core::{TransferJob, TransferOutcome, TransferQueue, TransferStatus, WorkerChannels};
use crate::error::{join_errors, Result, XcpError};
use crate::fs::{DirIterator, ListDirTask, ListSummary};
use crate::progress::ProgressReporter;
use crate::storage::{default_registry, Backend, BackendRegistry, StorageUrl};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Default transfer buffer size: 256 KB
pub const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;

/// What to do when a single transfer fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Record the failure and keep copying the remaining entries
    #[default]
    ContinueOnError,
    /// Stop dispatching after the first failure
    FailFast,
}

/// Copy operation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyOptions {
    /// Parallel transfers (0 = number of CPUs)
    pub concurrency: usize,
    /// Reaction to per-entry failures
    pub failure_policy: FailurePolicy,
    /// Read/write buffer size per worker
    pub buffer_size: usize,
    /// Extra attempts for transient failures
    pub retries: u32,
    /// Base delay between attempts (grows linearly)
    pub retry_delay: Duration,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get(),
            failure_policy: FailurePolicy::default(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            retries: 2,
            retry_delay: Duration::from_millis(100),
        }
    }
}

impl CopyOptions {
    /// Options with the given worker count and defaults otherwise
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    /// Worker count with `0` resolved to the CPU count
    pub fn effective_concurrency(&self) -> usize {
        if self.concurrency == 0 {
            num_cpus::get()
        } else {
            self.concurrency
        }
    }
}

/// Copy operation result
#[derive(Debug, Default)]
pub struct CopyResult {
    /// Files copied
    pub files_copied: u64,
    /// Bytes copied
    pub bytes_copied: u64,
    /// Totals over every entry the listing produced
    pub listed: ListSummary,
    /// Per-entry failures
    pub failures: Vec<XcpError>,
    /// Failure that cut the listing short
    pub enumeration_error: Option<XcpError>,
    /// Whether an external stop request was observed
    pub cancelled: bool,
    /// Entries dispatched but never started
    pub skipped: u64,
    /// Total duration
    pub duration: Duration,
    /// Average throughput in bytes/second
    pub throughput: f64,
}

impl CopyResult {
    /// Check if every listed entry was copied
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.enumeration_error.is_none() && !self.cancelled
    }

    /// Remove and return the representative error: the enumeration failure
    /// if any, else the transfer failures, else `Cancelled` after a stop
    /// request.
    pub fn take_error(&mut self) -> Option<XcpError> {
        if let Some(err) = self.enumeration_error.take() {
            return Some(err);
        }
        if let Some(err) = join_errors(std::mem::take(&mut self.failures)) {
            return Some(err);
        }
        if self.cancelled {
            return Some(XcpError::Cancelled);
        }
        None
    }

    /// The result itself, or its representative error
    pub fn into_result(mut self) -> Result<Self> {
        match self.take_error() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }

    /// Machine-readable summary
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": self.is_success(),
            "files_copied": self.files_copied,
            "bytes_copied": self.bytes_copied,
            "listed": self.listed,
            "skipped": self.skipped,
            "cancelled": self.cancelled,
            "duration_secs": self.duration.as_secs_f64(),
            "throughput": self.throughput,
            "enumeration_error": self.enumeration_error.as_ref().map(|e| e.to_string()),
            "failures": self.failures.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
        })
    }

    /// Print summary to console
    pub fn print_summary(&self) {
        println!("\n=== Copy Summary ===");
        println!("Files listed:    {}", self.listed.total_files);
        println!("Files copied:    {}", self.files_copied);
        println!("Bytes copied:    {}", humansize::format_size(self.bytes_copied, humansize::BINARY));
        println!("Duration:        {}", humantime::format_duration(round_millis(self.duration)));
        println!("Throughput:      {}/s", humansize::format_size(self.throughput as u64, humansize::BINARY));

        if self.skipped > 0 {
            println!("Skipped:         {}", self.skipped);
        }
        if self.cancelled {
            println!("Cancelled before completion");
        }
        if let Some(err) = &self.enumeration_error {
            println!("\nListing failed: {}", err);
        }
        if !self.failures.is_empty() {
            println!("\nFailures: {}", self.failures.len());
            for err in &self.failures {
                println!("  {}", err);
            }
        }
    }
}

fn round_millis(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

/// Main copy engine
pub struct CopyEngine {
    options: CopyOptions,
    registry: Option<BackendRegistry>,
    progress: Option<ProgressReporter>,
    cancelled: Arc<AtomicBool>,
}

/// Per-run state shared with the workers
struct RunContext<'a> {
    source: &'a dyn Backend,
    source_url: &'a StorageUrl,
    destination: &'a dyn Backend,
    destination_url: &'a StorageUrl,
    options: &'a CopyOptions,
    progress: Option<&'a ProgressReporter>,
    cancelled: &'a AtomicBool,
    halted: &'a AtomicBool,
}

impl RunContext<'_> {
    fn should_stop(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.halted.load(Ordering::SeqCst)
    }
}

impl CopyEngine {
    /// Create a new copy engine
    pub fn new(options: CopyOptions) -> Self {
        Self {
            options,
            registry: None,
            progress: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set progress reporter
    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = Some(progress);
        self
    }

    /// The attached progress reporter, if any
    pub fn progress(&self) -> Option<&ProgressReporter> {
        self.progress.as_ref()
    }

    /// Resolve addresses through `registry` instead of the default one
    pub fn with_registry(mut self, registry: BackendRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Engine settings
    pub fn options(&self) -> &CopyOptions {
        &self.options
    }

    /// Get cancellation flag for external control
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Cancel the operation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check if cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn open(&self, url: &StorageUrl) -> Result<Arc<dyn Backend>> {
        match &self.registry {
            Some(registry) => registry.open(url),
            None => default_registry().open(url),
        }
    }

    /// Copy every entry of `listing` below `destination`.
    ///
    /// Returns `Err` only when a backend cannot be constructed; everything
    /// that goes wrong after I/O begins is reported in the [`CopyResult`].
    pub fn execute(&self, listing: ListDirTask, destination: &StorageUrl) -> Result<CopyResult> {
        let source = self
            .open(&listing.source)
            .map_err(|e| e.with_context("opening source"))?;
        let dest = self
            .open(destination)
            .map_err(|e| e.with_context("opening destination"))?;

        Ok(self.execute_with_backends(listing, source, destination, dest))
    }

    /// Like [`CopyEngine::execute`], with explicit backends serving the
    /// listing's source root and the destination root
    pub fn execute_with_backends(
        &self,
        listing: ListDirTask,
        source: Arc<dyn Backend>,
        destination: &StorageUrl,
        dest: Arc<dyn Backend>,
    ) -> CopyResult {
        let start_time = Instant::now();
        let source_url = listing.source.clone();
        let workers = self.options.effective_concurrency();
        tracing::info!(
            "Copying {} -> {} (filter '{}', {} workers)",
            source_url,
            destination,
            listing.filter().pattern(),
            workers
        );

        if let Some(progress) = &self.progress {
            progress.set_status(&format!("Copying {}", source_url));
        }

        let halted = AtomicBool::new(false);
        let ctx = RunContext {
            source: source.as_ref(),
            source_url: &source_url,
            destination: dest.as_ref(),
            destination_url: destination,
            options: &self.options,
            progress: self.progress.as_ref(),
            cancelled: &self.cancelled,
            halted: &halted,
        };

        let mut iter = DirIterator::with_backend(listing, Arc::clone(&source));
        let (mut queue, channels) = TransferQueue::new(workers);
        let stats = queue.stats();
        let mut result = CopyResult::default();

        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for worker_id in 0..workers {
                let channels = channels.clone();
                let ctx = &ctx;
                let spawned = thread::Builder::new()
                    .name(format!("xcp-worker-{}", worker_id))
                    .spawn_scoped(scope, move || run_worker(worker_id, channels, ctx));
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(e) => result
                        .failures
                        .push(XcpError::WorkerPool(format!("failed to spawn worker: {}", e))),
                }
            }
            drop(channels);

            if handles.is_empty() {
                return;
            }

            // Dispatch: the listing is only ever advanced from this thread
            loop {
                if ctx.should_stop() {
                    break;
                }
                match iter.next() {
                    None => break,
                    Some(Err(e)) => {
                        result.enumeration_error = Some(e);
                        break;
                    }
                    Some(Ok(entry)) => {
                        if let Some(progress) = ctx.progress {
                            progress.entry_discovered(entry.size);
                        }
                        if let Err(e) = queue.submit(entry) {
                            result.failures.push(e);
                            break;
                        }
                    }
                }
                for outcome in queue.ready_outcomes() {
                    record_outcome(&mut result, outcome);
                }
            }

            for outcome in queue.close().iter() {
                record_outcome(&mut result, outcome);
            }

            for handle in handles {
                if handle.join().is_err() {
                    result
                        .failures
                        .push(XcpError::WorkerPool("transfer worker panicked".to_string()));
                }
            }
        });

        result.listed = iter.summary();
        result.cancelled = self.is_cancelled();
        result.files_copied = stats.copied.load(Ordering::Relaxed);
        result.bytes_copied = stats.bytes_copied.load(Ordering::Relaxed);
        result.skipped = stats.skipped.load(Ordering::Relaxed);
        result.duration = start_time.elapsed();
        result.throughput = stats.throughput(result.duration);

        tracing::info!(
            "Copied {} of {} files ({} bytes) in {:.2?}",
            result.files_copied,
            result.listed.total_files,
            result.bytes_copied,
            result.duration
        );

        if let Some(progress) = self.progress.as_ref().filter(|p| p.is_enabled()) {
            if result.is_success() {
                progress.finish_success(&format!("{} files copied", result.files_copied));
            } else {
                progress.finish_error(&format!(
                    "{} files copied, {} failed",
                    result.files_copied,
                    result.failures.len()
                ));
            }
        }

        result
    }
}

fn record_outcome(result: &mut CopyResult, outcome: TransferOutcome) {
    if let TransferStatus::Failed(err) = outcome.status {
        result.failures.push(err);
    }
}

fn run_worker(worker_id: usize, channels: WorkerChannels, ctx: &RunContext<'_>) {
    for job in channels.jobs.iter() {
        let outcome = if ctx.should_stop() {
            TransferOutcome {
                job_id: job.id,
                name: job.entry.name,
                status: TransferStatus::Skipped,
                attempts: 0,
                duration: Duration::ZERO,
            }
        } else {
            channels.stats.start();
            run_job(job, ctx)
        };

        channels.stats.finish(&outcome.status);
        if channels.results.send(outcome).is_err() {
            break;
        }
    }

    tracing::debug!("Worker {} shutting down", worker_id);
}

/// Transfer one entry, retrying transient failures
fn run_job(job: TransferJob, ctx: &RunContext<'_>) -> TransferOutcome {
    let started = Instant::now();
    let entry = &job.entry;
    let source_path = ctx.source_url.resolve(&entry.name);
    let dest_path = ctx.destination_url.resolve(&entry.name);

    let mut attempts = 0;
    let status = loop {
        attempts += 1;
        match transfer(ctx, &source_path, &dest_path, entry.meta.as_ref()) {
            Ok(bytes) => {
                tracing::debug!("Copied {} -> {} ({} bytes)", source_path, dest_path, bytes);
                if let Some(progress) = ctx.progress {
                    progress.bytes_transferred(bytes);
                    progress.file_completed(&entry.name);
                }
                break TransferStatus::Copied(bytes);
            }
            Err(e) if e.is_recoverable() && attempts <= ctx.options.retries && !ctx.should_stop() => {
                let delay = ctx.options.retry_delay * attempts;
                tracing::warn!(
                    "Copy of {} failed (attempt {}/{}): {}. Retrying in {:?}",
                    entry.name,
                    attempts,
                    ctx.options.retries + 1,
                    e,
                    delay
                );
                thread::sleep(delay);
            }
            Err(e) => {
                tracing::warn!("Failed to copy {}: {}", entry.name, e);
                if let Some(progress) = ctx.progress {
                    progress.file_failed(&entry.name, entry.size);
                }
                if ctx.options.failure_policy == FailurePolicy::FailFast {
                    ctx.halted.store(true, Ordering::SeqCst);
                }
                break TransferStatus::Failed(e);
            }
        }
    };

    TransferOutcome {
        job_id: job.id,
        name: job.entry.name,
        status,
        attempts,
        duration: started.elapsed(),
    }
}

/// Stream one file from the source backend to the destination backend.
/// Read failures are attributed to the source path, write failures to the
/// destination path.
fn transfer(
    ctx: &RunContext<'_>,
    source_path: &str,
    dest_path: &str,
    meta: Option<&crate::storage::FileMeta>,
) -> Result<u64> {
    let mut reader = ctx.source.open_reader(source_path)?;
    let mut writer = ctx.destination.open_writer(dest_path, meta)?;

    let mut buffer = vec![0u8; ctx.options.buffer_size.max(1)];
    let mut copied = 0u64;

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(XcpError::io(source_path, e)),
        };
        writer
            .write_all(&buffer[..n])
            .map_err(|e| XcpError::io(dest_path, e))?;
        copied += n as u64;
    }

    writer.close()?;
    Ok(copied)
}

/// Copy `listing` to `destination` with `concurrency` workers, returning the
/// representative error if anything went wrong
pub fn copy_dir(
    listing: ListDirTask,
    destination: &StorageUrl,
    concurrency: usize,
) -> Result<CopyResult> {
    let options = CopyOptions {
        concurrency: concurrency.max(1),
        ..Default::default()
    };
    CopyEngine::new(options)
        .execute(listing, destination)?
        .into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{
        EntryStream, EnumerateOptions, FileMeta, FileWriter, LocalBackend, MemoryStore, Scheme,
    };
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;
    use std::time::SystemTime;
    use tempfile::TempDir;

    const CONTENT: &[u8] = b"dummy content";

    fn url(path: &Path) -> StorageUrl {
        StorageUrl::parse(path.to_str().unwrap()).unwrap()
    }

    fn write(backend: &dyn Backend, path: &str, data: &[u8], meta: Option<&FileMeta>) {
        let mut w = backend.open_writer(path, meta).unwrap();
        w.write_all(data).unwrap();
        w.close().unwrap();
    }

    fn create_test_structure(dir: &Path) {
        let backend = LocalBackend::new(dir);
        write(&backend, "tiny.txt", b"tiny", None);
        write(&backend, "small.bin", &[0xABu8; 10 * 1024], None);
        write(&backend, "subdir1/medium.bin", &[0xCDu8; 100 * 1024], None);
        write(&backend, "subdir2/nested/deep.txt", b"deep file content", None);
    }

    fn read_tree(dir: &Path) -> BTreeMap<String, Vec<u8>> {
        walkdir::WalkDir::new(dir)
            .into_iter()
            .map(|e| e.unwrap())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e.path().strip_prefix(dir).unwrap().to_string_lossy().into_owned();
                (rel, fs::read(e.path()).unwrap())
            })
            .collect()
    }

    fn task(source: &StorageUrl, filter: &str) -> ListDirTask {
        ListDirTask::new(source.clone(), filter).unwrap()
    }

    fn options(concurrency: usize) -> CopyOptions {
        CopyOptions {
            concurrency,
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_copy_local_to_memory_and_back() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let backend = LocalBackend::new(src.path());
        write(&backend, "a.txt", CONTENT, None);
        let meta = FileMeta::new(SystemTime::now() - Duration::from_secs(23 * 3600), 0o777);
        write(&backend, "a.csv", CONTENT, Some(&meta));

        let mem = StorageUrl::parse("mem://copier-roundtrip/xcptests").unwrap();
        let first = copy_dir(task(&url(src.path()), "*.*"), &mem, 1).unwrap();
        assert_eq!(first.files_copied, 2);
        assert_eq!(first.listed.total_files, 2);

        let second = copy_dir(task(&mem, "*.*"), &url(dst.path()), 1).unwrap();
        assert_eq!(second.files_copied, 2);
        assert_eq!(second.listed, first.listed);

        assert_eq!(read_tree(src.path()), read_tree(dst.path()));
        MemoryStore::remove_shared("copier-roundtrip");
    }

    #[test]
    fn test_reporter_tracks_the_run() {
        let src = TempDir::new().unwrap();
        create_test_structure(src.path());

        let dst = StorageUrl::parse("mem://copier-progress").unwrap();
        let engine = CopyEngine::new(CopyOptions::with_concurrency(2))
            .with_progress(ProgressReporter::disabled());
        let result = engine.execute(task(&url(src.path()), ""), &dst).unwrap();

        let summary = engine.progress().unwrap().summary();
        assert_eq!(summary.discovered_files, 4);
        assert_eq!(summary.files_copied, result.files_copied);
        assert_eq!(summary.bytes_copied, result.bytes_copied);
        assert_eq!(summary.percentage(), 100.0);
        MemoryStore::remove_shared("copier-progress");
    }

    #[cfg(unix)]
    #[test]
    fn test_meta_survives_round_trip() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let backend = LocalBackend::new(src.path());
        let mtime = SystemTime::UNIX_EPOCH + Duration::new(1_650_000_000, 250_000_000);
        write(&backend, "x/data.csv", CONTENT, Some(&FileMeta::new(mtime, 0o640)));
        write(&backend, "exec.sh", CONTENT, Some(&FileMeta::new(mtime, 0o755)));

        let mem = StorageUrl::parse("mem://copier-meta").unwrap();
        copy_dir(task(&url(src.path()), "").with_meta(true), &mem, 4).unwrap();
        copy_dir(task(&mem, "").with_meta(true), &url(dst.path()), 4).unwrap();

        let copied = LocalBackend::new(dst.path());
        for (path, mode) in [("x/data.csv", 0o640), ("exec.sh", 0o755)] {
            let stat = copied.stat(path).unwrap();
            assert_eq!(stat.mode, mode);
            let drift = stat
                .mtime
                .duration_since(mtime)
                .unwrap_or_else(|e| e.duration());
            assert!(drift < Duration::from_millis(1), "{} drifted {:?}", path, drift);
        }
        MemoryStore::remove_shared("copier-meta");
    }

    #[test]
    fn test_copy_is_idempotent() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        create_test_structure(src.path());

        let engine = CopyEngine::new(options(4));
        engine.execute(task(&url(src.path()), ""), &url(dst.path())).unwrap();
        let once = read_tree(dst.path());
        let result = engine.execute(task(&url(src.path()), ""), &url(dst.path())).unwrap();

        assert!(result.is_success());
        assert_eq!(read_tree(dst.path()), once);
        assert_eq!(once, read_tree(src.path()));
    }

    #[test]
    fn test_concurrency_does_not_change_outcome() {
        let src = TempDir::new().unwrap();
        let backend = LocalBackend::new(src.path());
        for i in 0..40 {
            let data = vec![i as u8; 100 + i * 37];
            write(&backend, &format!("d{}/f{}.dat", i % 5, i), &data, None);
        }

        let serial = TempDir::new().unwrap();
        let parallel = TempDir::new().unwrap();
        let one = CopyEngine::new(options(1))
            .execute(task(&url(src.path()), "*.dat"), &url(serial.path()))
            .unwrap();
        let eight = CopyEngine::new(options(8))
            .execute(task(&url(src.path()), "*.dat"), &url(parallel.path()))
            .unwrap();

        assert!(one.is_success() && eight.is_success());
        assert_eq!(one.listed, eight.listed);
        assert_eq!(one.bytes_copied, eight.bytes_copied);
        assert_eq!(read_tree(serial.path()), read_tree(parallel.path()));
    }

    #[test]
    fn test_zero_matches_is_success() {
        let src = TempDir::new().unwrap();
        create_test_structure(src.path());
        let dst = TempDir::new().unwrap();

        let result = copy_dir(task(&url(src.path()), "*.none"), &url(dst.path()), 2).unwrap();
        assert_eq!(result.files_copied, 0);
        assert_eq!(result.listed, ListSummary::default());
        assert!(read_tree(dst.path()).is_empty());
    }

    #[test]
    fn test_missing_source_is_an_error() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let missing = url(&src.path().join("nope"));

        let result = CopyEngine::new(options(2))
            .execute(task(&missing, ""), &url(dst.path()))
            .unwrap();
        assert!(!result.is_success());
        assert!(result.enumeration_error.as_ref().unwrap().is_not_found());

        let err = copy_dir(task(&missing, ""), &url(dst.path()), 2).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_failures_are_aggregated() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        create_test_structure(src.path());
        // A file where the copy needs a directory
        fs::write(dst.path().join("subdir1"), b"in the way").unwrap();
        fs::create_dir_all(dst.path().join("subdir2")).unwrap();
        fs::write(dst.path().join("subdir2/nested"), b"in the way").unwrap();

        let mut result = CopyEngine::new(CopyOptions {
            retries: 0,
            ..options(2)
        })
        .execute(task(&url(src.path()), ""), &url(dst.path()))
        .unwrap();

        assert_eq!(result.files_copied, 2);
        assert_eq!(result.failures.len(), 2);
        assert_eq!(result.listed.total_files, 4);
        assert!(dst.path().join("tiny.txt").exists());
        assert!(matches!(
            result.take_error(),
            Some(XcpError::MultipleErrors { count: 2, .. })
        ));
    }

    #[test]
    fn test_fail_fast_stops_dispatch() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let backend = LocalBackend::new(src.path());
        write(&backend, "a/first.txt", CONTENT, None);
        for i in 0..20 {
            write(&backend, &format!("b/{:02}.txt", i), CONTENT, None);
        }
        fs::write(dst.path().join("a"), b"in the way").unwrap();

        let result = CopyEngine::new(CopyOptions {
            failure_policy: FailurePolicy::FailFast,
            retries: 0,
            ..options(1)
        })
        .execute(task(&url(src.path()), ""), &url(dst.path()))
        .unwrap();

        assert_eq!(result.failures.len(), 1);
        assert!(!result.cancelled);
        assert!(result.listed.total_files < 21);
        assert!(result.files_copied + result.skipped + 1 <= result.listed.total_files);
        assert!(result.files_copied < 20);
    }

    /// Local backend that raises the engine's cancel flag on its first read
    struct CancellingBackend {
        inner: LocalBackend,
        flag: Arc<AtomicBool>,
    }

    impl Backend for CancellingBackend {
        fn scheme(&self) -> Scheme {
            Scheme::Local
        }

        fn open_reader(&self, path: &str) -> Result<Box<dyn Read + Send>> {
            self.flag.store(true, Ordering::SeqCst);
            self.inner.open_reader(path)
        }

        fn open_writer(&self, path: &str, meta: Option<&FileMeta>) -> Result<Box<dyn FileWriter>> {
            self.inner.open_writer(path, meta)
        }

        fn enumerate(&self, prefix: &str, options: EnumerateOptions) -> Result<EntryStream> {
            self.inner.enumerate(prefix, options)
        }

        fn stat(&self, path: &str) -> Result<FileMeta> {
            self.inner.stat(path)
        }
    }

    #[test]
    fn test_cancel_drains_in_flight_and_skips_queued() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let backend = LocalBackend::new(src.path());
        for i in 0..10 {
            write(&backend, &format!("{:02}.txt", i), CONTENT, None);
        }

        let engine = CopyEngine::new(options(1));
        let source = Arc::new(CancellingBackend {
            inner: LocalBackend::new("/"),
            flag: engine.cancellation_flag(),
        });
        let dest = Arc::new(LocalBackend::new("/"));

        let mut result =
            engine.execute_with_backends(task(&url(src.path()), ""), source, &url(dst.path()), dest);

        assert!(result.cancelled);
        assert_eq!(result.files_copied, 1);
        assert!(result.failures.is_empty());
        assert!(result.listed.total_files < 10);
        assert_eq!(read_tree(dst.path()).len(), 1);
        assert!(matches!(result.take_error(), Some(XcpError::Cancelled)));
    }

    #[test]
    fn test_cancel_before_start() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        create_test_structure(src.path());

        let engine = CopyEngine::new(options(2));
        engine.cancel();
        let result = engine
            .execute(task(&url(src.path()), ""), &url(dst.path()))
            .unwrap();
        assert!(result.cancelled);
        assert_eq!(result.files_copied, 0);
        assert_eq!(result.listed.total_files, 0);
    }

    #[test]
    fn test_unsupported_destination_fails_before_io() {
        let src = TempDir::new().unwrap();
        let engine = CopyEngine::new(options(1)).with_registry(BackendRegistry::new());
        let err = engine
            .execute(task(&url(src.path()), ""), &StorageUrl::parse("mem://x").unwrap())
            .err()
            .unwrap();
        assert!(matches!(err, XcpError::WithContext { .. }));
    }

    #[test]
    fn test_result_json() {
        let result = CopyResult {
            files_copied: 3,
            bytes_copied: 30,
            failures: vec![XcpError::NotFound("k".into())],
            ..Default::default()
        };
        let json = result.to_json();
        assert_eq!(json["success"], false);
        assert_eq!(json["files_copied"], 3);
        assert_eq!(json["listed"]["total_files"], 0);
        assert_eq!(json["failures"][0], "Path not found: k");
    }
}
