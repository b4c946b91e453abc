//! Lazy filtered directory listing
//!
//! A [`DirIterator`] pulls raw entries from a backend's enumeration one at a
//! time, drops those rejected by the task's filters, and keeps running
//! totals over what it surfaced. Nothing is materialized unless the caller
//! asks for it with [`DirIterator::collect_all`].

use crate::error::{Result, XcpError};
use crate::fs::NameFilter;
use crate::storage::{
    open_backend, Backend, EntryStream, EnumerateOptions, FileMeta, RawEntry, StorageUrl,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;

/// What to list: a source address, a base-name glob, and optional predicates
#[derive(Debug, Clone)]
pub struct ListDirTask {
    /// Directory or key prefix to enumerate
    pub source: StorageUrl,
    filter: NameFilter,
    /// Report accurate mtime/mode for every entry
    pub with_meta: bool,
    /// Descend into subdirectories (default true)
    pub recursive: bool,
    /// Skip entries with any `.`-prefixed path segment
    pub skip_hidden: bool,
    /// Smallest size accepted, in bytes
    pub min_size: Option<u64>,
    /// Largest size accepted, in bytes
    pub max_size: Option<u64>,
    /// Only accept entries modified at or after this instant
    pub modified_since: Option<SystemTime>,
}

impl ListDirTask {
    /// Create a task, compiling the filter eagerly
    pub fn new(source: StorageUrl, filter: &str) -> Result<Self> {
        Ok(Self {
            source,
            filter: NameFilter::new(filter)?,
            with_meta: false,
            recursive: true,
            skip_hidden: false,
            min_size: None,
            max_size: None,
            modified_since: None,
        })
    }

    /// Parse the source address and compile the filter
    pub fn parse(source: &str, filter: &str) -> Result<Self> {
        Self::new(StorageUrl::parse(source)?, filter)
    }

    /// Request accurate mtime/mode for every entry
    pub fn with_meta(mut self, with_meta: bool) -> Self {
        self.with_meta = with_meta;
        self
    }

    /// Descend into subdirectories
    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Skip dot-files and anything under dot-directories
    pub fn skip_hidden(mut self, skip_hidden: bool) -> Self {
        self.skip_hidden = skip_hidden;
        self
    }

    /// Reject entries smaller than `bytes`
    pub fn min_size(mut self, bytes: u64) -> Self {
        self.min_size = Some(bytes);
        self
    }

    /// Reject entries larger than `bytes`
    pub fn max_size(mut self, bytes: u64) -> Self {
        self.max_size = Some(bytes);
        self
    }

    /// Reject entries modified before `since`
    pub fn modified_since(mut self, since: SystemTime) -> Self {
        self.modified_since = Some(since);
        self
    }

    /// Compiled name filter
    pub fn filter(&self) -> &NameFilter {
        &self.filter
    }

    /// Whether a raw entry passes every predicate of this task
    pub fn accepts(&self, entry: &RawEntry) -> bool {
        self.accepts_path_and_size(entry) && self.accepts_mtime(entry)
    }

    fn accepts_path_and_size(&self, entry: &RawEntry) -> bool {
        if !self.filter.matches(&entry.path) {
            return false;
        }

        if self.skip_hidden && entry.path.split('/').any(|s| s.starts_with('.')) {
            return false;
        }

        if let Some(min) = self.min_size {
            if entry.size < min {
                return false;
            }
        }
        if let Some(max) = self.max_size {
            if entry.size > max {
                return false;
            }
        }

        true
    }

    fn accepts_mtime(&self, entry: &RawEntry) -> bool {
        match self.modified_since {
            Some(since) => entry.meta.mtime >= since,
            None => true,
        }
    }

    /// Whether accepted entries need the metadata recorded by the backend
    fn needs_exact_meta(&self) -> bool {
        self.with_meta || self.modified_since.is_some()
    }

    fn enumerate_options(&self) -> EnumerateOptions {
        EnumerateOptions {
            recursive: self.recursive,
        }
    }
}

/// A listed file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    /// Path relative to the listed source, `/`-separated
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Modification time and mode, present when the task asked for them
    pub meta: Option<FileMeta>,
}

/// Running totals over the entries surfaced so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSummary {
    /// Number of matched files
    pub total_files: u64,
    /// Sum of their sizes
    pub total_bytes: u64,
}

impl ListSummary {
    /// Count one more entry
    pub fn add(&mut self, size: u64) {
        self.total_files += 1;
        self.total_bytes += size;
    }
}

/// Result of [`DirIterator::collect_all`]
#[derive(Debug, Default)]
pub struct Listing {
    /// Every entry surfaced by the collecting call
    pub entries: Vec<DirEntry>,
    /// The enumeration failure that ended the listing, if any
    pub error: Option<XcpError>,
}

impl Listing {
    /// Entries, or the enumeration error if one occurred
    pub fn into_result(self) -> Result<Vec<DirEntry>> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.entries),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NotStarted,
    Ready,
    Exhausted,
    Errored,
}

/// Forward-only, filtered enumeration of a backend subtree.
///
/// `advance` moves to the next matching entry and returns `false` once the
/// listing is exhausted or failed; `error` tells the two apart. The backend
/// is not contacted until the first `advance`.
pub struct DirIterator {
    task: ListDirTask,
    backend: Arc<dyn Backend>,
    stream: Option<EntryStream>,
    state: State,
    current: Option<DirEntry>,
    error: Option<XcpError>,
    error_yielded: bool,
    summary: ListSummary,
}

impl DirIterator {
    /// Iterate `task` over an explicit backend serving its source root
    pub fn with_backend(task: ListDirTask, backend: Arc<dyn Backend>) -> Self {
        Self {
            task,
            backend,
            stream: None,
            state: State::NotStarted,
            current: None,
            error: None,
            error_yielded: false,
            summary: ListSummary::default(),
        }
    }

    /// The task being listed
    pub fn task(&self) -> &ListDirTask {
        &self.task
    }

    /// Move to the next matching entry
    pub fn advance(&mut self) -> bool {
        if matches!(self.state, State::Exhausted | State::Errored) {
            return false;
        }

        if self.stream.is_none() {
            match self
                .backend
                .enumerate(self.task.source.path(), self.task.enumerate_options())
            {
                Ok(stream) => self.stream = Some(stream),
                Err(e) => return self.fail(e),
            }
        }

        loop {
            let next = match self.stream.as_mut() {
                Some(stream) => stream.next(),
                None => None,
            };

            match next {
                None => {
                    tracing::debug!(
                        "Listing of {} exhausted: {} files, {} bytes",
                        self.task.source,
                        self.summary.total_files,
                        self.summary.total_bytes
                    );
                    self.current = None;
                    self.stream = None;
                    self.state = State::Exhausted;
                    return false;
                }
                Some(Err(e)) => return self.fail(e),
                Some(Ok(mut raw)) => {
                    if !self.task.accepts_path_and_size(&raw) {
                        tracing::trace!("Skipping {}", raw.path);
                        continue;
                    }

                    // Only entries that survived the cheap predicates pay
                    // for a metadata lookup
                    if self.task.needs_exact_meta() && !raw.meta_exact {
                        match self.backend.stat(&self.task.source.resolve(&raw.path)) {
                            Ok(meta) => {
                                raw.meta = meta;
                                raw.meta_exact = true;
                            }
                            Err(e) => return self.fail(e),
                        }
                    }

                    if !self.task.accepts_mtime(&raw) {
                        tracing::trace!("Skipping {} (older than bound)", raw.path);
                        continue;
                    }

                    self.summary.add(raw.size);
                    self.current = Some(DirEntry {
                        meta: self.task.with_meta.then_some(raw.meta),
                        name: raw.path,
                        size: raw.size,
                    });
                    self.state = State::Ready;
                    return true;
                }
            }
        }
    }

    fn fail(&mut self, err: XcpError) -> bool {
        tracing::warn!("Listing of {} failed: {}", self.task.source, err);
        self.current = None;
        self.stream = None;
        self.error = Some(err);
        self.state = State::Errored;
        false
    }

    /// Entry reached by the last successful `advance`
    pub fn current(&self) -> Option<&DirEntry> {
        match self.state {
            State::Ready => self.current.as_ref(),
            _ => None,
        }
    }

    /// Enumeration failure; stays set once the iterator is in the errored
    /// state, however the failure was consumed
    pub fn error(&self) -> Option<&XcpError> {
        self.error.as_ref()
    }

    /// Whether no further entries will be produced
    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Exhausted | State::Errored)
    }

    /// Totals over the entries surfaced so far
    pub fn summary(&self) -> ListSummary {
        self.summary
    }

    /// Drain the remaining entries.
    ///
    /// Continues from the current position: entries already surfaced by
    /// `advance` are neither repeated nor counted twice.
    pub fn collect_all(&mut self) -> Listing {
        let mut entries = Vec::new();
        while self.advance() {
            if let Some(entry) = self.current.take() {
                entries.push(entry);
            }
        }
        self.error_yielded = self.error.is_some();
        Listing {
            entries,
            error: self.error.clone(),
        }
    }
}

impl Iterator for DirIterator {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.advance() {
            return self.current.take().map(Ok);
        }
        // The failure is yielded once, then the iterator is fused
        if self.error_yielded {
            return None;
        }
        self.error_yielded = true;
        self.error.clone().map(Err)
    }
}

/// List a task's source through the default backend registry
pub fn list_dir(task: ListDirTask) -> Result<DirIterator> {
    let backend = open_backend(&task.source)?;
    Ok(DirIterator::with_backend(task, backend))
}
