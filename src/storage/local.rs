//! Local filesystem backend
//!
//! Maps paths directly onto the host filesystem. Metadata is applied with
//! native utime/chmod after the written file is closed.

use crate::error::{IoResultExt, Result, XcpError};
use crate::storage::{
    Backend, EntryStream, EnumerateOptions, FileMeta, FileWriter, RawEntry, Scheme, StorageUrl,
};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// Buffer size for local readers and writers
const LOCAL_BUFFER_SIZE: usize = 256 * 1024;

/// Backend for the host filesystem
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a backend rooted at `root`. Absolute paths passed to the
    /// backend's operations bypass the root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create a backend for the root of a local address
    pub fn from_url(url: &StorageUrl) -> Result<Self> {
        if !url.is_local() {
            return Err(XcpError::UnsupportedScheme(url.scheme().to_string()));
        }
        Ok(Self::new(url.root()))
    }

    /// Filesystem root of this backend
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }
}

impl Backend for LocalBackend {
    fn scheme(&self) -> Scheme {
        Scheme::Local
    }

    fn open_reader(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let full = self.resolve(path);
        let display = full.display().to_string();
        let file = File::open(&full).with_path(&display)?;
        let metadata = file.metadata().with_path(&display)?;
        if metadata.is_dir() {
            return Err(XcpError::io(
                display,
                io::Error::new(io::ErrorKind::Other, "is a directory"),
            ));
        }
        Ok(Box::new(BufReader::with_capacity(LOCAL_BUFFER_SIZE, file)))
    }

    fn open_writer(&self, path: &str, meta: Option<&FileMeta>) -> Result<Box<dyn FileWriter>> {
        let full = self.resolve(path);

        if let Some(parent) = full.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_path(parent.display().to_string())?;
            }
        }

        let display = full.display().to_string();
        let file = match File::create(&full) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied && full.is_file() => {
                // A read-only copy, e.g. one left by an earlier run with metadata
                tracing::debug!("Making {} writable before overwriting it", full.display());
                make_owner_writable(&full).with_path(&display)?;
                File::create(&full).with_path(&display)?
            }
            Err(e) => return Err(XcpError::io(display, e)),
        };

        Ok(Box::new(LocalWriter {
            writer: BufWriter::with_capacity(LOCAL_BUFFER_SIZE, file),
            path: full,
            meta: meta.copied(),
            written: 0,
        }))
    }

    fn enumerate(&self, prefix: &str, options: EnumerateOptions) -> Result<EntryStream> {
        let dir = self.resolve(prefix);

        let metadata = match fs::metadata(&dir) {
            Ok(m) => m,
            Err(e) => {
                let err = XcpError::io(dir.display().to_string(), e);
                return Ok(Box::new(std::iter::once(Err(err))));
            }
        };

        if !metadata.is_dir() {
            let err = XcpError::io(
                dir.display().to_string(),
                io::Error::new(io::ErrorKind::Other, "not a directory"),
            );
            return Ok(Box::new(std::iter::once(Err(err))));
        }

        let max_depth = if options.recursive { usize::MAX } else { 1 };
        let walker = WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(max_depth)
            .follow_links(false)
            .sort_by_file_name();

        let stream = walker.into_iter().filter_map(move |item| {
            let entry = match item {
                Ok(e) => e,
                Err(err) => return Some(Err(walk_error(err, &dir))),
            };

            // Symlinks to regular files are listed with their target's
            // size and metadata; directory links are not descended into
            let metadata = if entry.path_is_symlink() {
                match fs::metadata(entry.path()) {
                    Ok(m) if m.is_file() => m,
                    Ok(_) => {
                        tracing::warn!(
                            "Skipping {}: symlink to a non-regular file",
                            entry.path().display()
                        );
                        return None;
                    }
                    Err(e) => {
                        tracing::warn!("Skipping {}: broken symlink ({})", entry.path().display(), e);
                        return None;
                    }
                }
            } else if entry.file_type().is_file() {
                match entry.metadata() {
                    Ok(m) => m,
                    Err(err) => return Some(Err(walk_error(err, &dir))),
                }
            } else {
                if !entry.file_type().is_dir() {
                    tracing::warn!("Skipping {}: not a regular file", entry.path().display());
                }
                return None;
            };

            let relative = entry.path().strip_prefix(&dir).unwrap_or(entry.path());
            let path = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            Some(Ok(RawEntry {
                path,
                size: metadata.len(),
                meta: meta_from_fs(&metadata),
                meta_exact: true,
            }))
        });

        Ok(Box::new(stream))
    }

    fn stat(&self, path: &str) -> Result<FileMeta> {
        let full = self.resolve(path);
        let metadata = fs::metadata(&full).with_path(full.display().to_string())?;
        Ok(meta_from_fs(&metadata))
    }
}

fn walk_error(err: walkdir::Error, fallback: &Path) -> XcpError {
    let path = err.path().unwrap_or(fallback).display().to_string();
    XcpError::io(path, err.into())
}

fn meta_from_fs(metadata: &fs::Metadata) -> FileMeta {
    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode()
    };

    #[cfg(not(unix))]
    let mode = if metadata.permissions().readonly() {
        0o444
    } else {
        crate::storage::DEFAULT_FILE_MODE
    };

    FileMeta::new(
        metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        mode,
    )
}

/// Add the owner-write bit to an existing file
fn make_owner_writable(path: &Path) -> io::Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        permissions.set_mode(permissions.mode() | 0o200);
    }

    #[cfg(not(unix))]
    permissions.set_readonly(false);

    fs::set_permissions(path, permissions)
}

/// Apply mtime and permission bits to a closed file
fn apply_meta(path: &Path, meta: &FileMeta) -> Result<()> {
    let display = path.display().to_string();

    filetime::set_file_mtime(path, filetime::FileTime::from_system_time(meta.mtime))
        .with_path(&display)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(meta.mode)).with_path(&display)?;
    }

    #[cfg(not(unix))]
    {
        let mut permissions = fs::metadata(path).with_path(&display)?.permissions();
        permissions.set_readonly(meta.mode & 0o200 == 0);
        fs::set_permissions(path, permissions).with_path(&display)?;
    }

    Ok(())
}

/// Writer for a local file
struct LocalWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    meta: Option<FileMeta>,
    written: u64,
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl FileWriter for LocalWriter {
    fn close(self: Box<Self>) -> Result<u64> {
        let LocalWriter {
            writer,
            path,
            meta,
            written,
        } = *self;
        let display = path.display().to_string();

        let file = writer
            .into_inner()
            .map_err(|e| XcpError::io(display.clone(), e.into_error()))?;
        drop(file);

        if let Some(meta) = meta {
            apply_meta(&path, &meta)?;
        }

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    const CONTENT: &[u8] = b"dummy content";

    fn write_file(backend: &LocalBackend, path: &str, meta: Option<&FileMeta>) {
        let mut w = backend.open_writer(path, meta).unwrap();
        w.write_all(CONTENT).unwrap();
        assert_eq!(w.close().unwrap(), CONTENT.len() as u64);
    }

    fn names(stream: EntryStream) -> Vec<String> {
        stream.map(|e| e.unwrap().path).collect()
    }

    #[test]
    fn test_read_into_larger_buffer() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());
        write_file(&backend, "a.csv", None);

        let mut reader = backend.open_reader("a.csv").unwrap();
        let mut data = [0u8; 100];
        let n = reader.read(&mut data).unwrap();
        assert_eq!(n, CONTENT.len());
        assert_eq!(&data[..n], CONTENT);
    }

    #[test]
    fn test_absolute_paths_bypass_root() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new("/");
        let path = dir.path().join("a.txt");
        write_file(&backend, path.to_str().unwrap(), None);
        assert_eq!(fs::read(&path).unwrap(), CONTENT);
    }

    #[cfg(unix)]
    #[test]
    fn test_writer_applies_meta_on_close() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());
        let mtime = SystemTime::now() - Duration::from_secs(23 * 3600);
        let meta = FileMeta::new(mtime, 0o777);

        write_file(&backend, "a.csv", Some(&meta));

        let stat = backend.stat("a.csv").unwrap();
        assert_eq!(stat.mode, 0o777);
        let drift = stat
            .mtime
            .duration_since(mtime)
            .unwrap_or_else(|e| e.duration());
        assert!(drift < Duration::from_secs(1));
    }

    #[cfg(unix)]
    #[test]
    fn test_writer_overwrites_read_only_file() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());
        let meta = FileMeta::new(SystemTime::now() - Duration::from_secs(60), 0o444);

        let mut w = backend.open_writer("ro.txt", Some(&meta)).unwrap();
        w.write_all(b"first run, longer body").unwrap();
        w.close().unwrap();
        assert_eq!(backend.stat("ro.txt").unwrap().mode, 0o444);

        write_file(&backend, "ro.txt", Some(&meta));

        assert_eq!(fs::read(dir.path().join("ro.txt")).unwrap(), CONTENT);
        assert_eq!(backend.stat("ro.txt").unwrap().mode, 0o444);
    }

    #[test]
    fn test_writer_creates_parents_and_truncates() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());

        let mut w = backend.open_writer("x/y/z.bin", None).unwrap();
        w.write_all(b"a much longer first version").unwrap();
        w.close().unwrap();
        write_file(&backend, "x/y/z.bin", None);

        assert_eq!(fs::read(dir.path().join("x/y/z.bin")).unwrap(), CONTENT);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());
        let err = backend.open_reader("nope.txt").err().unwrap();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_enumerate_depth_and_order() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());
        write_file(&backend, "b.txt", None);
        write_file(&backend, "a.txt", None);
        write_file(&backend, "sub/c.txt", None);

        let flat = backend
            .enumerate("", EnumerateOptions { recursive: false })
            .unwrap();
        assert_eq!(names(flat), vec!["a.txt", "b.txt"]);

        let deep = backend
            .enumerate("", EnumerateOptions { recursive: true })
            .unwrap();
        assert_eq!(names(deep), vec!["a.txt", "b.txt", "sub/c.txt"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_enumerate_resolves_file_symlinks() {
        use std::os::unix::fs::symlink;

        let dir = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());
        write_file(&backend, "real.txt", None);

        let target = elsewhere.path().join("target.bin");
        fs::write(&target, b"linked body").unwrap();
        symlink(&target, dir.path().join("link.txt")).unwrap();
        symlink(elsewhere.path().join("gone"), dir.path().join("dangling.txt")).unwrap();
        symlink(elsewhere.path(), dir.path().join("linkdir")).unwrap();

        let entries: Vec<_> = backend
            .enumerate("", EnumerateOptions { recursive: true })
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(names, vec!["link.txt", "real.txt"]);
        assert_eq!(entries[0].size, b"linked body".len() as u64);

        let mut reader = backend.open_reader("link.txt").unwrap();
        let mut body = Vec::new();
        reader.read_to_end(&mut body).unwrap();
        assert_eq!(body, b"linked body");
    }

    #[test]
    fn test_enumerate_reports_sizes() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());
        write_file(&backend, "a.txt", None);

        let entries: Vec<_> = backend
            .enumerate("", EnumerateOptions::default())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].size, CONTENT.len() as u64);
    }

    #[test]
    fn test_enumerate_missing_dir_fails_lazily() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());
        let mut stream = backend
            .enumerate("missing", EnumerateOptions::default())
            .unwrap();
        assert!(stream.next().unwrap().unwrap_err().is_not_found());
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_enumerate_file_prefix_is_an_error() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());
        write_file(&backend, "only.dat", None);
        let mut stream = backend
            .enumerate("only.dat", EnumerateOptions::default())
            .unwrap();
        assert!(matches!(stream.next(), Some(Err(XcpError::Io { .. }))));
    }
}
