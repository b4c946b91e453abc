//! Storage addresses
//!
//! Parses address strings such as `/data/in`, `file:///data/in`,
//! `s3://bucket/prefix` or `mem://bucket/prefix` into a [`StorageUrl`].

use crate::error::{Result, XcpError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Storage scheme of an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// Host filesystem
    Local,
    /// Process-wide in-memory object store
    Memory,
    /// S3-compatible object store
    S3,
}

impl Scheme {
    /// Scheme token as written in front of `://`
    pub fn token(&self) -> &'static str {
        match self {
            Self::Local => "file",
            Self::Memory => "mem",
            Self::S3 => "s3",
        }
    }

    /// Look up a scheme by its token
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "file" => Some(Self::Local),
            "mem" | "memory" => Some(Self::Memory),
            "s3" => Some(Self::S3),
            _ => None,
        }
    }

    /// Object stores address keys under a bucket
    pub fn is_object_store(&self) -> bool {
        !matches!(self, Self::Local)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// A parsed storage address: `{scheme, root, path}`.
///
/// `root` is the bucket for object stores and `/` or `.` for local paths.
/// `path` is always relative to the root, `/`-separated, with no empty or
/// `.` segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageUrl {
    scheme: Scheme,
    root: String,
    path: String,
}

impl StorageUrl {
    /// Parse an address string
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(XcpError::invalid_url(input, "empty address"));
        }

        let Some((token, rest)) = trimmed.split_once("://") else {
            return Ok(Self::local(trimmed));
        };

        let scheme = Scheme::from_token(token)
            .ok_or_else(|| XcpError::invalid_url(input, format!("unknown scheme '{}'", token)))?;

        match scheme {
            Scheme::Local => {
                if rest.is_empty() {
                    return Err(XcpError::invalid_url(input, "missing path"));
                }
                Ok(Self::local(rest))
            }
            Scheme::Memory | Scheme::S3 => {
                let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    return Err(XcpError::invalid_url(input, "empty bucket name"));
                }
                if bucket.contains(|c: char| c.is_whitespace() || c == '\\') {
                    return Err(XcpError::invalid_url(input, "malformed bucket name"));
                }
                let path = normalize(key);
                if path.split('/').any(|s| s == "..") {
                    return Err(XcpError::invalid_url(
                        input,
                        "parent segments are not allowed in object keys",
                    ));
                }
                Ok(Self {
                    scheme,
                    root: bucket.to_string(),
                    path,
                })
            }
        }
    }

    fn local(raw: &str) -> Self {
        let root = if raw.starts_with('/') { "/" } else { "." };
        Self {
            scheme: Scheme::Local,
            root: root.to_string(),
            path: normalize(raw),
        }
    }

    /// Storage scheme
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Bucket name or filesystem root
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Path relative to the root (may be empty)
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether this address points at the host filesystem
    pub fn is_local(&self) -> bool {
        self.scheme == Scheme::Local
    }

    /// Append a relative path
    pub fn join(&self, relative: &str) -> Self {
        Self {
            scheme: self.scheme,
            root: self.root.clone(),
            path: join_key(&self.path, relative),
        }
    }

    /// Path of `relative` as seen from this address' root
    pub fn resolve(&self, relative: &str) -> String {
        join_key(&self.path, relative)
    }
}

impl fmt::Display for StorageUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::Local if self.root == "/" => write!(f, "/{}", self.path),
            Scheme::Local if self.path.is_empty() => f.write_str("."),
            Scheme::Local => f.write_str(&self.path),
            scheme if self.path.is_empty() => write!(f, "{}://{}", scheme, self.root),
            scheme => write!(f, "{}://{}/{}", scheme, self.root, self.path),
        }
    }
}

impl FromStr for StorageUrl {
    type Err = XcpError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Collapse redundant separators and `.` segments
fn normalize(raw: &str) -> String {
    raw.split(|c| c == '/' || c == '\\')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Join two `/`-separated keys, normalizing the result
pub fn join_key(base: &str, relative: &str) -> String {
    let relative = normalize(relative);
    match (base.is_empty(), relative.is_empty()) {
        (true, _) => relative,
        (false, true) => base.to_string(),
        (false, false) => format!("{}/{}", base, relative),
    }
}

/// Last segment of a `/`-separated key
pub fn base_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_local_absolute() {
        let url = StorageUrl::parse("/tmp//xcp/./data/").unwrap();
        assert_eq!(url.scheme(), Scheme::Local);
        assert_eq!(url.root(), "/");
        assert_eq!(url.path(), "tmp/xcp/data");
        assert_eq!(url.to_string(), "/tmp/xcp/data");
    }

    #[test]
    fn test_parse_local_relative_and_file_scheme() {
        let url = StorageUrl::parse("data/in").unwrap();
        assert_eq!(url.root(), ".");
        assert_eq!(url.path(), "data/in");

        let url = StorageUrl::parse("file:///var/lib").unwrap();
        assert!(url.is_local());
        assert_eq!(url.root(), "/");
        assert_eq!(url.path(), "var/lib");

        let dot = StorageUrl::parse(".").unwrap();
        assert_eq!(dot.path(), "");
        assert_eq!(dot.to_string(), ".");
    }

    #[test]
    fn test_parse_object_store() {
        let url = StorageUrl::parse("s3://my-bucket/xcptests//run1/").unwrap();
        assert_eq!(url.scheme(), Scheme::S3);
        assert_eq!(url.root(), "my-bucket");
        assert_eq!(url.path(), "xcptests/run1");
        assert_eq!(url.to_string(), "s3://my-bucket/xcptests/run1");

        let url = StorageUrl::parse("mem://scratch").unwrap();
        assert_eq!(url.scheme(), Scheme::Memory);
        assert_eq!(url.path(), "");
        assert_eq!(url.to_string(), "mem://scratch");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(StorageUrl::parse(""), Err(XcpError::InvalidUrl { .. })));
        assert!(matches!(StorageUrl::parse("s3://"), Err(XcpError::InvalidUrl { .. })));
        assert!(matches!(StorageUrl::parse("s3:///key"), Err(XcpError::InvalidUrl { .. })));
        assert!(matches!(StorageUrl::parse("ftp://host/x"), Err(XcpError::InvalidUrl { .. })));
        assert!(matches!(StorageUrl::parse("mem://b/../x"), Err(XcpError::InvalidUrl { .. })));
    }

    #[test]
    fn test_join_and_resolve() {
        let url = StorageUrl::parse("s3://b/prefix").unwrap();
        assert_eq!(url.resolve("sub/a.txt"), "prefix/sub/a.txt");
        assert_eq!(url.join("sub").to_string(), "s3://b/prefix/sub");

        let root = StorageUrl::parse("mem://b").unwrap();
        assert_eq!(root.resolve("a.txt"), "a.txt");
        assert_eq!(base_name("x/y/a.csv"), "a.csv");
        assert_eq!(base_name("a.csv"), "a.csv");
    }

    proptest! {
        #[test]
        fn prop_display_round_trips(
            scheme in prop_oneof![Just("s3"), Just("mem"), Just("file"), Just("")],
            bucket in "[a-z][a-z0-9-]{0,12}",
            segments in prop::collection::vec("[a-zA-Z0-9_.-]{1,8}", 0..5),
        ) {
            let key = segments.join("/");
            let input = match scheme {
                "" => format!("/{}/{}", bucket, key),
                "file" => format!("file:///{}/{}", bucket, key),
                s => format!("{}://{}/{}", s, bucket, key),
            };
            if let Ok(url) = StorageUrl::parse(&input) {
                let again = StorageUrl::parse(&url.to_string()).unwrap();
                prop_assert_eq!(again, url);
            }
        }
    }
}
