//! Resource acquisition: turns a model's resource manifest into local paths.
//!
//! URI grammar: `blob://<bucket>/<key>` names an object in the blob store;
//! any string without the `blob://` scheme is a literal passed through as-is.
//! Blobs land at `<resource_dir>/<model>/<key with '/' replaced by '_'>`.
//! That flattening is not injective (`a/b` and `a_b`, or one key in two
//! buckets), so a manifest whose distinct objects share a local path is
//! rejected before anything is downloaded.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use lazy_static::lazy_static;
use log::{info, warn};
use regex::Regex;
use thiserror::Error;

pub const BLOB_SCHEME: &str = "blob://";

lazy_static! {
    static ref BUCKET: Regex = Regex::new(r"^[A-Za-z0-9._-]+$").expect("valid bucket regex");
}

/// Logical resource name -> local path or literal value.
pub type ResolvedResources = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceUri {
    Literal(String),
    Blob { bucket: String, key: String },
}

impl ResourceUri {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let Some(rest) = raw.strip_prefix(BLOB_SCHEME) else {
            return Ok(ResourceUri::Literal(raw.to_string()));
        };
        let (bucket, key) = rest
            .split_once('/')
            .ok_or_else(|| "expected blob://<bucket>/<key>".to_string())?;
        if !BUCKET.is_match(bucket) {
            return Err(format!("invalid bucket name '{bucket}'"));
        }
        if key.is_empty() {
            return Err("missing object key".to_string());
        }
        if key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(format!("invalid object key '{key}'"));
        }
        Ok(ResourceUri::Blob {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}

/// Failure reported by a blob store for one fetch attempt.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Worth retrying (network hiccup, 5xx, interrupted I/O).
    #[error("{0}")]
    Transient(String),
    /// Retrying cannot help (object missing, access denied).
    #[error("{0}")]
    Permanent(String),
}

/// Fatal, per-model error from resource acquisition.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("resource '{name}' has invalid URI '{uri}': {reason}")]
    InvalidUri {
        name: String,
        uri: String,
        reason: String,
    },
    #[error("resource '{name}' @ {uri} needs a blob store but none is configured")]
    NoBlobStore { name: String, uri: String },
    #[error("failed to prepare destination for resource '{name}' @ {uri}: {source}")]
    Destination {
        name: String,
        uri: String,
        #[source]
        source: io::Error,
    },
    #[error("resources '{other}' and '{name}' name different objects but both land at {path}")]
    PathCollision {
        name: String,
        other: String,
        path: PathBuf,
    },
    #[error("failed to download resource '{name}' @ {uri} after {attempts} attempt(s): {cause}")]
    Download {
        name: String,
        uri: String,
        attempts: u32,
        cause: String,
    },
}

/// Source of `blob://` objects.
pub trait BlobStore: Send + Sync {
    /// Write the object `bucket/key` to `dest`, replacing any existing file.
    fn fetch(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), FetchError>;
}

/// Blob store backed by a directory laid out as `<root>/<bucket>/<key>`.
#[derive(Debug, Clone)]
pub struct DirectoryBlobStore {
    root: PathBuf,
}

impl DirectoryBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl BlobStore for DirectoryBlobStore {
    fn fetch(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), FetchError> {
        let source = self.root.join(bucket).join(key);
        match fs::copy(&source, dest) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(FetchError::Permanent(format!(
                "no such object {}",
                source.display()
            ))),
            Err(e) => Err(FetchError::Transient(format!(
                "copy from {} failed: {e}",
                source.display()
            ))),
        }
    }
}

/// Blob store reached over HTTP with path-style object URLs:
/// `GET <endpoint>/<bucket>/<key>`.
#[derive(Debug)]
pub struct HttpBlobStore {
    endpoint: String,
    agent: ureq::Agent,
}

impl HttpBlobStore {
    pub fn new(endpoint: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout_read(Duration::from_secs(60))
            .build();
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            agent,
        }
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{bucket}/{key}", self.endpoint)
    }
}

impl BlobStore for HttpBlobStore {
    fn fetch(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), FetchError> {
        let url = self.object_url(bucket, key);
        let resp = match self
            .agent
            .get(&url)
            .set("User-Agent", "pressurize/0.1")
            .call()
        {
            Ok(r) => r,
            Err(ureq::Error::Status(code, _)) if code >= 500 || code == 429 => {
                return Err(FetchError::Transient(format!("GET {url} returned {code}")));
            }
            Err(ureq::Error::Status(code, _)) => {
                return Err(FetchError::Permanent(format!("GET {url} returned {code}")));
            }
            Err(e) => return Err(FetchError::Transient(format!("GET {url} failed: {e}"))),
        };

        let mut file = fs::File::create(dest)
            .map_err(|e| FetchError::Permanent(format!("cannot create {}: {e}", dest.display())))?;
        io::copy(&mut resp.into_reader(), &mut file)
            .map_err(|e| FetchError::Transient(format!("reading body of {url} failed: {e}")))?;
        file.sync_all()
            .map_err(|e| FetchError::Transient(format!("flushing {} failed: {e}", dest.display())))?;
        Ok(())
    }
}

/// Pick a blob store for the configured endpoint: http(s) URLs use
/// [`HttpBlobStore`], anything else is treated as a directory.
pub fn blob_store_for(endpoint: Option<&str>) -> Option<Box<dyn BlobStore>> {
    let endpoint = endpoint?;
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Some(Box::new(HttpBlobStore::new(endpoint)))
    } else {
        Some(Box::new(DirectoryBlobStore::new(endpoint)))
    }
}

/// Bounded exponential backoff around transient download failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }

    /// Delay before retry number `retry` (1-based): 200ms, 400ms, 800ms, ... capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

pub struct ResourceAcquirer<'a> {
    resource_dir: PathBuf,
    store: Option<&'a dyn BlobStore>,
    retry: RetryPolicy,
}

impl<'a> ResourceAcquirer<'a> {
    pub fn new(resource_dir: impl Into<PathBuf>, store: Option<&'a dyn BlobStore>, retry: RetryPolicy) -> Self {
        Self {
            resource_dir: resource_dir.into(),
            store,
            retry,
        }
    }

    /// Deterministic local path for a blob of `model`.
    pub fn local_path(&self, model: &str, key: &str) -> PathBuf {
        self.resource_dir.join(model).join(key.replace('/', "_"))
    }

    /// Resolve every manifest entry. The first failure aborts the whole manifest.
    pub fn acquire(
        &self,
        model: &str,
        manifest: &BTreeMap<String, String>,
    ) -> Result<ResolvedResources, ResourceError> {
        self.check_collisions(model, manifest)?;
        let mut resolved = ResolvedResources::new();
        for (name, uri) in manifest {
            let value = self.acquire_one(model, name, uri)?;
            resolved.insert(name.clone(), value);
        }
        info!(
            "[RESOURCES] Acquired {} resource(s) for model '{model}'",
            resolved.len()
        );
        Ok(resolved)
    }

    fn check_collisions(&self, model: &str, manifest: &BTreeMap<String, String>) -> Result<(), ResourceError> {
        let mut seen: BTreeMap<PathBuf, (&str, String, String)> = BTreeMap::new();
        for (name, uri) in manifest {
            // Malformed URIs are reported by acquire_one.
            let Ok(ResourceUri::Blob { bucket, key }) = ResourceUri::parse(uri) else {
                continue;
            };
            let path = self.local_path(model, &key);
            match seen.get(&path) {
                Some((other, b, k)) if *b != bucket || *k != key => {
                    return Err(ResourceError::PathCollision {
                        name: name.clone(),
                        other: other.to_string(),
                        path,
                    });
                }
                Some(_) => {}
                None => {
                    seen.insert(path, (name.as_str(), bucket, key));
                }
            }
        }
        Ok(())
    }

    fn acquire_one(&self, model: &str, name: &str, uri: &str) -> Result<String, ResourceError> {
        let (bucket, key) = match ResourceUri::parse(uri) {
            Ok(ResourceUri::Literal(value)) => return Ok(value),
            Ok(ResourceUri::Blob { bucket, key }) => (bucket, key),
            Err(reason) => {
                return Err(ResourceError::InvalidUri {
                    name: name.to_string(),
                    uri: uri.to_string(),
                    reason,
                })
            }
        };
        let store = self.store.ok_or_else(|| ResourceError::NoBlobStore {
            name: name.to_string(),
            uri: uri.to_string(),
        })?;

        let dest = self.local_path(model, &key);
        let destination_error = |source: io::Error| ResourceError::Destination {
            name: name.to_string(),
            uri: uri.to_string(),
            source,
        };
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(destination_error)?;
        }

        info!("[RESOURCES] Downloading resource '{name}' from {uri}");
        // Fetch into a sibling .part file and rename, so `dest` only ever
        // holds a complete object.
        let part = part_path(&dest);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match store.fetch(&bucket, &key, &part) {
                Ok(()) => {
                    fs::rename(&part, &dest).map_err(destination_error)?;
                    info!("[RESOURCES] Resource '{name}' stored at {}", dest.display());
                    return Ok(dest.display().to_string());
                }
                Err(FetchError::Transient(cause)) if attempt <= self.retry.max_retries => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        "[RESOURCES] Download of '{name}' failed (attempt {attempt}): {cause}; retrying in {delay:?}"
                    );
                    thread::sleep(delay);
                }
                Err(FetchError::Transient(cause) | FetchError::Permanent(cause)) => {
                    let _ = fs::remove_file(&part);
                    return Err(ResourceError::Download {
                        name: name.to_string(),
                        uri: uri.to_string(),
                        attempts: attempt,
                        cause,
                    });
                }
            }
        }
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}
