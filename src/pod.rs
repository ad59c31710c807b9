//! Pluggable object store (POD): a uniform blob interface over
//! heterogeneous backends with composable caching.
//!
//! Paths are forward-slash separated keys; `put` is atomic per key and
//! blobs are content-addressed, so caches need no TTL and concurrent
//! writers of the same key always write identical bytes.

pub mod file;
pub mod memory;
pub mod s3;

use std::sync::Arc;

use anyhow::{bail, Error};

use crate::error::is_not_found;

/// Blob storage contract implemented by every backend.
pub trait Backend: Send + Sync {
    fn get(&self, key: &str) -> Result<Vec<u8>, Error>;
    fn put(&self, key: &str, data: &[u8]) -> Result<(), Error>;
    fn rm(&self, key: &str, recursive: bool) -> Result<(), Error>;
    /// Names directly below `prefix` (files and sub-directories).
    fn ls(&self, prefix: &str) -> Result<Vec<String>, Error>;
    /// Relative file paths below `prefix`, at most `max_depth` levels
    /// deep.
    fn walk(&self, prefix: &str, max_depth: usize) -> Result<Vec<String>, Error>;
    fn exists(&self, key: &str) -> Result<bool, Error>;
}

/// Cache in front of a backing store.
///
/// Enumeration always goes to the backing store - the cache is not
/// authoritative for `ls`/`walk`.
struct CacheBackend {
    cache: Arc<dyn Backend>,
    backing: Arc<dyn Backend>,
}

impl Backend for CacheBackend {
    fn get(&self, key: &str) -> Result<Vec<u8>, Error> {
        match self.cache.get(key) {
            Ok(data) => return Ok(data),
            Err(err) if is_not_found(&err) => (),
            Err(err) => return Err(err),
        }
        let data = self.backing.get(key)?;
        self.cache.put(key, &data)?;
        Ok(data)
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<(), Error> {
        // the backing store is the commit point
        self.backing.put(key, data)?;
        self.cache.put(key, data)
    }

    fn rm(&self, key: &str, recursive: bool) -> Result<(), Error> {
        let result = self.backing.rm(key, recursive);
        match self.cache.rm(key, recursive) {
            Ok(()) => (),
            Err(err) if is_not_found(&err) => (),
            Err(err) => return Err(err),
        }
        result
    }

    fn ls(&self, prefix: &str) -> Result<Vec<String>, Error> {
        self.backing.ls(prefix)
    }

    fn walk(&self, prefix: &str, max_depth: usize) -> Result<Vec<String>, Error> {
        self.backing.walk(prefix, max_depth)
    }

    fn exists(&self, key: &str) -> Result<bool, Error> {
        self.backing.exists(key)
    }
}

fn join(prefix: &str, path: &str) -> String {
    let path = path.trim_matches('/');
    if prefix.is_empty() {
        path.to_string()
    } else if path.is_empty() {
        prefix.to_string()
    } else {
        format!("{}/{}", prefix, path)
    }
}

/// Cheap cloneable handle on a backend, scoped to a key prefix.
#[derive(Clone)]
pub struct Pod {
    backend: Arc<dyn Backend>,
    prefix: String,
}

impl Pod {
    pub fn with_backend(backend: Arc<dyn Backend>) -> Self {
        Pod {
            backend,
            prefix: String::new(),
        }
    }

    /// In-process store; life equals process life.
    pub fn memory() -> Self {
        Pod::with_backend(Arc::new(memory::MemoryBackend::new()))
    }

    /// Parse a store URI: `memory://`, `file://<path>`, a bare local
    /// path, or `s3://bucket[/prefix]`. A `+` chains stores cache first:
    /// `memory://+s3://bucket`.
    pub fn from_uri(uri: &str) -> Result<Self, Error> {
        let mut backend: Option<Arc<dyn Backend>> = None;
        for part in uri.split('+').rev() {
            let layer = Self::backend_from_uri(part)?;
            backend = Some(match backend {
                None => layer,
                Some(backing) => Arc::new(CacheBackend {
                    cache: layer,
                    backing,
                }),
            });
        }
        match backend {
            Some(backend) => Ok(Pod::with_backend(backend)),
            None => bail!("empty store uri"),
        }
    }

    fn backend_from_uri(uri: &str) -> Result<Arc<dyn Backend>, Error> {
        if uri == "memory://" {
            return Ok(Arc::new(memory::MemoryBackend::new()));
        }
        if let Some(path) = uri.strip_prefix("file://") {
            return Ok(Arc::new(file::FileBackend::new(path)?));
        }
        if let Some(location) = uri.strip_prefix("s3://") {
            let mut parts = location.splitn(2, '/');
            let bucket = parts.next().unwrap_or("");
            if bucket.is_empty() {
                bail!("missing bucket in s3 uri '{}'", uri);
            }
            let root = parts.next().unwrap_or("");
            return Ok(Arc::new(s3::S3Backend::new(bucket, root)?));
        }
        if uri.contains("://") {
            bail!("unsupported store uri '{}'", uri);
        }
        // bare paths are local directories
        Ok(Arc::new(file::FileBackend::new(uri)?))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// A handle scoped to a sub-directory of this one.
    pub fn cd(&self, sub: &str) -> Pod {
        Pod {
            backend: Arc::clone(&self.backend),
            prefix: join(&self.prefix, sub),
        }
    }

    pub fn get(&self, path: &str) -> Result<Vec<u8>, Error> {
        self.backend.get(&join(&self.prefix, path))
    }

    pub fn put(&self, path: &str, data: &[u8]) -> Result<(), Error> {
        self.backend.put(&join(&self.prefix, path), data)
    }

    pub fn exists(&self, path: &str) -> Result<bool, Error> {
        self.backend.exists(&join(&self.prefix, path))
    }

    pub fn rm(&self, path: &str, recursive: bool, missing_ok: bool) -> Result<(), Error> {
        match self.backend.rm(&join(&self.prefix, path), recursive) {
            Ok(()) => Ok(()),
            Err(err) if missing_ok && is_not_found(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn ls(&self, prefix: &str) -> Result<Vec<String>, Error> {
        self.backend.ls(&join(&self.prefix, prefix))
    }

    pub fn walk(&self, prefix: &str, max_depth: usize) -> Result<Vec<String>, Error> {
        self.backend.walk(&join(&self.prefix, prefix), max_depth)
    }
}

#[test]
fn test_pod_scoping() {
    let pod = Pod::memory();
    pod.put("aa/bb/one", b"1").unwrap();
    pod.put("aa/two", b"2").unwrap();

    let sub = pod.cd("aa");
    assert_eq!(sub.get("two").unwrap(), b"2");
    assert_eq!(sub.cd("bb").get("one").unwrap(), b"1");
    assert_eq!(sub.prefix(), "aa");

    assert_eq!(pod.ls("").unwrap(), vec!["aa".to_string()]);
    assert_eq!(
        sub.ls("").unwrap(),
        vec!["bb".to_string(), "two".to_string()]
    );
    assert_eq!(pod.walk("aa", 1).unwrap(), vec!["two".to_string()]);
    assert_eq!(
        pod.walk("aa", 2).unwrap(),
        vec!["bb/one".to_string(), "two".to_string()]
    );
}

#[test]
fn test_pod_missing_ok() {
    let pod = Pod::memory();
    assert!(pod.rm("nope", false, false).is_err());
    pod.rm("nope", false, true).unwrap();

    let err = pod.get("nope").unwrap_err();
    assert!(is_not_found(&err));
}

#[test]
fn test_cache_composition() {
    let cache = Arc::new(memory::MemoryBackend::new());
    let backing = Arc::new(memory::MemoryBackend::new());
    backing.put("key", b"data").unwrap();

    let pod = Pod::with_backend(Arc::new(CacheBackend {
        cache: cache.clone(),
        backing: backing.clone(),
    }));

    // miss fills the cache
    assert!(cache.get("key").is_err());
    assert_eq!(pod.get("key").unwrap(), b"data");
    assert_eq!(cache.get("key").unwrap(), b"data");

    // put writes both layers
    pod.put("other", b"x").unwrap();
    assert_eq!(cache.get("other").unwrap(), b"x");
    assert_eq!(backing.get("other").unwrap(), b"x");

    // rm invalidates the cache entry
    pod.rm("key", false, false).unwrap();
    assert!(backing.get("key").is_err());
    assert!(cache.get("key").is_err());

    // enumeration is not served from the cache
    cache.put("stray", b"s").unwrap();
    assert_eq!(pod.ls("").unwrap(), vec!["other".to_string()]);
}

#[test]
fn test_from_uri() {
    assert!(Pod::from_uri("memory://").is_ok());
    assert!(Pod::from_uri("memory://+memory://").is_ok());
    assert!(Pod::from_uri("gopher://x").is_err());
    assert!(Pod::from_uri("s3://").is_err());
}
