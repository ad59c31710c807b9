//! In-process object store backend.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use anyhow::Error;

use crate::error::StoreError;

use super::Backend;

/// Mapping from path to byte buffer; the `BTreeMap` keeps enumeration
/// sorted.
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend {
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    fn scope(prefix: &str) -> String {
        if prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", prefix)
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Vec<u8>, Error> {
        let entries = self.entries.read().unwrap();
        match entries.get(key) {
            Some(data) => Ok(data.clone()),
            None => Err(StoreError::NotFound(key.to_string()).into()),
        }
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<(), Error> {
        let mut entries = self.entries.write().unwrap();
        entries.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn rm(&self, key: &str, recursive: bool) -> Result<(), Error> {
        let mut entries = self.entries.write().unwrap();
        if recursive {
            let scope = Self::scope(key);
            let doomed: Vec<String> = entries
                .keys()
                .filter(|other| *other == key || other.starts_with(&scope))
                .cloned()
                .collect();
            if doomed.is_empty() {
                return Err(StoreError::NotFound(key.to_string()).into());
            }
            for key in doomed {
                entries.remove(&key);
            }
            Ok(())
        } else {
            match entries.remove(key) {
                Some(_) => Ok(()),
                None => Err(StoreError::NotFound(key.to_string()).into()),
            }
        }
    }

    fn ls(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let scope = Self::scope(prefix);
        let entries = self.entries.read().unwrap();
        let mut names = BTreeSet::new();
        for key in entries.keys() {
            if let Some(rest) = key.strip_prefix(&scope) {
                if let Some(name) = rest.split('/').next() {
                    if !name.is_empty() {
                        names.insert(name.to_string());
                    }
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    fn walk(&self, prefix: &str, max_depth: usize) -> Result<Vec<String>, Error> {
        let scope = Self::scope(prefix);
        let entries = self.entries.read().unwrap();
        let mut paths = Vec::new();
        for key in entries.keys() {
            if let Some(rest) = key.strip_prefix(&scope) {
                if !rest.is_empty() && rest.split('/').count() <= max_depth {
                    paths.push(rest.to_string());
                }
            }
        }
        Ok(paths)
    }

    fn exists(&self, key: &str) -> Result<bool, Error> {
        let entries = self.entries.read().unwrap();
        Ok(entries.contains_key(key))
    }
}

#[test]
fn test_memory_backend() {
    let backend = MemoryBackend::new();
    backend.put("aa/one", b"1").unwrap();
    backend.put("aa/bb/two", b"2").unwrap();
    backend.put("cc", b"3").unwrap();

    assert_eq!(backend.get("aa/one").unwrap(), b"1");
    assert!(backend.get("aa").is_err());
    assert!(backend.exists("cc").unwrap());

    assert_eq!(backend.ls("").unwrap(), vec!["aa", "cc"]);
    assert_eq!(backend.ls("aa").unwrap(), vec!["bb", "one"]);
    assert_eq!(backend.walk("aa", 1).unwrap(), vec!["one"]);
    assert_eq!(backend.walk("aa", 2).unwrap(), vec!["bb/two", "one"]);

    backend.rm("aa", true).unwrap();
    assert!(!backend.exists("aa/one").unwrap());
    assert!(backend.exists("cc").unwrap());
    assert!(backend.rm("aa", true).is_err());
}
