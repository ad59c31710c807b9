//! Local directory object store backend.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use walkdir::WalkDir;

use crate::error::StoreError;
use crate::tools::fs::replace_file;

use super::Backend;

pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, Error> {
        let root = root.as_ref().to_owned();
        fs::create_dir_all(&root)
            .map_err(|err| format_err!("unable to create store root {:?} - {}", root, err))?;
        Ok(FileBackend { root })
    }

    fn full(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in key.split('/').filter(|part| !part.is_empty()) {
            path.push(part);
        }
        path
    }

    fn not_found(key: &str, err: io::Error) -> Error {
        if err.kind() == io::ErrorKind::NotFound {
            StoreError::NotFound(key.to_string()).into()
        } else {
            err.into()
        }
    }
}

impl Backend for FileBackend {
    fn get(&self, key: &str) -> Result<Vec<u8>, Error> {
        fs::read(self.full(key)).map_err(|err| Self::not_found(key, err))
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<(), Error> {
        let path = self.full(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        replace_file(&path, data)
    }

    fn rm(&self, key: &str, recursive: bool) -> Result<(), Error> {
        let path = self.full(key);
        let metadata = fs::metadata(&path).map_err(|err| Self::not_found(key, err))?;
        if metadata.is_dir() {
            if !recursive {
                bail!("'{}' is a directory - recursive removal required", key);
            }
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path).map_err(|err| Self::not_found(key, err))?;
        }
        Ok(())
    }

    fn ls(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let path = self.full(prefix);
        let dir = match fs::read_dir(&path) {
            Ok(dir) => dir,
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut names = Vec::new();
        for entry in dir {
            let entry = entry?;
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(name) => bail!("non utf-8 store entry {:?}", name),
            }
        }
        names.sort();
        Ok(names)
    }

    fn walk(&self, prefix: &str, max_depth: usize) -> Result<Vec<String>, Error> {
        let base = self.full(prefix);
        if !base.is_dir() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in WalkDir::new(&base).min_depth(1).max_depth(max_depth) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&base)
                .map_err(|err| format_err!("walk outside of base dir - {}", err))?;
            let mut parts = Vec::new();
            for part in rel.components() {
                match part.as_os_str().to_str() {
                    Some(part) => parts.push(part.to_string()),
                    None => bail!("non utf-8 store entry {:?}", rel),
                }
            }
            paths.push(parts.join("/"));
        }
        paths.sort();
        Ok(paths)
    }

    fn exists(&self, key: &str) -> Result<bool, Error> {
        Ok(self.full(key).exists())
    }
}

#[test]
fn test_file_backend() {
    let mut path = std::fs::canonicalize(".").unwrap();
    path.push(".testdir-file-backend");

    if let Err(_e) = std::fs::remove_dir_all(&path) { /* ignore */ }

    let backend = FileBackend::new(&path).unwrap();
    backend.put("aa/one", b"1").unwrap();
    backend.put("aa/bb/two", b"2").unwrap();

    assert_eq!(backend.get("aa/one").unwrap(), b"1");
    assert!(backend.get("missing").is_err());
    assert!(backend.exists("aa/bb/two").unwrap());

    assert_eq!(backend.ls("aa").unwrap(), vec!["bb", "one"]);
    assert_eq!(backend.walk("aa", 1).unwrap(), vec!["one"]);
    assert_eq!(backend.walk("aa", 2).unwrap(), vec!["bb/two", "one"]);

    // put is an atomic replace
    backend.put("aa/one", b"updated").unwrap();
    assert_eq!(backend.get("aa/one").unwrap(), b"updated");

    backend.rm("aa", true).unwrap();
    assert!(!backend.exists("aa/one").unwrap());

    if let Err(_e) = std::fs::remove_dir_all(&path) { /* ignore */ }
}
