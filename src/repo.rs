//! Repository: registry bootstrap, collection lifecycle,
//! synchronization and garbage collection.
//!
//! The registry is itself a collection, resident at the well-known
//! folder `hashed_path(Digest::ZERO)`. Its `"collection"` and
//! `"archive"` sub-series list the user visible collections; their
//! paths derive from those labels, so a fresh repo needs no bootstrap
//! write and is fully described by its object store.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Error;
use serde::{Deserialize, Serialize};

use crate::changelog::Revision;
use crate::collection::Collection;
use crate::digest::{hashed_path, Digest};
use crate::error::StoreError;
use crate::frame::{Column, Frame, Value};
use crate::pod::Pod;
use crate::schema::Schema;
use crate::series::{ReadOptions, Series};
use crate::tools::ParallelHandler;

/// Worker pool width for bulk pulls and the GC sweep.
const POOL_WORKERS: usize = 8;

pub const COLLECTION_SERIES: &str = "collection";
pub const ARCHIVE_SERIES: &str = "archive";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    Active,
    Archive,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Active => "active",
            Mode::Archive => "archive",
        }
    }

    fn series_label(&self) -> &'static str {
        match self {
            Mode::Active => COLLECTION_SERIES,
            Mode::Archive => ARCHIVE_SERIES,
        }
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(mode: &str) -> Result<Self, Error> {
        match mode {
            "active" => Ok(Mode::Active),
            "archive" => Ok(Mode::Archive),
            other => Err(StoreError::UnexpectedMode(other.to_string()).into()),
        }
    }
}

/// Registry row payload, tagged by mode.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum CollectionMeta {
    Active { schema: Schema, path: String },
    Archive { schema: Schema, path: String },
}

impl CollectionMeta {
    fn new(mode: Mode, schema: Schema, path: String) -> Self {
        match mode {
            Mode::Active => CollectionMeta::Active { schema, path },
            Mode::Archive => CollectionMeta::Archive { schema, path },
        }
    }

    pub fn schema(&self) -> &Schema {
        match self {
            CollectionMeta::Active { schema, .. } => schema,
            CollectionMeta::Archive { schema, .. } => schema,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            CollectionMeta::Active { path, .. } => path,
            CollectionMeta::Archive { path, .. } => path,
        }
    }
}

/// A storage location and the collections it hosts.
pub struct Repo {
    pod: Pod,
    registry: Collection,
}

impl Repo {
    pub fn new(uri: &str) -> Result<Self, Error> {
        Ok(Self::with_pod(Pod::from_uri(uri)?))
    }

    pub fn memory() -> Self {
        Self::with_pod(Pod::memory())
    }

    pub fn with_pod(pod: Pod) -> Self {
        let folder = hashed_path(&Digest::ZERO);
        let registry = Collection::new("registry", &Schema::kv(), pod.cd(&folder), pod.clone());
        Repo { pod, registry }
    }

    pub fn pod(&self) -> &Pod {
        &self.pod
    }

    pub fn registry(&self) -> &Collection {
        &self.registry
    }

    fn registry_series(&self, mode: Mode) -> Series {
        self.registry
            .series_unchecked(mode.series_label(), &Schema::kv())
    }

    pub fn ls(&self) -> Result<Vec<String>, Error> {
        let frame = self.registry_series(Mode::Active).read()?;
        match frame.column("label") {
            Some(Column::Str(labels)) => Ok(labels.clone()),
            _ => Ok(Vec::new()),
        }
    }

    /// The repository's own history: revisions of the registry's
    /// collection series.
    pub fn revisions(&self) -> Result<Vec<Revision>, Error> {
        self.registry_series(Mode::Active).revisions()
    }

    fn folder_digest(label: &str, mode: Mode) -> Digest {
        let digest = Digest::compute(label.as_bytes());
        match mode {
            Mode::Active => digest,
            Mode::Archive => {
                // archive and active of one label occupy distinct
                // subtrees
                let mut key = digest.to_hex().into_bytes();
                key.extend_from_slice(ARCHIVE_SERIES.as_bytes());
                Digest::compute(&key)
            }
        }
    }

    fn reify(&self, label: &str, meta: &CollectionMeta) -> Collection {
        Collection::new(label, meta.schema(), self.pod.cd(meta.path()), self.pod.clone())
    }

    /// Register collections under the given labels (one registry
    /// write). Labels must come sorted; there is no implicit existence
    /// check - a later lookup sees the last written row.
    pub fn create_collection(
        &self,
        schema: &Schema,
        labels: &[&str],
    ) -> Result<Vec<Collection>, Error> {
        self.create_collection_mode(schema, labels, Mode::Active)
    }

    pub fn create_collection_mode(
        &self,
        schema: &Schema,
        labels: &[&str],
        mode: Mode,
    ) -> Result<Vec<Collection>, Error> {
        let mut frame = Frame::new(&Schema::kv());
        let mut reified = Vec::new();
        for label in labels {
            let label = label.trim();
            if label.is_empty() {
                return Err(StoreError::InvalidLabel(label.to_string()).into());
            }
            let path = hashed_path(&Self::folder_digest(label, mode));
            let meta = CollectionMeta::new(mode, schema.clone(), path);
            frame.push_row(&[
                Value::Str(label.to_string()),
                Value::Bytes(serde_json::to_vec(&meta)?),
            ])?;
            reified.push(self.reify(label, &meta));
        }
        if reified.is_empty() {
            return Ok(reified);
        }
        self.registry_series(mode).write(&frame)?;
        Ok(reified)
    }

    pub fn create_collection_one(&self, schema: &Schema, label: &str) -> Result<Collection, Error> {
        let mut collections = self.create_collection(schema, &[label])?;
        Ok(collections.remove(0))
    }

    /// Create-or-return shortcut.
    pub fn ensure_collection(&self, schema: &Schema, label: &str) -> Result<Collection, Error> {
        match self.collection(label)? {
            Some(collection) => Ok(collection),
            None => self.create_collection_one(schema, label),
        }
    }

    pub fn collection(&self, label: &str) -> Result<Option<Collection>, Error> {
        self.collection_mode(label, Mode::Active)
    }

    pub fn collection_mode(&self, label: &str, mode: Mode) -> Result<Option<Collection>, Error> {
        let key = vec![Value::Str(label.to_string())];
        let opts = ReadOptions::new().start(key.clone()).end(key);
        let frame = self.registry_series(mode).read_with(&opts)?;
        if frame.is_empty() {
            return Ok(None);
        }
        let meta = match frame.column("meta") {
            Some(Column::Bytes(metas)) => metas[metas.len() - 1].clone(),
            _ => return Err(StoreError::Codec("malformed registry row".to_string()).into()),
        };
        let meta: CollectionMeta = serde_json::from_slice(&meta)?;
        Ok(Some(self.reify(label, &meta)))
    }

    /// Reify every visible registry row, optionally restricted to one
    /// label.
    pub fn search(&self, label: Option<&str>, mode: Mode) -> Result<Vec<Collection>, Error> {
        let series = self.registry_series(mode);
        let frame = match label {
            Some(label) => {
                let key = vec![Value::Str(label.to_string())];
                series.read_with(&ReadOptions::new().start(key.clone()).end(key))?
            }
            None => series.read()?,
        };

        let labels = match frame.column("label") {
            Some(Column::Str(labels)) => labels.clone(),
            _ => return Ok(Vec::new()),
        };
        let metas = match frame.column("meta") {
            Some(Column::Bytes(metas)) => metas.clone(),
            _ => return Ok(Vec::new()),
        };

        let mut collections = Vec::new();
        for (label, meta) in labels.iter().zip(metas.iter()) {
            let meta: CollectionMeta = serde_json::from_slice(meta)?;
            collections.push(self.reify(label, &meta));
        }
        Ok(collections)
    }

    /// Idempotently register an archive-mode entry for the collection.
    pub fn archive(&self, collection: &Collection) -> Result<Collection, Error> {
        if let Some(existing) = self.collection_mode(collection.label(), Mode::Archive)? {
            return Ok(existing);
        }
        let mut created = self.create_collection_mode(
            collection.schema(),
            &[collection.label()],
            Mode::Archive,
        )?;
        Ok(created.remove(0))
    }

    /// Tombstone the registry rows, then drop each collection's store
    /// subtree. Unknown labels are skipped.
    pub fn delete(&self, labels: &[&str]) -> Result<(), Error> {
        let mut doomed = Vec::new();
        let mut keys = Vec::new();
        for label in labels {
            match self.collection(label)? {
                Some(collection) => {
                    doomed.push(collection);
                    keys.push(vec![Value::Str((*label).to_string())]);
                }
                None => continue,
            }
        }
        if keys.is_empty() {
            return Ok(());
        }
        self.registry_series(Mode::Active).delete(&keys)?;
        for collection in doomed {
            collection.pod().rm("", true, true)?;
        }
        Ok(())
    }

    fn pull_registry(&self, remote: &Repo) -> Result<(), Error> {
        self.registry.pull(&remote.registry)?;
        for mode in &[Mode::Active, Mode::Archive] {
            self.registry_series(*mode)
                .pull(&remote.registry_series(*mode))?;
        }
        Ok(())
    }

    /// Pull collections from `remote` (all of them when `labels` is
    /// empty). The registry is synchronized first; collection data is
    /// then copied on a bounded worker pool, one collection per task.
    pub fn pull(&self, remote: &Repo, labels: &[&str]) -> Result<(), Error> {
        self.pull_registry(remote)?;

        // label maps come from the now synchronized registry
        let local_map: HashMap<String, Collection> = self
            .search(None, Mode::Active)?
            .into_iter()
            .map(|collection| (collection.label().to_string(), collection))
            .collect();
        let remote_map: HashMap<String, Collection> = remote
            .search(None, Mode::Active)?
            .into_iter()
            .map(|collection| (collection.label().to_string(), collection))
            .collect();
        let requested: Vec<String> = if labels.is_empty() {
            let mut all: Vec<String> = remote_map.keys().cloned().collect();
            all.sort();
            all
        } else {
            labels.iter().map(|label| (*label).to_string()).collect()
        };

        let pool = ParallelHandler::new(
            "collection pull",
            POOL_WORKERS,
            |(local, remote): (Collection, Collection)| {
                log::info!("sync collection: {}", local.label());
                local.pull(&remote)?;
                Ok(())
            },
        );

        for label in &requested {
            let remote_collection = match remote_map.get(label) {
                Some(collection) => collection.clone(),
                None => return Err(StoreError::NotFound(label.clone()).into()),
            };
            let local_collection = match local_map.get(label) {
                Some(local) => {
                    if local.schema() != remote_collection.schema() {
                        return Err(StoreError::IncompatibleSchema(label.clone()).into());
                    }
                    local.clone()
                }
                None => self.create_collection_one(remote_collection.schema(), label)?,
            };
            pool.send((local_collection, remote_collection))?;
        }
        pool.complete()
    }

    /// Push is pull with the roles swapped - the side that has the
    /// data drives the copy.
    pub fn push(&self, remote: &Repo, labels: &[&str]) -> Result<(), Error> {
        remote.pull(self, labels)
    }

    pub fn merge(&self) -> Result<(), Error> {
        self.registry_series(Mode::Active).merge()?;
        self.registry_series(Mode::Archive).merge()
    }

    /// Mark and sweep unreferenced blobs; returns the number of
    /// deleted keys.
    pub fn gc(&self) -> Result<usize, Error> {
        let mut active: HashSet<String> = HashSet::new();
        active.extend(self.registry.digests()?);
        active.extend(self.registry_series(Mode::Active).digests()?);
        active.extend(self.registry_series(Mode::Archive).digests()?);
        for mode in &[Mode::Active, Mode::Archive] {
            for collection in self.search(None, *mode)? {
                active.extend(collection.digests()?);
            }
        }

        let active = Arc::new(active);
        let deleted = Arc::new(AtomicUsize::new(0));

        let pod = self.pod.clone();
        let active_set = Arc::clone(&active);
        let counter = Arc::clone(&deleted);
        let pool = ParallelHandler::new("gc sweep", POOL_WORKERS, move |folder: String| {
            let mut count = 0;
            for name in pod.walk(&folder, 2)? {
                let digest = format!("{}{}", folder, name.replace('/', ""));
                if !active_set.contains(&digest) {
                    // racing deletes are fine
                    pod.rm(&format!("{}/{}", folder, name), false, true)?;
                    count += 1;
                }
            }
            counter.fetch_add(count, Ordering::SeqCst);
            Ok(())
        });

        for folder in self.pod.ls("")? {
            pool.send(folder)?;
        }
        pool.complete()?;

        let count = deleted.load(Ordering::SeqCst);
        log::info!("garbage collection deleted {} blob(s)", count);
        Ok(count)
    }
}

#[test]
fn test_mode_from_str() {
    assert_eq!("active".parse::<Mode>().unwrap(), Mode::Active);
    assert_eq!("archive".parse::<Mode>().unwrap(), Mode::Archive);

    let err = "frozen".parse::<Mode>().unwrap_err();
    match err.downcast_ref::<StoreError>() {
        Some(StoreError::UnexpectedMode(mode)) => assert_eq!(mode, "frozen"),
        _ => panic!("expected UnexpectedMode"),
    }
}

#[test]
fn test_collection_meta_tagging() {
    let schema = Schema::kv();
    let meta = CollectionMeta::new(Mode::Archive, schema.clone(), "ab/cd".to_string());
    let data = serde_json::to_vec(&meta).unwrap();
    assert!(String::from_utf8_lossy(&data).contains("\"mode\":\"archive\""));

    let copy: CollectionMeta = serde_json::from_slice(&data).unwrap();
    assert_eq!(copy.schema(), &schema);
    assert_eq!(copy.path(), "ab/cd");
}

#[test]
fn test_folder_digest_modes() {
    let active = Repo::folder_digest("temperature", Mode::Active);
    let archive = Repo::folder_digest("temperature", Mode::Archive);
    assert_ne!(active, archive);
    assert_eq!(active, Digest::compute(b"temperature"));
}
