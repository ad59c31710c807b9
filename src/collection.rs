//! A named group of series sharing a schema namespace.
//!
//! A collection occupies one store folder. Its *index series* (kv
//! layout) lives directly at that folder and maps each sub-series
//! label to a [SeriesMeta]; the sub-series changelogs live below the
//! folder at paths derived from their label digests.

use std::collections::HashSet;

use anyhow::Error;
use serde::{Deserialize, Serialize};

use crate::changelog::Revision;
use crate::digest::{hashed_path, Digest};
use crate::error::{is_not_found, StoreError};
use crate::frame::{Column, Frame, Value};
use crate::pod::Pod;
use crate::schema::Schema;
use crate::series::{ReadOptions, Series};

/// Index row payload: where a sub-series lives and what it looks like.
#[derive(Clone, Serialize, Deserialize)]
pub struct SeriesMeta {
    pub schema: Schema,
    pub path: String,
}

#[derive(Clone)]
pub struct Collection {
    label: String,
    schema: Schema,
    /// The collection folder.
    pod: Pod,
    /// The repo root, where payload blobs live.
    store: Pod,
}

impl Collection {
    pub(crate) fn new(label: &str, schema: &Schema, pod: Pod, store: Pod) -> Self {
        Collection {
            label: label.to_string(),
            schema: schema.clone(),
            pod,
            store,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The namespace default schema, as recorded in the registry.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub(crate) fn pod(&self) -> &Pod {
        &self.pod
    }

    /// Store path of the collection folder.
    pub fn path(&self) -> &str {
        self.pod.prefix()
    }

    fn index_series(&self) -> Series {
        Series::new("index", &Schema::kv(), self.pod.clone(), self.store.clone())
    }

    fn series_path(label: &str) -> String {
        hashed_path(&Digest::compute(label.as_bytes()))
    }

    /// Access a series at its derived path without consulting the
    /// index. This is how the registry reaches its own sub-series
    /// before anything was ever written (bootstrap performs no I/O).
    pub(crate) fn series_unchecked(&self, label: &str, schema: &Schema) -> Series {
        let path = Self::series_path(label);
        Series::new(label, schema, self.pod.cd(&path), self.store.clone())
    }

    pub fn create_series(&self, schema: &Schema, label: &str) -> Result<Series, Error> {
        let label = label.trim();
        if label.is_empty() {
            return Err(StoreError::InvalidLabel(label.to_string()).into());
        }

        let path = Self::series_path(label);
        let meta = SeriesMeta {
            schema: schema.clone(),
            path: path.clone(),
        };
        let mut frame = Frame::new(&Schema::kv());
        frame.push_row(&[
            Value::Str(label.to_string()),
            Value::Bytes(serde_json::to_vec(&meta)?),
        ])?;
        self.index_series().write(&frame)?;

        Ok(Series::new(label, schema, self.pod.cd(&path), self.store.clone()))
    }

    /// Look a series up at the visible index tip; the last written row
    /// for a label wins.
    pub fn series(&self, label: &str) -> Result<Series, Error> {
        let key = vec![Value::Str(label.to_string())];
        let opts = ReadOptions::new().start(key.clone()).end(key);
        let frame = self.index_series().read_with(&opts)?;
        if frame.is_empty() {
            return Err(StoreError::NotFound(format!("{}/{}", self.label, label)).into());
        }

        let meta = match frame.column("meta") {
            Some(Column::Bytes(metas)) => metas[metas.len() - 1].clone(),
            _ => return Err(StoreError::Codec("malformed index row".to_string()).into()),
        };
        let meta: SeriesMeta = serde_json::from_slice(&meta)?;
        Ok(Series::new(
            label,
            &meta.schema,
            self.pod.cd(&meta.path),
            self.store.clone(),
        ))
    }

    pub fn ls(&self) -> Result<Vec<String>, Error> {
        let frame = self.index_series().read()?;
        match frame.column("label") {
            Some(Column::Str(labels)) => Ok(labels.clone()),
            _ => Ok(Vec::new()),
        }
    }

    /// The collection's own history: revisions of its index series.
    pub fn revisions(&self) -> Result<Vec<Revision>, Error> {
        self.index_series().revisions()
    }

    fn all_series(&self) -> Result<Vec<Series>, Error> {
        self.ls()?
            .iter()
            .map(|label| self.series(label))
            .collect()
    }

    /// Squash every sub-series and the index down to one revision
    /// each.
    pub fn squash(&self) -> Result<(), Error> {
        for series in self.all_series()? {
            series.squash()?;
        }
        self.index_series().squash()
    }

    pub fn merge(&self) -> Result<(), Error> {
        for series in self.all_series()? {
            series.merge()?;
        }
        self.index_series().merge()
    }

    /// Digest strings protecting this collection from the GC sweep.
    pub fn digests(&self) -> Result<HashSet<String>, Error> {
        let mut digests: HashSet<String> = self.index_series().digests()?.into_iter().collect();
        for series in self.all_series()? {
            digests.extend(series.digests()?);
        }
        Ok(digests)
    }

    /// Tombstone index rows and drop the sub-series folders.
    pub fn delete_series(&self, labels: &[&str]) -> Result<(), Error> {
        let mut doomed = Vec::new();
        let mut keys = Vec::new();
        for label in labels {
            match self.series(label) {
                Ok(series) => doomed.push(series),
                Err(err) if is_not_found(&err) => continue,
                Err(err) => return Err(err),
            }
            keys.push(vec![Value::Str((*label).to_string())]);
        }
        if keys.is_empty() {
            return Ok(());
        }
        self.index_series().delete(&keys)?;
        for series in doomed {
            series.changelog().pod().rm("", true, true)?;
        }
        Ok(())
    }

    /// Copy everything present remotely but missing locally: the index
    /// first, then every remote sub-series.
    pub fn pull(&self, remote: &Collection) -> Result<usize, Error> {
        let mut copied = self.index_series().pull(&remote.index_series())?;
        for label in remote.ls()? {
            let remote_series = remote.series(&label)?;
            let local_series = self.series_unchecked(&label, remote_series.schema());
            copied += local_series.pull(&remote_series)?;
        }
        Ok(copied)
    }
}
