//! A typed, time-ordered row sequence backed by one changelog.

use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;

use anyhow::{bail, Error};

use crate::changelog::{Changelog, Revision};
use crate::digest::{hashed_path, Digest};
use crate::error::StoreError;
use crate::frame::{Frame, Value};
use crate::pod::Pod;
use crate::schema::Schema;

/// Upper row count per encoded frame chunk.
pub const WRITE_CHUNK_ROWS: usize = 65536;

/// Read filters: an inclusive index range plus optional revision
/// cutoffs. `before` keeps revisions strictly earlier than the named
/// one in walk order, `after` keeps the named revision and everything
/// later.
#[derive(Clone, Default)]
pub struct ReadOptions {
    pub start: Option<Vec<Value>>,
    pub end: Option<Vec<Value>>,
    pub before: Option<String>,
    pub after: Option<String>,
}

impl ReadOptions {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn start(mut self, start: Vec<Value>) -> Self {
        self.start = Some(start);
        self
    }

    pub fn end(mut self, end: Vec<Value>) -> Self {
        self.end = Some(end);
        self
    }

    pub fn before(mut self, revision_key: &str) -> Self {
        self.before = Some(revision_key.to_string());
        self
    }

    pub fn after(mut self, revision_key: &str) -> Self {
        self.after = Some(revision_key.to_string());
        self
    }
}

#[derive(Clone)]
pub struct Series {
    label: String,
    schema: Schema,
    changelog: Changelog,
    store: Pod,
}

impl Series {
    /// `pod` scopes the changelog prefix, `store` is the repo root
    /// where payload blobs live.
    pub(crate) fn new(label: &str, schema: &Schema, pod: Pod, store: Pod) -> Self {
        Series {
            label: label.to_string(),
            schema: schema.clone(),
            changelog: Changelog::new(pod),
            store,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn changelog(&self) -> &Changelog {
        &self.changelog
    }

    fn write_payloads(&self, frame: &Frame) -> Result<Vec<Digest>, Error> {
        let mut digests = Vec::new();
        for chunk in frame.chunks(WRITE_CHUNK_ROWS) {
            let data = chunk.encode()?;
            let digest = Digest::compute(&data);
            let path = hashed_path(&digest);
            if !self.store.exists(&path)? {
                self.store.put(&path, &data)?;
            }
            digests.push(digest);
        }
        Ok(digests)
    }

    /// Append a frame. Empty frames are no-ops; input must be sorted
    /// by index. Returns the revision key, which feeds the
    /// `before`/`after` read filters. Writing identical content twice
    /// yields the same key and no new revision.
    pub fn write(&self, frame: &Frame) -> Result<Option<String>, Error> {
        if frame.is_empty() {
            return Ok(None);
        }
        if frame.schema() != &self.schema {
            bail!("frame does not match series '{}' schema", self.label);
        }
        if !frame.is_sorted() {
            bail!("frame index is not sorted");
        }

        let digests = self.write_payloads(frame)?;
        let head = self.changelog.head()?;
        let start = frame.index_key(0);
        let end = frame.index_key(frame.len() - 1);
        let revision = self.changelog.commit(head.as_ref(), digests, start, end)?;
        Ok(Some(revision.key))
    }

    pub fn read(&self) -> Result<Frame, Error> {
        self.read_with(&ReadOptions::new())
    }

    /// Merge the changelog into one visible frame.
    ///
    /// Revisions are folded in walk order; each first masks its
    /// `[start, end]` interval, then inserts its rows. Later revisions
    /// therefore shadow earlier ones over the range they cover, and
    /// payload-less revisions act as tombstones.
    pub fn read_with(&self, opts: &ReadOptions) -> Result<Frame, Error> {
        if let (Some(start), Some(end)) = (&opts.start, &opts.end) {
            if start > end {
                return Ok(Frame::new(&self.schema));
            }
        }

        let mut revisions = self.changelog.walk()?;
        if let Some(ref after) = opts.after {
            match revisions.iter().position(|revision| &revision.key == after) {
                Some(pos) => {
                    revisions.drain(..pos);
                }
                None => return Err(StoreError::NotFound(after.clone()).into()),
            }
        }
        if let Some(ref before) = opts.before {
            match revisions.iter().position(|revision| &revision.key == before) {
                Some(pos) => revisions.truncate(pos),
                None => return Err(StoreError::NotFound(before.clone()).into()),
            }
        }

        let mut rows: BTreeMap<Vec<Value>, Vec<Value>> = BTreeMap::new();
        for revision in &revisions {
            if !revision.overlaps(opts.start.as_ref(), opts.end.as_ref()) {
                continue;
            }

            if revision.start <= revision.end {
                let doomed: Vec<Vec<Value>> = rows
                    .range((
                        Bound::Included(revision.start.clone()),
                        Bound::Included(revision.end.clone()),
                    ))
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in doomed {
                    rows.remove(&key);
                }
            }

            for digest in &revision.payload_digests {
                let data = self.store.get(&hashed_path(digest))?;
                let chunk = Frame::decode(&self.schema, &data)?;
                for row in 0..chunk.len() {
                    rows.insert(chunk.index_key(row), chunk.row(row));
                }
            }
        }

        let lo = match opts.start.clone() {
            Some(start) => Bound::Included(start),
            None => Bound::Unbounded,
        };
        let hi = match opts.end.clone() {
            Some(end) => Bound::Included(end),
            None => Bound::Unbounded,
        };

        let mut out = Frame::new(&self.schema);
        for (_, row) in rows.range((lo, hi)) {
            out.push_row(row)?;
        }
        Ok(out)
    }

    pub fn revisions(&self) -> Result<Vec<Revision>, Error> {
        self.changelog.walk()
    }

    /// Commit one payload-less masking revision (tombstone) per key.
    pub fn delete(&self, keys: &[Vec<Value>]) -> Result<(), Error> {
        let mut head = self.changelog.head()?;
        for key in keys {
            let revision =
                self.changelog
                    .commit(head.as_ref(), Vec::new(), key.clone(), key.clone())?;
            head = Some(revision);
        }
        Ok(())
    }

    /// Replace the whole history by a single summary revision.
    pub fn squash(&self) -> Result<(), Error> {
        self.flatten(false)
    }

    /// Like squash, but folded revisions stay parked under the archive
    /// folder.
    pub fn pack(&self) -> Result<(), Error> {
        self.flatten(true)
    }

    fn flatten(&self, keep_archive: bool) -> Result<(), Error> {
        let revisions = self.changelog.walk()?;
        if revisions.len() <= 1 {
            return Ok(());
        }

        let frame = self.read()?;
        let (payloads, start, end) = if frame.is_empty() {
            // everything masked away; the summary keeps the overall
            // mask range
            let start = revisions.iter().map(|r| r.start.clone()).min().unwrap();
            let end = revisions.iter().map(|r| r.end.clone()).max().unwrap();
            (Vec::new(), start, end)
        } else {
            (
                self.write_payloads(&frame)?,
                frame.index_key(0),
                frame.index_key(frame.len() - 1),
            )
        };

        let summary = self.changelog.commit(None, payloads, start, end)?;
        let folded: Vec<String> = revisions
            .into_iter()
            .map(|revision| revision.key)
            .filter(|key| *key != summary.key)
            .collect();
        if keep_archive {
            self.changelog.archive_revisions(&folded)?;
        } else {
            self.changelog.remove_revisions(&folded)?;
        }
        Ok(())
    }

    /// Fold concurrent heads into one: commit a reconciliation
    /// revision carrying the merged frame onto the walk-last head and
    /// archive the side branches.
    pub fn merge(&self) -> Result<(), Error> {
        let heads = self.changelog.heads()?;
        if heads.len() <= 1 {
            return Ok(());
        }

        let revisions = self.changelog.walk()?;
        let frame = self.read()?;
        let last = heads.last().unwrap().clone();
        let (payloads, start, end) = if frame.is_empty() {
            let start = revisions.iter().map(|r| r.start.clone()).min().unwrap();
            let end = revisions.iter().map(|r| r.end.clone()).max().unwrap();
            (Vec::new(), start, end)
        } else {
            (
                self.write_payloads(&frame)?,
                frame.index_key(0),
                frame.index_key(frame.len() - 1),
            )
        };
        let merged = self.changelog.commit(Some(&last), payloads, start, end)?;

        let by_content: BTreeMap<String, Revision> = revisions
            .iter()
            .map(|revision| (revision.content.to_hex(), revision.clone()))
            .collect();

        // keep the zero-to-merged path, archive everything else
        let mut keep = HashSet::new();
        keep.insert(merged.key.clone());
        let mut cursor = merged;
        while !cursor.parent.is_zero() {
            match by_content.get(&cursor.parent.to_hex()) {
                Some(parent) => {
                    keep.insert(parent.key.clone());
                    cursor = parent.clone();
                }
                None => break,
            }
        }

        let folded: Vec<String> = revisions
            .into_iter()
            .map(|revision| revision.key)
            .filter(|key| !keep.contains(key))
            .collect();
        self.changelog.archive_revisions(&folded)
    }

    /// Digest strings protecting this series from the GC sweep: every
    /// payload digest plus each revision's sweep identity (its prefix
    /// and file name with slashes removed).
    pub fn digests(&self) -> Result<Vec<String>, Error> {
        let prefix_identity = self.changelog.pod().prefix().replace('/', "");
        let mut out = Vec::new();
        for revision in self.changelog.walk()? {
            out.push(format!("{}{}", prefix_identity, revision.key));
            for digest in &revision.payload_digests {
                out.push(digest.to_hex());
            }
        }
        Ok(out)
    }

    /// Copy revisions and referenced payload blobs from `remote`.
    /// Payload blobs land strictly before the revision referencing
    /// them, so concurrent readers never observe a dangling reference.
    pub(crate) fn pull(&self, remote: &Series) -> Result<usize, Error> {
        let local_files: HashSet<String> =
            self.changelog.revision_files()?.into_iter().collect();
        let mut copied = 0;
        for name in remote.changelog.revision_files()? {
            if local_files.contains(&name) {
                continue;
            }
            let data = remote.changelog.pod().get(&name)?;
            let revision = Revision::decode(&name, &data)?;
            for digest in &revision.payload_digests {
                let path = hashed_path(digest);
                if !self.store.exists(&path)? {
                    self.store.put(&path, &remote.store.get(&path)?)?;
                }
            }
            self.changelog.pod().put(&name, &data)?;
            copied += 1;
        }
        if copied > 0 {
            log::debug!("pulled {} revision(s) into series '{}'", copied, self.label);
        }
        Ok(copied)
    }
}

#[cfg(test)]
mod test_helpers {
    use super::*;
    use crate::schema::{ColumnDef, DType};

    pub fn test_series() -> Series {
        let schema = Schema::new(vec![
            ColumnDef::index("timestamp", DType::Int),
            ColumnDef::value("value", DType::Float),
        ])
        .unwrap();
        let store = Pod::memory();
        let pod = store.cd("aa/test-series");
        Series::new("test", &schema, pod, store)
    }

    pub fn frame(series: &Series, timestamps: &[i64], values: &[f64]) -> Frame {
        use crate::frame::Column;
        Frame::from_columns(
            series.schema(),
            vec![
                Column::Int(timestamps.to_vec()),
                Column::Float(values.to_vec()),
            ],
        )
        .unwrap()
    }
}

#[test]
fn test_series_write_read() {
    let series = test_helpers::test_series();
    let frame = test_helpers::frame(&series, &[1589455903, 1589455904, 1589455905], &[3.3, 4.4, 5.5]);

    series.write(&frame).unwrap();
    assert_eq!(series.read().unwrap(), frame);

    // empty write is a no-op
    let empty = test_helpers::frame(&series, &[], &[]);
    assert!(series.write(&empty).unwrap().is_none());
    assert_eq!(series.revisions().unwrap().len(), 1);
}

#[test]
fn test_series_rejects_unsorted() {
    let series = test_helpers::test_series();
    let frame = test_helpers::frame(&series, &[3, 1, 2], &[3.0, 1.0, 2.0]);
    assert!(series.write(&frame).is_err());
}

#[test]
fn test_series_tombstone() {
    let series = test_helpers::test_series();
    series
        .write(&test_helpers::frame(&series, &[1, 2, 3], &[1.0, 2.0, 3.0]))
        .unwrap();
    series.delete(&[vec![Value::Int(2)]]).unwrap();

    let visible = series.read().unwrap();
    assert_eq!(
        visible,
        test_helpers::frame(&series, &[1, 3], &[1.0, 3.0])
    );
}

#[test]
fn test_series_slice_read() {
    let series = test_helpers::test_series();
    series
        .write(&test_helpers::frame(&series, &[1, 2, 3, 4], &[1.0, 2.0, 3.0, 4.0]))
        .unwrap();

    let opts = ReadOptions::new()
        .start(vec![Value::Int(2)])
        .end(vec![Value::Int(3)]);
    assert_eq!(
        series.read_with(&opts).unwrap(),
        test_helpers::frame(&series, &[2, 3], &[2.0, 3.0])
    );
}
