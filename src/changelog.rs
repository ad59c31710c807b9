//! Append-only, content-addressed DAG of revisions.
//!
//! A revision references the payload blobs it introduces plus the
//! inclusive index range they cover. Its identity (content digest) is
//! derived from payloads and range only, so replaying a commit maps to
//! the same storage key and is a no-op. Two writers observing the same
//! parent simply create sibling revisions; readers linearize the DAG
//! deterministically (depth first, siblings in lexicographic digest
//! order) and merge at read time.

use std::collections::{BTreeMap, HashSet};
use std::env;

use anyhow::Error;

use crate::digest::{Digest, DIGEST_HEX_LEN};
use crate::error::StoreError;
use crate::frame::{decode_values, encode_values, Reader, Value};
use crate::pod::Pod;
use crate::tools::time::epoch_i64;

pub const REVISION_MAGIC_1_0: [u8; 8] = [188, 29, 11, 83, 205, 96, 46, 137];

const HEADER_SIZE: usize = 12; // magic + crc
const REVISION_KEY_LEN: usize = 2 * DIGEST_HEX_LEN;

/// Folded revisions are parked here by `pack`; invisible to `walk`.
const ARCHIVE_FOLDER: &str = "archive";

fn codec_err(msg: &str) -> Error {
    StoreError::Codec(msg.to_string()).into()
}

/// One changelog entry.
#[derive(Clone, Debug)]
pub struct Revision {
    /// Storage key below the changelog prefix: parent digest hex
    /// followed by content digest hex.
    pub key: String,
    pub parent: Digest,
    /// Content digest over payload digests and index range.
    pub content: Digest,
    /// Frame blobs introduced by this revision, in row order.
    pub payload_digests: Vec<Digest>,
    /// Inclusive index range covered (and masked) by this revision.
    pub start: Vec<Value>,
    pub end: Vec<Value>,
    pub timestamp: i64,
    pub author: String,
}

impl Revision {
    pub fn content_digest(payload_digests: &[Digest], start: &[Value], end: &[Value]) -> Digest {
        let mut buf = Vec::new();
        for digest in payload_digests {
            buf.extend_from_slice(digest.as_bytes());
        }
        encode_values(start, &mut buf);
        encode_values(end, &mut buf);
        Digest::compute(&buf)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(self.parent.as_bytes());
        body.extend_from_slice(&(self.payload_digests.len() as u32).to_le_bytes());
        for digest in &self.payload_digests {
            body.extend_from_slice(digest.as_bytes());
        }
        encode_values(&self.start, &mut body);
        encode_values(&self.end, &mut body);
        body.extend_from_slice(&self.timestamp.to_le_bytes());
        body.extend_from_slice(&(self.author.len() as u16).to_le_bytes());
        body.extend_from_slice(self.author.as_bytes());

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        let mut raw = Vec::with_capacity(HEADER_SIZE + body.len());
        raw.extend_from_slice(&REVISION_MAGIC_1_0);
        raw.extend_from_slice(&crc.to_le_bytes());
        raw.extend_from_slice(&body);
        raw
    }

    pub fn decode(key: &str, data: &[u8]) -> Result<Self, Error> {
        let (parent, content) = match split_revision_key(key) {
            Some(parts) => parts,
            None => return Err(codec_err("malformed revision key")),
        };

        if data.len() < HEADER_SIZE {
            return Err(codec_err("revision blob too short"));
        }
        if data[0..8] != REVISION_MAGIC_1_0 {
            return Err(codec_err("unknown revision blob magic"));
        }
        let crc = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&data[HEADER_SIZE..]);
        if hasher.finalize() != crc {
            return Err(codec_err("revision blob has wrong crc checksum"));
        }

        let mut reader = Reader::new(&data[HEADER_SIZE..]);
        let mut parent_bytes = [0u8; 32];
        parent_bytes.copy_from_slice(reader.take(32)?);
        let stored_parent = Digest::from_bytes(parent_bytes);
        if stored_parent != parent {
            return Err(codec_err("revision parent does not match storage key"));
        }

        let count = reader.read_u32()? as usize;
        let mut payload_digests = Vec::with_capacity(count);
        for _ in 0..count {
            let mut digest = [0u8; 32];
            digest.copy_from_slice(reader.take(32)?);
            payload_digests.push(Digest::from_bytes(digest));
        }
        let start = decode_values(&mut reader)?;
        let end = decode_values(&mut reader)?;
        let timestamp = reader.read_i64()?;
        let author_len = reader.read_u16()? as usize;
        let author = String::from_utf8(reader.take(author_len)?.to_vec())
            .map_err(|_| codec_err("invalid utf-8 in revision author"))?;
        if !reader.is_done() {
            return Err(codec_err("trailing bytes in revision blob"));
        }

        if Revision::content_digest(&payload_digests, &start, &end) != content {
            return Err(codec_err("revision content does not match storage key"));
        }

        Ok(Revision {
            key: key.to_string(),
            parent,
            content,
            payload_digests,
            start,
            end,
            timestamp,
            author,
        })
    }

    /// Whether this revision's index range intersects the query range.
    pub fn overlaps(&self, start: Option<&Vec<Value>>, end: Option<&Vec<Value>>) -> bool {
        if let Some(start) = start {
            if self.end < *start {
                return false;
            }
        }
        if let Some(end) = end {
            if self.start > *end {
                return false;
            }
        }
        true
    }
}

fn split_revision_key(key: &str) -> Option<(Digest, Digest)> {
    if key.len() != REVISION_KEY_LEN || !key.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let parent = Digest::from_hex(&key[..DIGEST_HEX_LEN]).ok()?;
    let content = Digest::from_hex(&key[DIGEST_HEX_LEN..]).ok()?;
    Some((parent, content))
}

fn author() -> String {
    env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}

/// The set of revisions below one store prefix.
#[derive(Clone)]
pub struct Changelog {
    pod: Pod,
}

impl Changelog {
    pub fn new(pod: Pod) -> Self {
        Changelog { pod }
    }

    pub fn pod(&self) -> &Pod {
        &self.pod
    }

    /// Revision file names below the prefix (anything else, like the
    /// archive folder, is skipped).
    pub(crate) fn revision_files(&self) -> Result<Vec<String>, Error> {
        let mut files: Vec<String> = self
            .pod
            .ls("")?
            .into_iter()
            .filter(|name| split_revision_key(name).is_some())
            .collect();
        files.sort();
        Ok(files)
    }

    /// All revisions, depth first from the zero root, siblings in
    /// lexicographic content-digest order. A child always follows its
    /// parent and a whole lesser branch precedes a greater one, which
    /// makes "later in walk order" a total last-writer-wins order.
    pub fn walk(&self) -> Result<Vec<Revision>, Error> {
        let mut by_parent: BTreeMap<String, Vec<Revision>> = BTreeMap::new();
        for name in self.revision_files()? {
            let data = self.pod.get(&name)?;
            let revision = Revision::decode(&name, &data)?;
            by_parent
                .entry(revision.parent.to_hex())
                .or_insert_with(Vec::new)
                .push(revision);
        }
        for group in by_parent.values_mut() {
            group.sort_by(|a, b| a.content.cmp(&b.content));
            group.reverse(); // popped smallest-first below
        }

        let mut ordered = Vec::new();
        let mut stack = by_parent.remove(&Digest::ZERO.to_hex()).unwrap_or_default();
        while let Some(revision) = stack.pop() {
            if let Some(children) = by_parent.remove(&revision.content.to_hex()) {
                stack.extend(children);
            }
            ordered.push(revision);
        }

        if !by_parent.is_empty() {
            // revisions with a vanished parent chain; not reachable
            log::debug!(
                "changelog '{}' has {} unreachable revision group(s)",
                self.pod.prefix(),
                by_parent.len()
            );
        }

        Ok(ordered)
    }

    /// The walk-last revision; what a new commit uses as parent.
    pub fn head(&self) -> Result<Option<Revision>, Error> {
        Ok(self.walk()?.pop())
    }

    /// All leaves of the DAG, in walk order.
    pub fn heads(&self) -> Result<Vec<Revision>, Error> {
        let revisions = self.walk()?;
        let parents: HashSet<String> = revisions
            .iter()
            .map(|revision| revision.parent.to_hex())
            .collect();
        Ok(revisions
            .into_iter()
            .filter(|revision| !parents.contains(&revision.content.to_hex()))
            .collect())
    }

    /// Append a revision. Committing the exact payloads and range of
    /// the given parent again, or replaying an existing revision, is a
    /// no-op.
    pub fn commit(
        &self,
        parent: Option<&Revision>,
        payload_digests: Vec<Digest>,
        start: Vec<Value>,
        end: Vec<Value>,
    ) -> Result<Revision, Error> {
        let content = Revision::content_digest(&payload_digests, &start, &end);
        if let Some(parent) = parent {
            if parent.content == content {
                return Ok(parent.clone());
            }
        }

        let parent_digest = parent
            .map(|revision| revision.content)
            .unwrap_or(Digest::ZERO);
        let key = format!("{}{}", parent_digest.to_hex(), content.to_hex());

        if self.pod.exists(&key)? {
            let data = self.pod.get(&key)?;
            return Revision::decode(&key, &data);
        }

        let revision = Revision {
            key: key.clone(),
            parent: parent_digest,
            content,
            payload_digests,
            start,
            end,
            timestamp: epoch_i64(),
            author: author(),
        };
        self.pod.put(&key, &revision.encode())?;
        log::debug!("committed revision {} under '{}'", key, self.pod.prefix());
        Ok(revision)
    }

    /// Park folded revisions under the archive folder.
    pub(crate) fn archive_revisions(&self, keys: &[String]) -> Result<(), Error> {
        for key in keys {
            let data = self.pod.get(key)?;
            self.pod.put(&format!("{}/{}", ARCHIVE_FOLDER, key), &data)?;
            self.pod.rm(key, false, true)?;
        }
        Ok(())
    }

    pub(crate) fn remove_revisions(&self, keys: &[String]) -> Result<(), Error> {
        for key in keys {
            self.pod.rm(key, false, true)?;
        }
        Ok(())
    }
}

#[cfg(test)]
fn test_changelog() -> Changelog {
    Changelog::new(Pod::memory().cd("00/test-changelog"))
}

#[test]
fn test_revision_codec_roundtrip() {
    let payloads = vec![Digest::compute(b"one"), Digest::compute(b"two")];
    let start = vec![Value::Int(1)];
    let end = vec![Value::Int(9)];
    let content = Revision::content_digest(&payloads, &start, &end);
    let key = format!("{}{}", Digest::ZERO.to_hex(), content.to_hex());

    let revision = Revision {
        key: key.clone(),
        parent: Digest::ZERO,
        content,
        payload_digests: payloads,
        start,
        end,
        timestamp: 1589455903,
        author: "tester".to_string(),
    };

    let data = revision.encode();
    let copy = Revision::decode(&key, &data).unwrap();
    assert_eq!(copy.encode(), data);
    assert_eq!(copy.payload_digests, revision.payload_digests);
    assert_eq!(copy.start, revision.start);
    assert_eq!(copy.timestamp, revision.timestamp);
    assert_eq!(copy.author, revision.author);
}

#[test]
fn test_commit_walk_heads() {
    let changelog = test_changelog();
    assert!(changelog.walk().unwrap().is_empty());
    assert!(changelog.head().unwrap().is_none());

    let first = changelog
        .commit(
            None,
            vec![Digest::compute(b"a")],
            vec![Value::Int(1)],
            vec![Value::Int(3)],
        )
        .unwrap();
    let second = changelog
        .commit(
            Some(&first),
            vec![Digest::compute(b"b")],
            vec![Value::Int(4)],
            vec![Value::Int(6)],
        )
        .unwrap();

    let walk = changelog.walk().unwrap();
    assert_eq!(walk.len(), 2);
    assert_eq!(walk[0].key, first.key);
    assert_eq!(walk[1].key, second.key);

    let heads = changelog.heads().unwrap();
    assert_eq!(heads.len(), 1);
    assert_eq!(heads[0].key, second.key);
    assert_eq!(changelog.head().unwrap().unwrap().key, second.key);
}

#[test]
fn test_commit_idempotence() {
    let changelog = test_changelog();
    let payloads = vec![Digest::compute(b"same")];
    let first = changelog
        .commit(None, payloads.clone(), vec![Value::Int(1)], vec![Value::Int(2)])
        .unwrap();

    // replay on top of the identical head is a no-op
    let replay = changelog
        .commit(Some(&first), payloads, vec![Value::Int(1)], vec![Value::Int(2)])
        .unwrap();
    assert_eq!(replay.key, first.key);
    assert_eq!(changelog.walk().unwrap().len(), 1);
}

#[test]
fn test_sibling_determinism() {
    let changelog = test_changelog();
    let root = changelog
        .commit(None, vec![Digest::compute(b"root")], vec![Value::Int(1)], vec![Value::Int(5)])
        .unwrap();

    // two writers on the same parent
    let one = changelog
        .commit(Some(&root), vec![Digest::compute(b"one")], vec![Value::Int(1)], vec![Value::Int(5)])
        .unwrap();
    let two = changelog
        .commit(Some(&root), vec![Digest::compute(b"two")], vec![Value::Int(1)], vec![Value::Int(5)])
        .unwrap();
    assert_ne!(one.key, two.key);

    let walk = changelog.walk().unwrap();
    assert_eq!(walk.len(), 3);
    assert_eq!(walk[0].key, root.key);
    // siblings come in lexicographic content order
    let mut expected = vec![one.key.clone(), two.key.clone()];
    expected.sort();
    assert_eq!(vec![walk[1].key.clone(), walk[2].key.clone()], expected);

    assert_eq!(changelog.heads().unwrap().len(), 2);
}
