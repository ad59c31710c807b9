//! Versioned, content-addressed columnar storage for time-series.
//!
//! # Data model
//!
//! All data lives in a pluggable object store ([Pod]) as immutable
//! blobs keyed by the hashed path of their SHA-256 digest. Two blob
//! kinds share the keyspace: *frame blobs* (encoded columnar payloads)
//! and *revision blobs* (changelog entries referencing frame blobs by
//! digest).
//!
//! Every [Series] owns a [Changelog]: an append-only DAG of revisions
//! rooted at the zero digest. Writers never block each other - two
//! writers observing the same parent simply create sibling revisions,
//! and readers merge the branches deterministically at read time.
//! Because both frames and revisions are content-addressed, replaying
//! a write is a no-op and partially copied synchronizations are safe
//! to resume.
//!
//! Series are grouped into a [Collection], and collections are listed
//! in the [Repo]'s registry - itself a collection stored at a
//! well-known bootstrap path, so a repository is fully described by
//! its object store alone.
//!
//! # Garbage collection
//!
//! Deleting or squashing data only removes revisions; payload blobs
//! become unreferenced and are reclaimed by [Repo::gc], a mark and
//! sweep pass: walk every reachable changelog to collect the active
//! digest set, then sweep the store for keys outside of it.

pub mod tools;

pub mod changelog;
pub mod collection;
pub mod digest;
pub mod error;
pub mod frame;
pub mod pod;
pub mod repo;
pub mod schema;
pub mod series;

pub use changelog::{Changelog, Revision};
pub use collection::Collection;
pub use digest::{hashed_path, Digest};
pub use error::StoreError;
pub use frame::{Frame, Value};
pub use pod::Pod;
pub use repo::{Mode, Repo};
pub use schema::{ColumnDef, DType, Schema};
pub use series::{ReadOptions, Series};
