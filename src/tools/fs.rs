//! File system helpers.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{bail, Error};

static TMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Atomically replace the contents of `path`.
///
/// The data goes to a temporary file in the same directory which is
/// then renamed over the target, so concurrent readers observe either
/// the old or the new content, never a partial write.
pub fn replace_file<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<(), Error> {
    let path = path.as_ref();

    // unique per process and call, so concurrent writers never share a
    // temp file
    let counter = TMP_COUNTER.fetch_add(1, Ordering::SeqCst);
    let mut tmp_path = path.to_owned();
    tmp_path.set_extension(format!("tmp_{}_{}", process::id(), counter));

    let mut file = match OpenOptions::new().write(true).create_new(true).open(&tmp_path) {
        Ok(file) => file,
        Err(err) => bail!("open {:?} failed - {}", tmp_path, err),
    };

    if let Err(err) = file.write_all(data) {
        let _ = fs::remove_file(&tmp_path);
        bail!("write to {:?} failed - {}", tmp_path, err);
    }
    drop(file);

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        bail!("atomic rename failed for file {:?} - {}", path, err);
    }

    Ok(())
}

#[test]
fn test_replace_file() {
    let mut path = std::fs::canonicalize(".").unwrap();
    path.push(".testfile-replace");

    replace_file(&path, b"first").unwrap();
    assert_eq!(fs::read(&path).unwrap(), b"first");

    replace_file(&path, b"second").unwrap();
    assert_eq!(fs::read(&path).unwrap(), b"second");

    let _ = fs::remove_file(&path);
}
