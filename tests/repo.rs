use tessera::error::is_not_found;
use tessera::frame::Column;
use tessera::{ColumnDef, DType, Frame, Mode, Repo, Schema, StoreError};

fn schema() -> Schema {
    Schema::new(vec![
        ColumnDef::index("timestamp", DType::Int),
        ColumnDef::value("value", DType::Float),
    ])
    .unwrap()
}

fn frame(timestamps: &[i64], values: &[f64]) -> Frame {
    Frame::from_columns(
        &schema(),
        vec![
            Column::Int(timestamps.to_vec()),
            Column::Float(values.to_vec()),
        ],
    )
    .unwrap()
}

#[test]
fn test_create() {
    let repo = Repo::memory();
    let temperature = repo.create_collection_one(&schema(), "temperature").unwrap();
    let temp_bru = temperature.create_series(&schema(), "Brussels").unwrap();
    let data = frame(&[1, 2, 3], &[11.0, 12.0, 13.0]);
    temp_bru.write(&data).unwrap();

    // read it back through fresh handles
    let temperature = repo.collection("temperature").unwrap().unwrap();
    let temp_bru = temperature.series("Brussels").unwrap();
    assert_eq!(temp_bru.read().unwrap(), data);

    assert_eq!(repo.ls().unwrap(), vec!["temperature"]);
    assert_eq!(temperature.ls().unwrap(), vec!["Brussels"]);
}

#[test]
fn test_multi() {
    let repo = Repo::memory();
    let temperature = repo.ensure_collection(&schema(), "temperature").unwrap();

    let data_bru = frame(&[1, 2, 3], &[11.0, 12.0, 13.0]);
    let temp_bru = temperature.create_series(&schema(), "Brussels").unwrap();
    temp_bru.write(&data_bru).unwrap();

    let data_ory = frame(&[1, 2, 3], &[21.0, 22.0, 23.0]);
    let temp_ory = temperature.create_series(&schema(), "Paris").unwrap();
    temp_ory.write(&data_ory).unwrap();

    assert_eq!(temp_bru.read().unwrap(), data_bru);
    assert_eq!(temp_ory.read().unwrap(), data_ory);

    assert_eq!(repo.revisions().unwrap().len(), 1);
    assert_eq!(temperature.revisions().unwrap().len(), 2);
    assert_eq!(temp_bru.revisions().unwrap().len(), 1);

    assert_eq!(temperature.ls().unwrap(), vec!["Brussels", "Paris"]);
}

#[test]
fn test_collection_squash() {
    let repo = Repo::memory();
    let temperature = repo.ensure_collection(&schema(), "temperature").unwrap();

    let temp_bru = temperature.create_series(&schema(), "Brussels").unwrap();
    temp_bru.write(&frame(&[1, 2, 3], &[1.0, 2.0, 3.0])).unwrap();
    temp_bru
        .write(&frame(&[1, 2, 3], &[11.0, 12.0, 13.0]))
        .unwrap();

    let temp_ory = temperature.create_series(&schema(), "Paris").unwrap();
    temp_ory
        .write(&frame(&[1, 2, 3], &[11.0, 12.0, 13.0]))
        .unwrap();

    temperature.squash().unwrap();

    assert_eq!(temperature.ls().unwrap(), vec!["Brussels", "Paris"]);
    for label in &["Brussels", "Paris"] {
        let series = temperature.series(label).unwrap();
        assert_eq!(series.revisions().unwrap().len(), 1);
        assert_eq!(
            series.read().unwrap(),
            frame(&[1, 2, 3], &[11.0, 12.0, 13.0])
        );
    }
}

#[test]
fn test_create_many_labels() {
    let repo = Repo::memory();

    // unsorted labels are rejected (registry writes require sorted
    // input)
    assert!(repo
        .create_collection(&schema(), &["beta", "alpha"])
        .is_err());

    let labels = ["alpha", "beta", "gamma"];
    let collections = repo.create_collection(&schema(), &labels).unwrap();
    assert_eq!(collections.len(), 3);

    assert_eq!(repo.ls().unwrap(), vec!["alpha", "beta", "gamma"]);
    for label in &labels {
        let collection = repo.collection(label).unwrap().unwrap();
        assert_eq!(collection.schema(), &schema());
    }
}

#[test]
fn test_registry_history() {
    let repo = Repo::memory();
    for label in &["a", "b", "c", "d"] {
        repo.create_collection(&schema(), &[*label]).unwrap();
    }
    assert_eq!(repo.revisions().unwrap().len(), 4);
    assert_eq!(repo.ls().unwrap(), vec!["a", "b", "c", "d"]);

    // merging a linear history changes nothing
    repo.merge().unwrap();
    assert_eq!(repo.ls().unwrap(), vec!["a", "b", "c", "d"]);
}

#[test]
fn test_invalid_label() {
    let repo = Repo::memory();
    let err = repo.create_collection(&schema(), &["  "]).unwrap_err();
    match err.downcast_ref::<StoreError>() {
        Some(StoreError::InvalidLabel(_)) => (),
        _ => panic!("expected InvalidLabel"),
    }
}

#[test]
fn test_archive() {
    let repo = Repo::memory();
    let temperature = repo.create_collection_one(&schema(), "temperature").unwrap();

    let archived = repo.archive(&temperature).unwrap();
    assert_eq!(archived.label(), "temperature");

    // archive and active trees are distinct
    assert_ne!(archived.path(), temperature.path());

    // idempotent
    let again = repo.archive(&temperature).unwrap();
    assert_eq!(again.path(), archived.path());

    assert!(repo
        .collection_mode("temperature", Mode::Archive)
        .unwrap()
        .is_some());
}

#[test]
fn test_delete_collection() {
    let repo = Repo::memory();
    let temperature = repo.create_collection_one(&schema(), "temperature").unwrap();
    let series = temperature.create_series(&schema(), "Brussels").unwrap();
    series.write(&frame(&[1, 2, 3], &[1.0, 2.0, 3.0])).unwrap();

    repo.delete(&["temperature"]).unwrap();

    assert!(repo.ls().unwrap().is_empty());
    assert!(repo.collection("temperature").unwrap().is_none());

    // deleting again is fine
    repo.delete(&["temperature"]).unwrap();
}

#[test]
fn test_gc() {
    let repo = Repo::memory();
    let temperature = repo.create_collection_one(&schema(), "temperature").unwrap();
    let series = temperature.create_series(&schema(), "Brussels").unwrap();
    series.write(&frame(&[1, 2, 3], &[1.0, 2.0, 3.0])).unwrap();

    // everything is referenced
    assert_eq!(repo.gc().unwrap(), 0);

    repo.delete(&["temperature"]).unwrap();

    // the orphaned payload blobs go away
    let deleted = repo.gc().unwrap();
    assert!(deleted >= 1);

    // idle repo: nothing left to reclaim
    assert_eq!(repo.gc().unwrap(), 0);
}

#[test]
fn test_gc_after_squash() {
    let repo = Repo::memory();
    let temperature = repo.create_collection_one(&schema(), "temperature").unwrap();
    let series = temperature.create_series(&schema(), "Brussels").unwrap();
    series.write(&frame(&[1, 2, 3], &[1.0, 2.0, 3.0])).unwrap();
    series.write(&frame(&[1, 2, 3], &[4.0, 5.0, 6.0])).unwrap();

    series.squash().unwrap();

    // the first write's payload blob is unreferenced now
    assert!(repo.gc().unwrap() >= 1);
    assert_eq!(repo.gc().unwrap(), 0);
    assert_eq!(
        series.read().unwrap(),
        frame(&[1, 2, 3], &[4.0, 5.0, 6.0])
    );
}

#[test]
fn test_series_not_found() {
    let repo = Repo::memory();
    let temperature = repo.create_collection_one(&schema(), "temperature").unwrap();
    let err = temperature.series("missing").unwrap_err();
    assert!(is_not_found(&err));
}
