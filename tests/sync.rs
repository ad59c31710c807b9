use tessera::frame::Column;
use tessera::{ColumnDef, DType, Frame, Repo, Schema, StoreError};

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

fn populated_repo() -> Repo {
    let _ = env_logger::builder().is_test(true).try_init();

    let repo = Repo::memory();
    let temperature = repo.create_collection_one(&schema(), "temperature").unwrap();
    temperature
        .create_series(&schema(), "Brussels")
        .unwrap()
        .write(&frame(&[1, 2, 3], &[11.0, 12.0, 13.0]))
        .unwrap();
    temperature
        .create_series(&schema(), "Paris")
        .unwrap()
        .write(&frame(&[1, 2, 3], &[21.0, 22.0, 23.0]))
        .unwrap();

    let rain = repo.create_collection_one(&schema(), "rain").unwrap();
    rain.create_series(&schema(), "Brussels")
        .unwrap()
        .write(&frame(&[5, 6], &[0.5, 0.6]))
        .unwrap();

    repo
}

fn assert_same_content(local: &Repo, remote: &Repo) {
    for collection in remote.search(None, tessera::Mode::Active).unwrap() {
        let local_collection = local.collection(collection.label()).unwrap().unwrap();
        assert_eq!(local_collection.ls().unwrap(), collection.ls().unwrap());
        for label in collection.ls().unwrap() {
            let remote_series = collection.series(&label).unwrap();
            let local_series = local_collection.series(&label).unwrap();
            assert_eq!(local_series.read().unwrap(), remote_series.read().unwrap());
        }
    }
}

#[test]
fn test_pull() {
    let remote = populated_repo();
    let local = Repo::memory();

    local.pull(&remote, &[]).unwrap();

    let mut labels = local.ls().unwrap();
    labels.sort();
    assert_eq!(labels, vec!["rain", "temperature"]);
    assert_same_content(&local, &remote);
}

#[test]
fn test_pull_is_idempotent() {
    let remote = populated_repo();
    let local = Repo::memory();

    local.pull(&remote, &[]).unwrap();
    let before: Vec<String> = local
        .collection("temperature")
        .unwrap()
        .unwrap()
        .revisions()
        .unwrap()
        .into_iter()
        .map(|revision| revision.key)
        .collect();

    local.pull(&remote, &[]).unwrap();
    let after: Vec<String> = local
        .collection("temperature")
        .unwrap()
        .unwrap()
        .revisions()
        .unwrap()
        .into_iter()
        .map(|revision| revision.key)
        .collect();

    assert_eq!(before, after);
    assert_same_content(&local, &remote);
}

#[test]
fn test_pull_selected_labels() {
    let remote = populated_repo();
    let local = Repo::memory();

    local.pull(&remote, &["rain"]).unwrap();

    // registry rows come along with the registry sync, but only the
    // requested collection's data was copied
    let rain = local.collection("rain").unwrap().unwrap();
    assert_eq!(rain.ls().unwrap(), vec!["Brussels"]);
    assert_eq!(
        rain.series("Brussels").unwrap().read().unwrap(),
        frame(&[5, 6], &[0.5, 0.6])
    );
}

#[test]
fn test_push() {
    let remote = Repo::memory();
    let local = populated_repo();

    local.push(&remote, &[]).unwrap();
    assert_same_content(&remote, &local);
}

#[test]
fn test_pull_refuses_incompatible_schema() {
    let remote = populated_repo();
    let local = Repo::memory();
    local.pull(&remote, &[]).unwrap();

    // the local side diverges: "temperature" is re-registered with
    // another schema, shadowing the synced row
    let other_schema = Schema::new(vec![
        ColumnDef::index("timestamp", DType::Timestamp),
        ColumnDef::value("value", DType::Float),
    ])
    .unwrap();
    local
        .create_collection_one(&other_schema, "temperature")
        .unwrap();

    let err = local.pull(&remote, &[]).unwrap_err();
    match err.downcast_ref::<StoreError>() {
        Some(StoreError::IncompatibleSchema(label)) => assert_eq!(label, "temperature"),
        _ => panic!("expected IncompatibleSchema, got: {}", err),
    }
}

#[test]
fn test_pull_after_new_writes() {
    let remote = populated_repo();
    let local = Repo::memory();
    local.pull(&remote, &[]).unwrap();

    // more data lands remotely; a second pull catches up
    let temperature = remote.collection("temperature").unwrap().unwrap();
    temperature
        .series("Brussels")
        .unwrap()
        .write(&frame(&[4, 5], &[14.0, 15.0]))
        .unwrap();

    local.pull(&remote, &[]).unwrap();
    assert_same_content(&local, &remote);

    let brussels = local
        .collection("temperature")
        .unwrap()
        .unwrap()
        .series("Brussels")
        .unwrap();
    assert_eq!(
        brussels.read().unwrap(),
        frame(&[1, 2, 3, 4, 5], &[11.0, 12.0, 13.0, 14.0, 15.0])
    );
}

#[test]
fn test_file_repo_roundtrip() {
    let mut path = std::fs::canonicalize(".").unwrap();
    path.push(".testdir-file-repo");

    if let Err(_e) = std::fs::remove_dir_all(&path) { /* ignore */ }

    let uri = format!("file://{}", path.display());
    let repo = Repo::new(&uri).unwrap();
    let temperature = repo.create_collection_one(&schema(), "temperature").unwrap();
    let series = temperature.create_series(&schema(), "Brussels").unwrap();
    let data = frame(&[1, 2, 3], &[11.0, 12.0, 13.0]);
    series.write(&data).unwrap();

    // a fresh repo over the same directory sees the same content
    let reopened = Repo::new(&uri).unwrap();
    let series = reopened
        .collection("temperature")
        .unwrap()
        .unwrap()
        .series("Brussels")
        .unwrap();
    assert_eq!(series.read().unwrap(), data);

    if let Err(_e) = std::fs::remove_dir_all(&path) { /* ignore */ }
}

#[test]
fn test_cached_repo() {
    // memory cache in front of a memory backing store
    let repo = Repo::new("memory://+memory://").unwrap();
    let temperature = repo.create_collection_one(&schema(), "temperature").unwrap();
    let series = temperature.create_series(&schema(), "Brussels").unwrap();
    let data = frame(&[1, 2, 3], &[11.0, 12.0, 13.0]);
    series.write(&data).unwrap();

    assert_eq!(series.read().unwrap(), data);
    assert_eq!(repo.ls().unwrap(), vec!["temperature"]);
}

#[test]
fn test_sync_to_file_store() {
    let mut path = std::fs::canonicalize(".").unwrap();
    path.push(".testdir-sync-file");

    if let Err(_e) = std::fs::remove_dir_all(&path) { /* ignore */ }

    let remote = populated_repo();
    let local = Repo::new(&format!("file://{}", path.display())).unwrap();

    local.pull(&remote, &[]).unwrap();
    assert_same_content(&local, &remote);

    if let Err(_e) = std::fs::remove_dir_all(&path) { /* ignore */ }
}
