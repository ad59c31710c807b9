use tessera::frame::Column;
use tessera::{ColumnDef, DType, Frame, ReadOptions, Repo, Schema, Series, Value};

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

fn base_frame() -> Frame {
    frame(&[1589455903, 1589455904, 1589455905], &[3.3, 4.4, 5.5])
}

fn series_fixture() -> Series {
    let _ = env_logger::builder().is_test(true).try_init();

    let repo = Repo::memory();
    let collection = repo.create_collection_one(&schema(), "fixture").unwrap();
    let series = collection.create_series(&schema(), "values").unwrap();
    series.write(&base_frame()).unwrap();
    series
}

#[test]
fn test_read_series() {
    let series = series_fixture();
    assert_eq!(series.read().unwrap(), base_frame());
}

#[test]
fn test_double_write() {
    let series = series_fixture();
    let expected: Vec<String> = series
        .revisions()
        .unwrap()
        .into_iter()
        .map(|revision| revision.key)
        .collect();

    series.write(&base_frame()).unwrap();

    assert_eq!(series.read().unwrap(), base_frame());
    let after: Vec<String> = series
        .revisions()
        .unwrap()
        .into_iter()
        .map(|revision| revision.key)
        .collect();
    assert_eq!(after, expected);
}

#[test]
fn test_spill_write_left() {
    let series = series_fixture();
    let spill = frame(
        &[1589455902, 1589455903, 1589455904, 1589455905],
        &[22.0, 33.0, 44.0, 55.0],
    );
    series.write(&spill).unwrap();
    assert_eq!(series.read().unwrap(), spill);
}

#[test]
fn test_spill_write_right() {
    let series = series_fixture();
    let spill = frame(
        &[1589455903, 1589455904, 1589455905, 1589455906],
        &[33.0, 44.0, 55.0, 66.0],
    );
    series.write(&spill).unwrap();
    assert_eq!(series.read().unwrap(), spill);
}

#[test]
fn test_short_cover_left() {
    let series = series_fixture();
    series
        .write(&frame(&[1589455904, 1589455905], &[44.0, 55.0]))
        .unwrap();

    assert_eq!(
        series.read().unwrap(),
        frame(&[1589455903, 1589455904, 1589455905], &[3.3, 44.0, 55.0])
    );
}

#[test]
fn test_short_cover_right() {
    let series = series_fixture();
    series
        .write(&frame(&[1589455903, 1589455904], &[33.0, 44.0]))
        .unwrap();

    assert_eq!(
        series.read().unwrap(),
        frame(&[1589455903, 1589455904, 1589455905], &[33.0, 44.0, 5.5])
    );
}

#[test]
fn test_adjacent_write_left() {
    let series = series_fixture();
    series.write(&frame(&[1589455902], &[2.2])).unwrap();

    assert_eq!(
        series.read().unwrap(),
        frame(
            &[1589455902, 1589455903, 1589455904, 1589455905],
            &[2.2, 3.3, 4.4, 5.5]
        )
    );

    // left slice
    let opts = ReadOptions::new()
        .start(vec![Value::Int(1589455902)])
        .end(vec![Value::Int(1589455903)]);
    assert_eq!(
        series.read_with(&opts).unwrap(),
        frame(&[1589455902, 1589455903], &[2.2, 3.3])
    );

    // right slice
    let opts = ReadOptions::new()
        .start(vec![Value::Int(1589455905)])
        .end(vec![Value::Int(1589455906)]);
    assert_eq!(
        series.read_with(&opts).unwrap(),
        frame(&[1589455905], &[5.5])
    );
}

#[test]
fn test_adjacent_write_right() {
    let series = series_fixture();
    series.write(&frame(&[1589455906], &[6.6])).unwrap();

    assert_eq!(
        series.read().unwrap(),
        frame(
            &[1589455903, 1589455904, 1589455905, 1589455906],
            &[3.3, 4.4, 5.5, 6.6]
        )
    );

    let opts = ReadOptions::new()
        .start(vec![Value::Int(1589455902)])
        .end(vec![Value::Int(1589455903)]);
    assert_eq!(
        series.read_with(&opts).unwrap(),
        frame(&[1589455903], &[3.3])
    );

    let opts = ReadOptions::new()
        .start(vec![Value::Int(1589455905)])
        .end(vec![Value::Int(1589455906)]);
    assert_eq!(
        series.read_with(&opts).unwrap(),
        frame(&[1589455905, 1589455906], &[5.5, 6.6])
    );
}

#[test]
fn test_rev_filter() {
    let series = series_fixture();
    let second = frame(&[1589455904, 1589455905], &[44.0, 55.0]);
    let new_rev = series.write(&second).unwrap().unwrap();

    // only the initial commit
    let old = series
        .read_with(&ReadOptions::new().before(&new_rev))
        .unwrap();
    assert_eq!(old, base_frame());

    // ignore the initial commit
    let new = series
        .read_with(&ReadOptions::new().after(&new_rev))
        .unwrap();
    assert_eq!(new, second);
}

#[test]
fn test_series_squash() {
    let series = series_fixture();
    series
        .write(&frame(&[1589455904, 1589455905], &[44.0, 55.0]))
        .unwrap();

    let visible = series.read().unwrap();
    series.squash().unwrap();

    assert_eq!(series.revisions().unwrap().len(), 1);
    assert_eq!(series.read().unwrap(), visible);
}

#[test]
fn test_series_pack() {
    let series = series_fixture();
    series
        .write(&frame(&[1589455906, 1589455907], &[6.6, 7.7]))
        .unwrap();

    let visible = series.read().unwrap();
    series.pack().unwrap();

    assert_eq!(series.revisions().unwrap().len(), 1);
    assert_eq!(series.read().unwrap(), visible);
}

#[test]
fn test_delete_rows() {
    let series = series_fixture();
    series.delete(&[vec![Value::Int(1589455904)]]).unwrap();

    assert_eq!(
        series.read().unwrap(),
        frame(&[1589455903, 1589455905], &[3.3, 5.5])
    );
}

#[test]
fn test_column_types() {
    let schema = Schema::new(vec![
        ColumnDef::index("key", DType::Str),
        ColumnDef::value("int", DType::Int),
        ColumnDef::value("float", DType::Float),
        ColumnDef::value("stamp", DType::Timestamp),
        ColumnDef::value("blob", DType::Bytes),
    ])
    .unwrap();

    let repo = Repo::memory();
    let collection = repo.create_collection_one(&schema, "typed").unwrap();
    let series = collection.create_series(&schema, "all-types").unwrap();

    let frame = Frame::from_columns(
        &schema,
        vec![
            Column::Str(vec!["a".to_string(), "b".to_string()]),
            Column::Int(vec![-7, 7]),
            Column::Float(vec![0.25, -0.25]),
            Column::Timestamp(vec![1589455903, 1589455904]),
            Column::Bytes(vec![vec![0, 1, 2], Vec::new()]),
        ],
    )
    .unwrap();

    series.write(&frame).unwrap();
    assert_eq!(series.read().unwrap(), frame);
}
