use arrow::array::{Int32Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use lablens_common::{QueryConfig, RebuildPolicy, StorageConfig};
use lablens_core::{
    compile, FactSource, FilterCondition, FilterExpression, LabLensError, Logic, MemoryExecutor, ParquetFactSource,
    PipelineError, QueryExecutor, QueryOptions, Relation, ViewStore,
};
use parquet::arrow::ArrowWriter;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

// raw export: numeric ids, integer ages, dates as text in three encodings
fn write_fixture(path: &Path) {
    let schema = Arc::new(Schema::new(vec![
        Field::new("numorden", DataType::Int64, false),
        Field::new("sexo", DataType::Utf8, true),
        Field::new("edad", DataType::Int32, true),
        Field::new("nombre", DataType::Utf8, false),
        Field::new("textores", DataType::Utf8, true),
        Field::new("nombre2", DataType::Utf8, true),
        Field::new("Date", DataType::Utf8, true),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int64Array::from(vec![1001, 1001, 1001, 1002, 1002, 1003])),
            Arc::new(StringArray::from(vec![Some("F"), Some("F"), Some("F"), Some("M"), Some("M"), None])),
            Arc::new(Int32Array::from(vec![Some(54), Some(54), Some(54), Some(33), Some(33), None])),
            Arc::new(StringArray::from(vec!["GLUCOSA", "GLUCOSA", "UREA", "HEMOGLOBINA", "GLUCOSA", "UREA"])),
            Arc::new(StringArray::from(vec![Some("98"), Some("120"), Some("31"), Some("13.4"), Some("NEGATIVO"), None])),
            Arc::new(StringArray::from(vec![Some("URG"), Some("MED"), Some("URG"), None, None, Some("URG")])),
            Arc::new(StringArray::from(vec![
                Some("01/05/2024"),
                Some("2024-05-02"),
                Some("01-05-2024"),
                Some("15/03/2024"),
                Some("2024-03-15"),
                Some("ayer"),
            ])),
        ],
    )
    .unwrap();
    let file = std::fs::File::create(path).unwrap();
    let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
}

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

#[test]
fn parquet_source_normalizes_mixed_dates() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(&dir.path().join("part-0.parquet"));
    let snapshot = ParquetFactSource::new(dir.path().to_string_lossy(), 4).load().unwrap();
    assert_eq!(snapshot.len(), 6);
    let rows = snapshot.rows();
    assert_eq!(rows[0].patient, "1001");
    assert_eq!(rows[0].age, Some(54));
    assert_eq!(rows[0].date, Some(d(2024, 5, 1)));
    assert_eq!(rows[2].date, Some(d(2024, 5, 1)));
    assert_eq!(rows[5].date, None);
    assert_eq!(rows[5].date_raw.as_deref(), Some("ayer"));
    assert_eq!(snapshot.unparseable_dates(), 1);
}

#[test]
fn rebuild_persist_query_and_reopen() {
    let input = tempfile::tempdir().unwrap();
    write_fixture(&input.path().join("results.parquet"));
    let data = tempfile::tempdir().unwrap();
    let storage = StorageConfig { data_dir: data.path().to_string_lossy().into_owned(), ..Default::default() };

    let store = ViewStore::persistent(storage.clone(), RebuildPolicy::Reject);
    let source = ParquetFactSource::new(input.path().join("*.parquet").to_string_lossy(), 1024);
    let published = store.rebuild(&source).unwrap();
    assert_eq!(published.generation, 1);

    // 1001: 05-01 {GLUCOSA, UREA}, 05-02 {GLUCOSA}; 1002: 03-15 {GLUCOSA, HEMOGLOBINA}
    let p1 = published.views.patient_panels("1001");
    assert_eq!(p1.len(), 2);
    assert_eq!(p1[0].n_tests, 2);
    assert_eq!(p1[0].tests, vec!["GLUCOSA", "UREA"]);
    let repeats = published.views.repeats();
    assert_eq!(repeats.len(), 1);
    assert_eq!((repeats[0].patient.as_str(), repeats[0].test.as_str()), ("1001", "GLUCOSA"));
    assert_eq!(repeats[0].days_span, 1);

    let filter = compile(&FilterExpression::new(
        vec![
            FilterCondition::new("nombre", "contains", json!("gluc")),
            FilterCondition::new("Date", "ge", json!("01/05/2024")),
        ],
        Logic::And,
    ))
    .unwrap();
    assert_eq!(filter.predicate, "lower(nombre) like lower(?) AND Date >= ?");
    let executor = MemoryExecutor::new(store.current(), QueryConfig::default()).unwrap();
    assert_eq!(executor.count(Relation::Results, &filter).unwrap(), 2);
    let page = executor
        .select(Relation::Results, &filter, &QueryOptions { sort_by: Some("Date".into()), ..Default::default() })
        .unwrap();
    assert_eq!((page.total, page.filtered, page.rows.num_rows()), (6, 2, 2));

    let reopened = ViewStore::open(storage, RebuildPolicy::Reject, 1024).unwrap();
    let current = reopened.current();
    assert_eq!(current.generation, 1);
    assert_eq!(current.views, published.views);
    assert_eq!(current.fingerprint, published.fingerprint);
}

#[test]
fn empty_input_fails_without_publishing() {
    let input = tempfile::tempdir().unwrap();
    let store = ViewStore::in_memory(RebuildPolicy::Queue);
    let source = ParquetFactSource::new(input.path().to_string_lossy(), 1024);
    let err = store.rebuild(&source).unwrap_err();
    assert!(matches!(err, LabLensError::Pipeline(PipelineError::SnapshotUnavailable(_))));
    assert_eq!(store.current().generation, 0);
}

#[test]
fn missing_required_column_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.parquet");
    let schema = Arc::new(Schema::new(vec![Field::new("numorden", DataType::Utf8, false)]));
    let batch = RecordBatch::try_new(schema.clone(), vec![Arc::new(StringArray::from(vec!["1"]))]).unwrap();
    let mut writer = ArrowWriter::try_new(std::fs::File::create(&path).unwrap(), schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
    let err = ParquetFactSource::new(path.to_string_lossy(), 16).load().unwrap_err();
    assert!(matches!(err, LabLensError::Pipeline(PipelineError::MissingColumn(ref c)) if c == "nombre"));
}
