use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Date32Array, Date32Builder, Int64Builder, StringBuilder};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use chrono::NaiveDate;
use lablens_common::{LabLensError, PipelineError, Result};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

use crate::dates::{from_epoch_days, normalize_date, to_epoch_days};
use crate::reader::read_parquet_batches;
use crate::scanner::resolve_paths;
use crate::schema::{fact_schema, Column, DATE_RAW_COLUMN};

/// A lab result as recorded. The raw text is kept verbatim; numeric results
/// also carry their parsed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResultValue {
    Numeric { value: f64, raw: String },
    Text(String),
    Missing,
}

impl ResultValue {
    pub fn from_raw(raw: &str) -> Self {
        let t = raw.trim();
        if t.is_empty() {
            return ResultValue::Missing;
        }
        match t.parse::<f64>() {
            Ok(value) if value.is_finite() => ResultValue::Numeric { value, raw: raw.to_owned() },
            _ => ResultValue::Text(raw.to_owned()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ResultValue::Numeric { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn as_raw(&self) -> Option<&str> {
        match self {
            ResultValue::Numeric { raw, .. } | ResultValue::Text(raw) => Some(raw),
            ResultValue::Missing => None,
        }
    }
}

/// One test event. `date` is the canonical form of `date_raw`, absent when unparseable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRow {
    pub patient: String,
    pub sex: Option<String>,
    pub age: Option<i64>,
    pub test: String,
    pub result: ResultValue,
    pub service: Option<String>,
    pub date_raw: Option<String>,
    pub date: Option<NaiveDate>,
}

impl FactRow {
    pub fn new(patient: &str, test: &str, date_raw: &str) -> Self {
        Self {
            patient: patient.into(),
            sex: None,
            age: None,
            test: test.into(),
            result: ResultValue::Missing,
            service: None,
            date_raw: Some(date_raw.into()),
            date: normalize_date(date_raw),
        }
    }
    pub fn with_sex(mut self, sex: &str) -> Self { self.sex = Some(sex.into()); self }
    pub fn with_age(mut self, age: i64) -> Self { self.age = Some(age); self }
    pub fn with_result(mut self, raw: &str) -> Self { self.result = ResultValue::from_raw(raw); self }
    pub fn with_service(mut self, service: &str) -> Self { self.service = Some(service.into()); self }
}

/// An immutable, complete copy of the fact table as of one ingestion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactSnapshot {
    rows: Arc<Vec<FactRow>>,
}

/// Anything that can hand the core a complete fact snapshot.
pub trait FactSource {
    fn load(&self) -> Result<FactSnapshot>;
}

impl FactSource for FactSnapshot {
    fn load(&self) -> Result<FactSnapshot> {
        Ok(self.clone())
    }
}

impl FactSnapshot {
    pub fn from_rows(rows: Vec<FactRow>) -> Self {
        Self { rows: Arc::new(rows) }
    }

    pub fn rows(&self) -> &[FactRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn unparseable_dates(&self) -> usize {
        self.rows.iter().filter(|r| r.date.is_none()).count()
    }

    /// content hash; equal snapshots hash equal
    pub fn fingerprint(&self) -> u64 {
        let mut h = Xxh3::new();
        for r in self.rows.iter() {
            hash_field(&mut h, Some(&r.patient));
            hash_field(&mut h, r.sex.as_deref());
            hash_field(&mut h, r.age.map(|a| a.to_string()).as_deref());
            hash_field(&mut h, Some(&r.test));
            hash_field(&mut h, r.result.as_raw());
            hash_field(&mut h, r.service.as_deref());
            hash_field(&mut h, r.date_raw.as_deref());
        }
        h.digest()
    }

    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let n = self.rows.len();
        let mut patient = StringBuilder::with_capacity(n, n * 8);
        let mut sex = StringBuilder::with_capacity(n, n);
        let mut age = Int64Builder::with_capacity(n);
        let mut test = StringBuilder::with_capacity(n, n * 8);
        let mut result = StringBuilder::with_capacity(n, n * 8);
        let mut service = StringBuilder::with_capacity(n, n * 8);
        let mut date = Date32Builder::with_capacity(n);
        let mut date_raw = StringBuilder::with_capacity(n, n * 10);
        for r in self.rows.iter() {
            patient.append_value(&r.patient);
            sex.append_option(r.sex.as_deref());
            age.append_option(r.age);
            test.append_value(&r.test);
            result.append_option(r.result.as_raw());
            service.append_option(r.service.as_deref());
            date.append_option(r.date.map(to_epoch_days));
            date_raw.append_option(r.date_raw.as_deref());
        }
        let columns: Vec<ArrayRef> = vec![
            Arc::new(patient.finish()),
            Arc::new(sex.finish()),
            Arc::new(age.finish()),
            Arc::new(test.finish()),
            Arc::new(result.finish()),
            Arc::new(service.finish()),
            Arc::new(date.finish()),
            Arc::new(date_raw.finish()),
        ];
        Ok(RecordBatch::try_new(fact_schema(), columns)?)
    }

    /// Build a snapshot from arbitrary record batches carrying the fact columns.
    ///
    /// `numorden`, `nombre` and `Date` are required; the other columns are filled
    /// with nulls when absent. Cells are read through their display form, so ids
    /// stored as integers and dates stored as `Date32` or strings are all accepted.
    pub fn from_record_batches(batches: &[RecordBatch]) -> Result<Self> {
        let mut rows = Vec::new();
        for batch in batches {
            let get = |c: &str| batch.schema().index_of(c).ok().map(|i| batch.column(i).clone());
            let required = |c: Column| get(c.name()).ok_or_else(|| LabLensError::Pipeline(PipelineError::MissingColumn(c.name().into())));
            let patient = required(Column::Patient)?;
            let test = required(Column::Test)?;
            let date = required(Column::Date)?;
            let sex = get(Column::Sex.name());
            let age = get(Column::Age.name());
            let result = get(Column::Result.name());
            let service = get(Column::Service.name());
            let date_raw = get(DATE_RAW_COLUMN);
            for i in 0..batch.num_rows() {
                let (date_raw_v, date_v) = read_date(&date, date_raw.as_ref(), i)?;
                rows.push(FactRow {
                    patient: text_cell(&patient, i)?.unwrap_or_default(),
                    sex: opt_text(sex.as_ref(), i)?,
                    age: opt_text(age.as_ref(), i)?.and_then(|s| parse_age(&s)),
                    test: text_cell(&test, i)?.unwrap_or_default(),
                    result: opt_text(result.as_ref(), i)?.map(|s| ResultValue::from_raw(&s)).unwrap_or(ResultValue::Missing),
                    service: opt_text(service.as_ref(), i)?,
                    date_raw: date_raw_v,
                    date: date_v,
                });
            }
        }
        Ok(Self::from_rows(rows))
    }
}

// tagged so that None and "" hash differently
fn hash_field(h: &mut Xxh3, s: Option<&str>) {
    match s {
        Some(s) => {
            h.update(&[1u8]);
            h.update(s.as_bytes());
            h.update(&[0u8]);
        }
        None => h.update(&[2u8]),
    }
}

fn text_cell(arr: &ArrayRef, i: usize) -> Result<Option<String>> {
    if arr.is_null(i) {
        return Ok(None);
    }
    Ok(Some(array_value_to_string(arr, i)?))
}

fn opt_text(arr: Option<&ArrayRef>, i: usize) -> Result<Option<String>> {
    match arr {
        Some(a) => text_cell(a, i),
        None => Ok(None),
    }
}

fn parse_age(s: &str) -> Option<i64> {
    let t = s.trim();
    t.parse::<i64>().ok().or_else(|| t.parse::<f64>().ok().filter(|f| f.is_finite() && f.fract() == 0.0).map(|f| f as i64))
}

// canonical dates come straight from Date32; everything else goes through the normalizer
fn read_date(date: &ArrayRef, raw: Option<&ArrayRef>, i: usize) -> Result<(Option<String>, Option<NaiveDate>)> {
    let raw_v = match raw {
        Some(r) => text_cell(r, i)?,
        None => None,
    };
    if date.is_null(i) {
        return Ok((raw_v, None));
    }
    if date.data_type() == &DataType::Date32 {
        let d = date.as_any().downcast_ref::<Date32Array>().and_then(|a| from_epoch_days(a.value(i)));
        let raw_v = raw_v.or_else(|| d.map(|d| d.format("%Y-%m-%d").to_string()));
        return Ok((raw_v, d));
    }
    let s = array_value_to_string(date, i)?;
    let d = normalize_date(&s);
    Ok((raw_v.or(Some(s)), d))
}

/// Fact rows from a parquet file, a directory of parquet parts, or a glob.
#[derive(Debug, Clone)]
pub struct ParquetFactSource {
    pub input: String,
    pub batch_size: usize,
}

impl ParquetFactSource {
    pub fn new(input: impl Into<String>, batch_size: usize) -> Self {
        Self { input: input.into(), batch_size }
    }
}

impl FactSource for ParquetFactSource {
    fn load(&self) -> Result<FactSnapshot> {
        let paths = resolve_paths(&self.input)?;
        if paths.is_empty() {
            return Err(PipelineError::SnapshotUnavailable(format!("no parquet files found: {}", self.input)).into());
        }
        let mut batches = Vec::new();
        for p in &paths {
            batches.extend(read_parquet_batches(p, self.batch_size)?);
        }
        let snapshot = FactSnapshot::from_record_batches(&batches)?;
        tracing::debug!(files = paths.len(), rows = snapshot.len(), "fact snapshot loaded");
        Ok(snapshot)
    }
}
