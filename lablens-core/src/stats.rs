use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::NaiveDate;
use lablens_common::Result;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::aggregate::DerivedViews;
use crate::fact::{FactRow, FactSnapshot, ResultValue};
use crate::filter::CompiledFilter;
use crate::profile::{FrequencyCounter, FrequencyEntry, NumericAccumulator, NumericSummary};
use crate::schema::{Column, ColumnKind};

const TOP_VALUES: usize = 5;

// --- dataset summary ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub total_rows: u64,
    pub total_patients: u64,
    pub total_tests: u64,
    /// earliest and latest canonical date
    pub date_range: Option<(NaiveDate, NaiveDate)>,
    /// rounded to 2 decimals
    pub avg_age: Option<f64>,
    pub missing_edad: u64,
    pub unparseable_dates: u64,
}

pub fn summary(snapshot: &FactSnapshot) -> Summary {
    let rows = snapshot.rows();
    let patients: HashSet<&str> = rows.iter().map(|r| r.patient.as_str()).collect();
    let tests: HashSet<&str> = rows.iter().map(|r| r.test.as_str()).collect();
    let dates = rows.iter().filter_map(|r| r.date);
    let date_range = dates.clone().min().zip(dates.max());
    let ages: Vec<i64> = rows.iter().filter_map(|r| r.age).collect();
    let avg_age = (!ages.is_empty()).then(|| round2(ages.iter().sum::<i64>() as f64 / ages.len() as f64));
    Summary {
        total_rows: rows.len() as u64,
        total_patients: patients.len() as u64,
        total_tests: tests.len() as u64,
        date_range,
        avg_age,
        missing_edad: (rows.len() - ages.len()) as u64,
        unparseable_dates: snapshot.unparseable_dates() as u64,
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// --- cohort column stats ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub column: String,
    pub missing: u64,
    pub unique: u64,
    pub numeric: Option<NumericSummary>,
    /// categorical and text columns only
    pub top_values: Option<Vec<FrequencyEntry>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortStats {
    pub total_rows: u64,
    pub columns: Vec<ColumnStats>,
}

/// Per-column profile of the rows matching `filter`.
pub fn cohort_stats(snapshot: &FactSnapshot, filter: &CompiledFilter) -> Result<CohortStats> {
    let batch = snapshot.to_record_batch()?;
    let mask = filter.filter.evaluate(&batch)?;
    let cohort: Vec<&FactRow> = snapshot
        .rows()
        .iter()
        .enumerate()
        .filter(|(i, _)| mask.value(*i))
        .map(|(_, r)| r)
        .collect();
    let columns: Vec<Column> = Column::all().collect();
    let stats = columns.par_iter().map(|&c| column_stats(&cohort, c)).collect();
    tracing::debug!(rows = cohort.len(), "cohort stats computed");
    Ok(CohortStats { total_rows: cohort.len() as u64, columns: stats })
}

fn column_stats(rows: &[&FactRow], column: Column) -> ColumnStats {
    let mut freq = FrequencyCounter::new();
    let mut numeric = NumericAccumulator::new();
    let mut missing = 0u64;
    for r in rows {
        match cell_text(r, column) {
            Some(v) => {
                if column.kind() == ColumnKind::Numeric {
                    if let Ok(x) = v.parse::<f64>() {
                        numeric.add(x);
                    }
                }
                freq.add(&v);
            }
            None => missing += 1,
        }
    }
    let unique = freq.distinct() as u64;
    let (numeric, top_values) = match column.kind() {
        ColumnKind::Numeric => (numeric.finish(), None),
        ColumnKind::Date => (None, None),
        ColumnKind::Categorical | ColumnKind::Text => (None, (freq.total() > 0).then(|| freq.top_n(TOP_VALUES))),
    };
    ColumnStats { column: column.name().into(), missing, unique, numeric, top_values }
}

// dates are compared in canonical form; unparseable ones count as missing
fn cell_text(r: &FactRow, column: Column) -> Option<String> {
    match column {
        Column::Patient => Some(r.patient.clone()),
        Column::Sex => r.sex.clone(),
        Column::Age => r.age.map(|a| a.to_string()),
        Column::Test => Some(r.test.clone()),
        Column::Result => r.result.as_raw().map(str::to_owned),
        Column::Service => r.service.clone(),
        Column::Date => r.date.map(|d| d.to_string()),
    }
}

// --- single test ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStats {
    pub test: String,
    pub total: u64,
    pub missing_results: u64,
    /// result values, most frequent first
    pub values: Vec<FrequencyEntry>,
    /// over the results that parse as numbers
    pub numeric_summary: Option<NumericSummary>,
}

/// `None` when no row carries `test`.
pub fn test_stats(snapshot: &FactSnapshot, test: &str) -> Option<TestStats> {
    let mut freq = FrequencyCounter::new();
    let mut numeric = NumericAccumulator::new();
    let mut total = 0u64;
    let mut missing_results = 0u64;
    for r in snapshot.rows().iter().filter(|r| r.test == test) {
        total += 1;
        match &r.result {
            ResultValue::Numeric { value, raw } => {
                numeric.add(*value);
                freq.add(raw);
            }
            ResultValue::Text(s) => freq.add(s),
            ResultValue::Missing => missing_results += 1,
        }
    }
    if total == 0 {
        return None;
    }
    Some(TestStats {
        test: test.into(),
        total,
        missing_results,
        values: freq.ranked(),
        numeric_summary: numeric.finish(),
    })
}

// --- co-ordering ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoorderedPair {
    pub test_a: String,
    pub test_b: String,
    pub co_occurrences: u64,
}

/// Test pairs ordered for the same patient on the same day, most frequent first.
///
/// Counted per pair of fact rows, so a test entered twice that day counts twice.
/// Pairs are reported with `test_a < test_b`; undated rows never pair.
pub fn top_coordered_pairs(snapshot: &FactSnapshot, limit: usize) -> Vec<CoorderedPair> {
    let mut days: BTreeMap<(&str, NaiveDate), BTreeMap<&str, u64>> = BTreeMap::new();
    for r in snapshot.rows() {
        if let Some(d) = r.date {
            *days.entry((r.patient.as_str(), d)).or_default().entry(r.test.as_str()).or_default() += 1;
        }
    }
    let mut pairs: BTreeMap<(&str, &str), u64> = BTreeMap::new();
    for tests in days.values() {
        let tests: Vec<(&str, u64)> = tests.iter().map(|(t, c)| (*t, *c)).collect();
        for (i, (a, ca)) in tests.iter().enumerate() {
            for (b, cb) in &tests[i + 1..] {
                *pairs.entry((*a, *b)).or_default() += ca * cb;
            }
        }
    }
    let mut out: Vec<CoorderedPair> = pairs
        .into_iter()
        .map(|((a, b), n)| CoorderedPair { test_a: a.into(), test_b: b.into(), co_occurrences: n })
        .collect();
    // stable sort keeps (a, b) order among ties
    out.sort_by(|x, y| y.co_occurrences.cmp(&x.co_occurrences));
    out.truncate(limit);
    out
}

// --- repeats / panels ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatedTest {
    pub test: String,
    /// patients with this test on more than one day
    pub patients: u64,
    pub total_repeats: u64,
    pub max_repeat_count: u64,
}

pub fn top_repeated_tests(views: &DerivedViews, limit: usize) -> Vec<RepeatedTest> {
    let mut by_test: BTreeMap<&str, RepeatedTest> = BTreeMap::new();
    for r in views.repeats() {
        let e = by_test.entry(r.test.as_str()).or_insert_with(|| RepeatedTest {
            test: r.test.clone(),
            patients: 0,
            total_repeats: 0,
            max_repeat_count: 0,
        });
        e.patients += 1;
        e.total_repeats += r.repeat_count;
        e.max_repeat_count = e.max_repeat_count.max(r.repeat_count);
    }
    let mut out: Vec<RepeatedTest> = by_test.into_values().collect();
    out.sort_by(|a, b| b.patients.cmp(&a.patients).then(b.total_repeats.cmp(&a.total_repeats)));
    out.truncate(limit);
    out
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelDistribution {
    pub total_panels: u64,
    pub patients_with_panels: u64,
    pub avg_tests_per_day: Option<f64>,
    pub max_tests_per_day: u64,
    /// (n_tests, panels with that many tests), ascending by n_tests
    pub histogram: Vec<(u64, u64)>,
}

pub fn panel_distribution(views: &DerivedViews) -> PanelDistribution {
    let panels = views.panels();
    let mut histogram: BTreeMap<u64, u64> = BTreeMap::new();
    let mut patients = BTreeSet::new();
    let mut sum = 0u64;
    for p in panels {
        *histogram.entry(p.n_tests).or_default() += 1;
        patients.insert(p.patient.as_str());
        sum += p.n_tests;
    }
    PanelDistribution {
        total_panels: panels.len() as u64,
        patients_with_panels: patients.len() as u64,
        avg_tests_per_day: (!panels.is_empty()).then(|| round2(sum as f64 / panels.len() as f64)),
        max_tests_per_day: histogram.keys().next_back().copied().unwrap_or(0),
        histogram: histogram.into_iter().collect(),
    }
}
