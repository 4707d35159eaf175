use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use arrow::array::{ArrayRef, Date32Builder, Int64Builder, ListBuilder, StringBuilder};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use lablens_common::{PipelineError, Result};
use serde::{Deserialize, Serialize};

use crate::dates::to_epoch_days;
use crate::fact::{FactRow, FactSnapshot};

/// Tests ordered for one patient on one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Panel {
    pub patient: String,
    pub date: NaiveDate,
    /// fact rows for the day, duplicates of the same test included
    pub n_tests: u64,
    /// distinct test names, sorted
    pub tests: Vec<String>,
}

/// A test recorded for one patient on more than one distinct day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repeat {
    pub patient: String,
    pub test: String,
    pub repeat_count: u64,
    pub first_date: NaiveDate,
    pub last_date: NaiveDate,
    pub days_span: i64,
}

/// Panels and Repeats computed from one fact snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivedViews {
    panels: Vec<Panel>,
    repeats: Vec<Repeat>,
}

/// Rebuild both derived views from `snapshot`.
///
/// Rows without a canonical date take no part in either view. The output is a
/// pure function of the snapshot's rows: same rows, same views.
pub fn rebuild_aggregates(snapshot: &FactSnapshot) -> std::result::Result<DerivedViews, PipelineError> {
    let rows = snapshot.rows();
    validate_rows(rows)?;
    let (panels, repeats) = rayon::join(|| build_panels(rows), || build_repeats(rows));
    tracing::debug!(
        rows = rows.len(),
        undated = snapshot.unparseable_dates(),
        panels = panels.len(),
        repeats = repeats.len(),
        "aggregates rebuilt"
    );
    Ok(DerivedViews { panels, repeats })
}

fn validate_rows(rows: &[FactRow]) -> std::result::Result<(), PipelineError> {
    for (row, r) in rows.iter().enumerate() {
        if r.patient.trim().is_empty() {
            return Err(PipelineError::InvalidSnapshot { row, detail: "empty patient identifier".into() });
        }
        if r.test.trim().is_empty() {
            return Err(PipelineError::InvalidSnapshot { row, detail: "empty test name".into() });
        }
    }
    Ok(())
}

pub fn build_panels(rows: &[FactRow]) -> Vec<Panel> {
    let mut groups: BTreeMap<(&str, NaiveDate), (u64, BTreeSet<&str>)> = BTreeMap::new();
    for r in rows {
        let Some(date) = r.date else { continue };
        let entry = groups.entry((r.patient.as_str(), date)).or_default();
        entry.0 += 1;
        entry.1.insert(r.test.as_str());
    }
    groups
        .into_iter()
        .map(|((patient, date), (n_tests, tests))| Panel {
            patient: patient.to_owned(),
            date,
            n_tests,
            tests: tests.into_iter().map(str::to_owned).collect(),
        })
        .collect()
}

pub fn build_repeats(rows: &[FactRow]) -> Vec<Repeat> {
    let mut groups: BTreeMap<(&str, &str), BTreeSet<NaiveDate>> = BTreeMap::new();
    for r in rows {
        let Some(date) = r.date else { continue };
        groups.entry((r.patient.as_str(), r.test.as_str())).or_default().insert(date);
    }
    let mut out: Vec<Repeat> = groups
        .into_iter()
        .filter(|(_, dates)| dates.len() > 1)
        .filter_map(|((patient, test), dates)| {
            let first_date = *dates.first()?;
            let last_date = *dates.last()?;
            Some(Repeat {
                patient: patient.to_owned(),
                test: test.to_owned(),
                repeat_count: dates.len() as u64,
                first_date,
                last_date,
                days_span: (last_date - first_date).num_days(),
            })
        })
        .collect();
    // most repeated first; key order breaks ties so the output is total
    out.sort_by(|a, b| {
        b.repeat_count
            .cmp(&a.repeat_count)
            .then(b.days_span.cmp(&a.days_span))
            .then_with(|| a.patient.cmp(&b.patient))
            .then_with(|| a.test.cmp(&b.test))
    });
    out
}

impl DerivedViews {
    pub fn panels(&self) -> &[Panel] {
        &self.panels
    }

    pub fn repeats(&self) -> &[Repeat] {
        &self.repeats
    }

    /// panels of one patient, by date
    pub fn patient_panels(&self, patient: &str) -> &[Panel] {
        let start = self.panels.partition_point(|p| p.patient.as_str() < patient);
        let end = self.panels.partition_point(|p| p.patient.as_str() <= patient);
        &self.panels[start..end]
    }

    /// repeats of one patient, most repeated first
    pub fn patient_repeats(&self, patient: &str) -> Vec<&Repeat> {
        self.repeats.iter().filter(|r| r.patient == patient).collect()
    }

    pub fn panels_batch(&self) -> Result<RecordBatch> {
        let n = self.panels.len();
        let mut patient = StringBuilder::with_capacity(n, n * 8);
        let mut date = Date32Builder::with_capacity(n);
        let mut n_tests = Int64Builder::with_capacity(n);
        let mut tests = ListBuilder::new(StringBuilder::new());
        for p in &self.panels {
            patient.append_value(&p.patient);
            date.append_value(to_epoch_days(p.date));
            n_tests.append_value(p.n_tests as i64);
            for t in &p.tests {
                tests.values().append_value(t);
            }
            tests.append(true);
        }
        let columns: Vec<(&str, ArrayRef)> = vec![
            ("numorden", Arc::new(patient.finish())),
            ("Date", Arc::new(date.finish())),
            ("n_tests", Arc::new(n_tests.finish())),
            ("tests_list", Arc::new(tests.finish())),
        ];
        Ok(RecordBatch::try_from_iter(columns)?)
    }

    pub fn repeats_batch(&self) -> Result<RecordBatch> {
        let n = self.repeats.len();
        let mut patient = StringBuilder::with_capacity(n, n * 8);
        let mut test = StringBuilder::with_capacity(n, n * 8);
        let mut count = Int64Builder::with_capacity(n);
        let mut first = Date32Builder::with_capacity(n);
        let mut last = Date32Builder::with_capacity(n);
        let mut span = Int64Builder::with_capacity(n);
        for r in &self.repeats {
            patient.append_value(&r.patient);
            test.append_value(&r.test);
            count.append_value(r.repeat_count as i64);
            first.append_value(to_epoch_days(r.first_date));
            last.append_value(to_epoch_days(r.last_date));
            span.append_value(r.days_span);
        }
        let columns: Vec<(&str, ArrayRef)> = vec![
            ("numorden", Arc::new(patient.finish())),
            ("nombre", Arc::new(test.finish())),
            ("repeat_count", Arc::new(count.finish())),
            ("first_date", Arc::new(first.finish())),
            ("last_date", Arc::new(last.finish())),
            ("days_span", Arc::new(span.finish())),
        ];
        Ok(RecordBatch::try_from_iter(columns)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int64Array, ListArray, StringArray};

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate { NaiveDate::from_ymd_opt(y, m, d).unwrap() }

    fn scenario() -> FactSnapshot {
        FactSnapshot::from_rows(vec![
            FactRow::new("P1", "GLUC", "01/05/2024"),
            FactRow::new("P1", "GLUC", "2024-05-02"),
            FactRow::new("P1", "UREA", "01/05/2024"),
        ])
    }

    #[test]
    fn mixed_encodings_scenario() {
        let views = rebuild_aggregates(&scenario()).unwrap();
        assert_eq!(
            views.panels(),
            &[
                Panel { patient: "P1".into(), date: ymd(2024, 5, 1), n_tests: 2, tests: vec!["GLUC".into(), "UREA".into()] },
                Panel { patient: "P1".into(), date: ymd(2024, 5, 2), n_tests: 1, tests: vec!["GLUC".into()] },
            ]
        );
        assert_eq!(
            views.repeats(),
            &[Repeat {
                patient: "P1".into(),
                test: "GLUC".into(),
                repeat_count: 2,
                first_date: ymd(2024, 5, 1),
                last_date: ymd(2024, 5, 2),
                days_span: 1,
            }]
        );
    }

    #[test]
    fn panel_count_includes_same_day_duplicates() {
        let snap = FactSnapshot::from_rows(vec![
            FactRow::new("P1", "GLUC", "01/05/2024"),
            FactRow::new("P1", "GLUC", "01-05-2024"),
            FactRow::new("P1", "HB", "2024-05-01"),
        ]);
        let views = rebuild_aggregates(&snap).unwrap();
        assert_eq!(views.panels().len(), 1);
        assert_eq!(views.panels()[0].n_tests, 3);
        assert_eq!(views.panels()[0].tests, vec!["GLUC", "HB"]);
        // same test twice on one day is not a repeat
        assert!(views.repeats().is_empty());
    }

    #[test]
    fn undated_rows_are_excluded() {
        let snap = FactSnapshot::from_rows(vec![
            FactRow::new("P1", "GLUC", "not a date"),
            FactRow::new("P1", "GLUC", "2024-05-01"),
            FactRow::new("P1", "GLUC", "31/02/2024"),
        ]);
        let views = rebuild_aggregates(&snap).unwrap();
        assert_eq!(views.panels().len(), 1);
        assert_eq!(views.panels()[0].n_tests, 1);
        assert!(views.repeats().is_empty());
    }

    #[test]
    fn repeats_only_above_one_and_count_distinct_dates() {
        let snap = FactSnapshot::from_rows(vec![
            FactRow::new("P2", "HB", "01/01/2024"),
            FactRow::new("P2", "HB", "01/01/2024"),
            FactRow::new("P2", "HB", "10/01/2024"),
            FactRow::new("P2", "HB", "2024-01-20"),
            FactRow::new("P3", "HB", "01/01/2024"),
            FactRow::new("P1", "GLUC", "01/01/2024"),
            FactRow::new("P1", "GLUC", "05/01/2024"),
            FactRow::new("P1", "UREA", "01/01/2024"),
            FactRow::new("P1", "UREA", "31/01/2024"),
        ]);
        let views = rebuild_aggregates(&snap).unwrap();
        let keys: Vec<(&str, &str, u64, i64)> = views
            .repeats()
            .iter()
            .map(|r| (r.patient.as_str(), r.test.as_str(), r.repeat_count, r.days_span))
            .collect();
        assert_eq!(keys, vec![("P2", "HB", 3, 19), ("P1", "UREA", 2, 30), ("P1", "GLUC", 2, 4)]);
        assert!(views.repeats().iter().all(|r| r.repeat_count > 1));
    }

    #[test]
    fn rebuild_is_idempotent() {
        let snap = scenario();
        let a = rebuild_aggregates(&snap).unwrap();
        let b = rebuild_aggregates(&snap).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.panels_batch().unwrap(), b.panels_batch().unwrap());
        assert_eq!(a.repeats_batch().unwrap(), b.repeats_batch().unwrap());
    }

    #[test]
    fn invalid_rows_fail_the_rebuild() {
        let snap = FactSnapshot::from_rows(vec![FactRow::new("P1", "GLUC", "01/05/2024"), FactRow::new(" ", "GLUC", "01/05/2024")]);
        assert!(matches!(rebuild_aggregates(&snap), Err(PipelineError::InvalidSnapshot { row: 1, .. })));
        let snap = FactSnapshot::from_rows(vec![FactRow::new("P1", "", "01/05/2024")]);
        assert!(matches!(rebuild_aggregates(&snap), Err(PipelineError::InvalidSnapshot { row: 0, .. })));
    }

    #[test]
    fn empty_snapshot_gives_empty_views() {
        let views = rebuild_aggregates(&FactSnapshot::default()).unwrap();
        assert!(views.panels().is_empty() && views.repeats().is_empty());
        assert_eq!(views.panels_batch().unwrap().num_rows(), 0);
    }

    #[test]
    fn patient_lookups() {
        let snap = FactSnapshot::from_rows(vec![
            FactRow::new("P2", "HB", "01/01/2024"),
            FactRow::new("P1", "GLUC", "02/01/2024"),
            FactRow::new("P1", "GLUC", "01/01/2024"),
            FactRow::new("P3", "HB", "01/01/2024"),
        ]);
        let views = rebuild_aggregates(&snap).unwrap();
        let p1: Vec<NaiveDate> = views.patient_panels("P1").iter().map(|p| p.date).collect();
        assert_eq!(p1, vec![ymd(2024, 1, 1), ymd(2024, 1, 2)]);
        assert_eq!(views.patient_panels("P9").len(), 0);
        assert_eq!(views.patient_repeats("P1").len(), 1);
        assert!(views.patient_repeats("P2").is_empty());
    }

    #[test]
    fn panels_batch_layout() {
        let views = rebuild_aggregates(&scenario()).unwrap();
        let batch = views.panels_batch().unwrap();
        assert_eq!(batch.num_rows(), 2);
        let n = batch.column(2).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(n.value(0), 2);
        let lists = batch.column(3).as_any().downcast_ref::<ListArray>().unwrap();
        let first = lists.value(0);
        let names = first.as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!((names.value(0), names.value(1)), ("GLUC", "UREA"));
        let repeats = views.repeats_batch().unwrap();
        assert_eq!(repeats.schema().field(5).name(), "days_span");
        assert_eq!(repeats.column(5).as_any().downcast_ref::<Int64Array>().unwrap().value(0), 1);
        assert_eq!(repeats.column(0).null_count(), 0);
    }
}
