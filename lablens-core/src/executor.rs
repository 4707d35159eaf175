use std::sync::Arc;

use arrow::compute::{filter_record_batch, lexsort_to_indices, take_record_batch, SortColumn, SortOptions};
use arrow::record_batch::RecordBatch;
use lablens_common::{QueryConfig, Result, ValidationError};
use serde::{Deserialize, Serialize};

use crate::filter::{CompiledFilter, Filter, Scalar};
use crate::schema::Column;
use crate::store::Published;

/// A queryable table: the fact rows or one of the derived views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    Results,
    Panels,
    Repeats,
}

const PANEL_COLUMNS: &[&str] = &["numorden", "Date", "n_tests"];
const REPEAT_COLUMNS: &[&str] = &["numorden", "nombre", "repeat_count", "first_date", "last_date", "days_span"];

impl Relation {
    pub fn table_name(self) -> &'static str {
        match self {
            Relation::Results => "results",
            Relation::Panels => "panels",
            Relation::Repeats => "repeats",
        }
    }

    /// Columns that filters and sorts may name on this relation.
    /// `tests_list` on panels is a list column and is neither.
    pub fn columns(self) -> Vec<&'static str> {
        match self {
            Relation::Results => Column::all().map(Column::name).collect(),
            Relation::Panels => PANEL_COLUMNS.to_vec(),
            Relation::Repeats => REPEAT_COLUMNS.to_vec(),
        }
    }

    pub fn has_column(self, name: &str) -> bool {
        self.columns().iter().any(|c| *c == name)
    }
}

impl std::fmt::Display for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn parse(s: &str) -> std::result::Result<Self, ValidationError> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ASC" => Ok(SortOrder::Asc),
            "DESC" => Ok(SortOrder::Desc),
            _ => Err(ValidationError::InvalidOrder(s.to_owned())),
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Paging and ordering as requested by a caller. Unset fields fall back to `QueryConfig`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub order: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOptions {
    pub limit: usize,
    pub offset: usize,
    pub sort: Option<(&'static str, SortOrder)>,
}

impl QueryOptions {
    /// Validate against `relation` and clamp the limit to `1..=max_limit`.
    pub fn resolve(&self, relation: Relation, config: &QueryConfig) -> std::result::Result<ResolvedOptions, ValidationError> {
        let order = SortOrder::parse(self.order.as_deref().unwrap_or(&config.default_order))?;
        let columns = relation.columns();
        let sort = match &self.sort_by {
            Some(name) => {
                let col = columns.iter().copied().find(|c| *c == name.as_str()).ok_or_else(|| ValidationError::InvalidSort {
                    column: name.clone(),
                    relation: relation.table_name(),
                })?;
                Some((col, order))
            }
            // the configured default only applies where the relation has that column
            None => columns.iter().copied().find(|c| *c == config.default_sort).map(|c| (c, order)),
        };
        let max = config.max_limit.max(1);
        let limit = self.limit.unwrap_or(config.default_limit).clamp(1, max);
        Ok(ResolvedOptions { limit, offset: self.offset, sort })
    }
}

/// One page of a cohort query.
#[derive(Debug, Clone)]
pub struct CohortPage {
    pub rows: RecordBatch,
    /// rows in the relation before filtering
    pub total: usize,
    /// rows matching the filter, before paging
    pub filtered: usize,
    pub limit: usize,
    pub offset: usize,
}

/// Runs compiled filters against a relation.
///
/// External engines implement this with `CompiledFilter::predicate` and `args`
/// (see `select_sql`); `MemoryExecutor` evaluates the typed filter directly.
pub trait QueryExecutor {
    fn count(&self, relation: Relation, filter: &CompiledFilter) -> Result<usize>;
    fn select(&self, relation: Relation, filter: &CompiledFilter, options: &QueryOptions) -> Result<CohortPage>;
}

/// Parameterized statement for an external SQL engine. Only registry names and
/// placeholders are spliced in; every value travels in the returned args.
pub fn select_sql(relation: Relation, filter: &CompiledFilter, options: &ResolvedOptions) -> (String, Vec<Scalar>) {
    let mut sql = format!("SELECT * FROM {} WHERE {}", relation.table_name(), filter.predicate);
    let mut args = filter.args.clone();
    if let Some((col, order)) = options.sort {
        // registry names, spelled the same way the predicate spells them
        sql.push_str(&format!(" ORDER BY {col} {}", order.keyword()));
    }
    sql.push_str(" LIMIT ? OFFSET ?");
    args.push(Scalar::Int(options.limit as i64));
    args.push(Scalar::Int(options.offset as i64));
    (sql, args)
}

/// In-process executor over one published generation.
pub struct MemoryExecutor {
    published: Arc<Published>,
    config: QueryConfig,
    results: RecordBatch,
    panels: RecordBatch,
    repeats: RecordBatch,
}

impl MemoryExecutor {
    pub fn new(published: Arc<Published>, config: QueryConfig) -> Result<Self> {
        let results = published.snapshot.to_record_batch()?;
        let panels = published.views.panels_batch()?;
        let repeats = published.views.repeats_batch()?;
        Ok(Self { published, config, results, panels, repeats })
    }

    pub fn generation(&self) -> u64 {
        self.published.generation
    }

    pub fn batch(&self, relation: Relation) -> &RecordBatch {
        match relation {
            Relation::Results => &self.results,
            Relation::Panels => &self.panels,
            Relation::Repeats => &self.repeats,
        }
    }

    fn matching(&self, relation: Relation, filter: &Filter) -> Result<RecordBatch> {
        for p in &filter.predicates {
            let name = p.column().name();
            if !relation.has_column(name) {
                return Err(ValidationError::NotInRelation { column: name.into(), relation: relation.table_name() }.into());
            }
        }
        let batch = self.batch(relation);
        let mask = filter.evaluate(batch)?;
        Ok(filter_record_batch(batch, &mask)?)
    }
}

impl QueryExecutor for MemoryExecutor {
    fn count(&self, relation: Relation, filter: &CompiledFilter) -> Result<usize> {
        Ok(self.matching(relation, &filter.filter)?.num_rows())
    }

    fn select(&self, relation: Relation, filter: &CompiledFilter, options: &QueryOptions) -> Result<CohortPage> {
        let resolved = options.resolve(relation, &self.config)?;
        let matched = self.matching(relation, &filter.filter)?;
        let filtered = matched.num_rows();
        let sorted = match resolved.sort {
            Some((col, order)) => sort_batch(&matched, col, order)?,
            None => matched,
        };
        let start = resolved.offset.min(filtered);
        let len = resolved.limit.min(filtered - start);
        tracing::debug!(relation = %relation, filtered, offset = start, len, "cohort page");
        Ok(CohortPage {
            rows: sorted.slice(start, len),
            total: self.batch(relation).num_rows(),
            filtered,
            limit: resolved.limit,
            offset: resolved.offset,
        })
    }
}

// nulls go last in either direction; ties fall back to patient id
fn sort_batch(batch: &RecordBatch, column: &str, order: SortOrder) -> Result<RecordBatch> {
    let schema = batch.schema();
    let options = SortOptions { descending: order == SortOrder::Desc, nulls_first: false };
    let mut keys = vec![SortColumn { values: batch.column(schema.index_of(column)?).clone(), options: Some(options) }];
    if column != Column::Patient.name() {
        if let Ok(idx) = schema.index_of(Column::Patient.name()) {
            keys.push(SortColumn { values: batch.column(idx).clone(), options: Some(SortOptions::default()) });
        }
    }
    let indices = lexsort_to_indices(&keys, None)?;
    Ok(take_record_batch(batch, &indices)?)
}
