pub mod aggregate;
pub mod dates;
pub mod executor;
pub mod fact;
pub mod filter;
pub mod profile;
pub mod reader;
pub mod scanner;
pub mod schema;
pub mod stats;
pub mod store;

pub use lablens_common::{LabLensError, PipelineError, Result, ValidationError};

pub use aggregate::{rebuild_aggregates, DerivedViews, Panel, Repeat};
pub use dates::{normalize_date, DateFormat};
pub use executor::{select_sql, CohortPage, MemoryExecutor, QueryExecutor, QueryOptions, Relation, SortOrder};
pub use fact::{FactRow, FactSnapshot, FactSource, ParquetFactSource, ResultValue};
pub use filter::{compile, CompiledFilter, FilterCondition, FilterExpression, Logic, Operator, Scalar};
pub use schema::{Column, ColumnKind};
pub use store::{Published, ViewStore};
