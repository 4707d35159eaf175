use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use lablens_common::ValidationError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Categorical,
    Numeric,
    Date,
    Text,
}

/// The queryable columns of the fact table. Nothing outside this set can be named in a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Column {
    Patient,
    Sex,
    Age,
    Test,
    Result,
    Service,
    Date,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub column: Column,
    pub name: &'static str,
    pub kind: ColumnKind,
}

const REGISTRY: [ColumnDef; 7] = [
    ColumnDef { column: Column::Patient, name: "numorden", kind: ColumnKind::Categorical },
    ColumnDef { column: Column::Sex, name: "sexo", kind: ColumnKind::Categorical },
    ColumnDef { column: Column::Age, name: "edad", kind: ColumnKind::Numeric },
    ColumnDef { column: Column::Test, name: "nombre", kind: ColumnKind::Categorical },
    ColumnDef { column: Column::Result, name: "textores", kind: ColumnKind::Text },
    ColumnDef { column: Column::Service, name: "nombre2", kind: ColumnKind::Categorical },
    ColumnDef { column: Column::Date, name: "Date", kind: ColumnKind::Date },
];

/// raw display form of the event date; present in batches but not filterable
pub const DATE_RAW_COLUMN: &str = "date_raw";

impl Column {
    pub fn all() -> impl Iterator<Item = Column> {
        REGISTRY.iter().map(|d| d.column)
    }

    pub fn def(self) -> ColumnDef {
        // REGISTRY is declared in enum order
        REGISTRY[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.def().name
    }

    pub fn kind(self) -> ColumnKind {
        self.def().kind
    }
}

impl std::fmt::Display for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// exact, case-sensitive lookup; `None` for anything outside the allow-list
pub fn lookup(name: &str) -> Option<ColumnDef> {
    REGISTRY.iter().find(|d| d.name == name).copied()
}

/// resolve a user-supplied column name for condition `index`
pub fn resolve(index: usize, name: &str) -> Result<ColumnDef, ValidationError> {
    lookup(name).ok_or_else(|| ValidationError::UnknownColumn { index, column: name.to_owned() })
}

pub fn fact_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(Column::Patient.name(), DataType::Utf8, false),
        Field::new(Column::Sex.name(), DataType::Utf8, true),
        Field::new(Column::Age.name(), DataType::Int64, true),
        Field::new(Column::Test.name(), DataType::Utf8, false),
        Field::new(Column::Result.name(), DataType::Utf8, true),
        Field::new(Column::Service.name(), DataType::Utf8, true),
        Field::new(Column::Date.name(), DataType::Date32, true),
        Field::new(DATE_RAW_COLUMN, DataType::Utf8, true),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_order_matches_enum() {
        for (i, c) in Column::all().enumerate() {
            assert_eq!(c as usize, i);
            assert_eq!(c.def().column, c);
        }
    }

    #[test]
    fn resolve_known_and_unknown() {
        assert_eq!(resolve(0, "edad").unwrap().kind, ColumnKind::Numeric);
        assert_eq!(resolve(0, "Date").unwrap().column, Column::Date);
        let err = resolve(3, "password").unwrap_err();
        assert_eq!(err, ValidationError::UnknownColumn { index: 3, column: "password".into() });
        // lookup is case-sensitive
        assert!(lookup("EDAD").is_none());
        assert!(lookup(DATE_RAW_COLUMN).is_none());
    }

    #[test]
    fn fact_schema_covers_registry() {
        let schema = fact_schema();
        for c in Column::all() {
            assert!(schema.index_of(c.name()).is_ok(), "missing {c}");
        }
        assert_eq!(schema.field_with_name("Date").unwrap().data_type(), &DataType::Date32);
    }
}
