use std::cmp::Ordering;

use arrow::array::{Array, ArrayRef, BooleanArray, BooleanBuilder, Date32Array, Float64Array, Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use lablens_common::{LabLensError, Result, ValidationError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::dates::{normalize_date, to_epoch_days};
use crate::schema::{self, Column, ColumnDef, ColumnKind};

// --- wire form ---

/// One user-supplied condition, exactly as received. Nothing here is trusted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterCondition {
    pub column: String,
    pub operator: String,
    #[serde(default)]
    pub value: Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterExpression {
    #[serde(default)]
    pub conditions: Vec<FilterCondition>,
    #[serde(default = "default_logic")]
    pub logic: String,
}

fn default_logic() -> String {
    "AND".into()
}

impl FilterExpression {
    pub fn new(conditions: Vec<FilterCondition>, logic: Logic) -> Self {
        Self { conditions, logic: logic.keyword().into() }
    }

    pub fn from_json(s: &str) -> std::result::Result<Self, ValidationError> {
        serde_json::from_str(s).map_err(|e| ValidationError::Malformed(e.to_string()))
    }
}

impl FilterCondition {
    pub fn new(column: &str, operator: &str, value: Json) -> Self {
        Self { column: column.into(), operator: operator.into(), value }
    }
}

// --- typed form ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Logic { And, Or }

impl Logic {
    pub fn parse(s: &str) -> std::result::Result<Self, ValidationError> {
        if s.eq_ignore_ascii_case("AND") {
            Ok(Logic::And)
        } else if s.eq_ignore_ascii_case("OR") {
            Ok(Logic::Or)
        } else {
            Err(ValidationError::UnknownLogic(s.to_owned()))
        }
    }
    pub fn keyword(self) -> &'static str {
        match self { Logic::And => "AND", Logic::Or => "OR" }
    }
}

/// The closed operator set. `Operator::parse` and `Predicate::to_sql` are the only
/// places operator semantics live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator { Eq, Ne, Gt, Lt, Ge, Le, In, Contains }

impl Operator {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "eq" => Operator::Eq,
            "ne" => Operator::Ne,
            "gt" => Operator::Gt,
            "lt" => Operator::Lt,
            "ge" | "gte" => Operator::Ge,
            "le" | "lte" => Operator::Le,
            "in" => Operator::In,
            "contains" => Operator::Contains,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Operator::Eq => "eq", Operator::Ne => "ne", Operator::Gt => "gt", Operator::Lt => "lt",
            Operator::Ge => "ge", Operator::Le => "le", Operator::In => "in", Operator::Contains => "contains",
        }
    }

    fn cmp_op(self) -> Option<CmpOp> {
        match self {
            Operator::Eq => Some(CmpOp::Eq), Operator::Ne => Some(CmpOp::Ne),
            Operator::Gt => Some(CmpOp::Gt), Operator::Lt => Some(CmpOp::Lt),
            Operator::Ge => Some(CmpOp::Ge), Operator::Le => Some(CmpOp::Le),
            Operator::In | Operator::Contains => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp { Eq, Ne, Lt, Le, Gt, Ge }

impl CmpOp {
    pub fn sql(self) -> &'static str {
        match self { CmpOp::Eq => "=", CmpOp::Ne => "<>", CmpOp::Lt => "<", CmpOp::Le => "<=", CmpOp::Gt => ">", CmpOp::Ge => ">=" }
    }
    fn matches(self, ord: Ordering) -> bool {
        match self {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Ne => ord != Ordering::Equal,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Ge => ord != Ordering::Less,
        }
    }
}

/// A bound argument. Serializes to its plain JSON form for external executors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
}

/// Condition value after shape validation, one variant per operator category.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionValue {
    Null,
    Scalar(Scalar),
    List(Vec<Scalar>),
    Pattern(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    IsNull(Column),
    IsNotNull(Column),
    Compare { column: Column, op: CmpOp, value: Scalar },
    In { column: Column, values: Vec<Scalar> },
    Contains { column: Column, needle: String },
}

/// A fully validated filter. Only obtainable through `compile`.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub predicates: Vec<Predicate>,
    pub logic: Logic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter {
    /// predicate text with `?` placeholders only, never values
    pub predicate: String,
    /// positional arguments, one per placeholder, in order
    pub args: Vec<Scalar>,
    pub filter: Filter,
}

pub const TAUTOLOGY: &str = "TRUE";

// --- compilation ---

/// Compile a filter expression into a parameterized predicate plus argument list.
///
/// Every condition is validated before any text is produced; the first invalid
/// condition aborts compilation.
pub fn compile(expr: &FilterExpression) -> std::result::Result<CompiledFilter, ValidationError> {
    let logic = Logic::parse(&expr.logic)?;
    let predicates = expr
        .conditions
        .iter()
        .enumerate()
        .map(|(i, c)| bind_condition(i, c))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let filter = Filter { predicates, logic };
    let (predicate, args) = filter.to_sql();
    Ok(CompiledFilter { predicate, args, filter })
}

fn bind_condition(index: usize, cond: &FilterCondition) -> std::result::Result<Predicate, ValidationError> {
    let def = schema::resolve(index, &cond.column)?;
    let op = Operator::parse(&cond.operator)
        .ok_or_else(|| ValidationError::UnknownOperator { index, operator: cond.operator.clone() })?;
    let value = classify_value(index, op, def, &cond.value)?;
    let column = def.column;
    Ok(match (op, value) {
        (Operator::Eq, ConditionValue::Null) => Predicate::IsNull(column),
        (Operator::Ne, ConditionValue::Null) => Predicate::IsNotNull(column),
        (Operator::In, ConditionValue::List(values)) => Predicate::In { column, values },
        (Operator::Contains, ConditionValue::Pattern(needle)) => Predicate::Contains { column, needle },
        (op, ConditionValue::Scalar(value)) => match op.cmp_op() {
            Some(op) => Predicate::Compare { column, op, value },
            None => return Err(shape(index, op, "a different value shape")),
        },
        (op, _) => return Err(shape(index, op, "a different value shape")),
    })
}

fn shape(index: usize, op: Operator, expected: &'static str) -> ValidationError {
    ValidationError::ShapeMismatch { index, operator: op.name().into(), expected }
}

/// reject operator/value shape mismatches, then coerce scalars to the column kind
fn classify_value(index: usize, op: Operator, def: ColumnDef, value: &Json) -> std::result::Result<ConditionValue, ValidationError> {
    let null_not_allowed = || ValidationError::NullNotAllowed { index, operator: op.name().into() };
    match op {
        Operator::Eq | Operator::Ne => match value {
            Json::Null => Ok(ConditionValue::Null),
            Json::Array(_) | Json::Object(_) => Err(shape(index, op, "a scalar or null")),
            v => coerce_scalar(index, def, v).map(ConditionValue::Scalar),
        },
        Operator::Gt | Operator::Lt | Operator::Ge | Operator::Le => match value {
            Json::Null => Err(null_not_allowed()),
            Json::Array(_) | Json::Object(_) => Err(shape(index, op, "a scalar")),
            v => coerce_scalar(index, def, v).map(ConditionValue::Scalar),
        },
        Operator::In => match value {
            Json::Null => Err(null_not_allowed()),
            Json::Array(items) if items.is_empty() => Err(ValidationError::EmptyInList { index }),
            Json::Array(items) => items
                .iter()
                .map(|v| match v {
                    Json::Null | Json::Array(_) | Json::Object(_) => Err(shape(index, op, "a list of non-null scalars")),
                    v => coerce_scalar(index, def, v),
                })
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(ConditionValue::List),
            _ => Err(shape(index, op, "a list")),
        },
        Operator::Contains => {
            if !matches!(def.kind, ColumnKind::Categorical | ColumnKind::Text) {
                return Err(ValidationError::UnsupportedForColumn {
                    index,
                    operator: op.name().into(),
                    column: def.name.into(),
                });
            }
            match value {
                Json::Null => Err(null_not_allowed()),
                Json::String(s) => Ok(ConditionValue::Pattern(s.clone())),
                Json::Number(n) => Ok(ConditionValue::Pattern(n.to_string())),
                Json::Bool(b) => Ok(ConditionValue::Pattern(b.to_string())),
                _ => Err(shape(index, op, "a text value")),
            }
        }
    }
}

fn coerce_scalar(index: usize, def: ColumnDef, value: &Json) -> std::result::Result<Scalar, ValidationError> {
    let invalid = |detail: String| ValidationError::InvalidValue { index, column: def.name.into(), detail };
    match (def.kind, value) {
        (ColumnKind::Numeric, Json::Number(n)) => number_scalar(n).ok_or_else(|| invalid(format!("not a finite number: {n}"))),
        (ColumnKind::Numeric, Json::String(s)) => parse_number(s).ok_or_else(|| invalid(format!("not a number: '{s}'"))),
        (ColumnKind::Numeric, v) => Err(invalid(format!("expected a number, got {v}"))),
        (ColumnKind::Date, Json::String(s)) => normalize_date(s)
            .map(Scalar::Date)
            .ok_or_else(|| ValidationError::InvalidDate { index, raw: s.clone() }),
        (ColumnKind::Date, v) => Err(invalid(format!("expected a date string, got {v}"))),
        (ColumnKind::Categorical, Json::String(s)) | (ColumnKind::Text, Json::String(s)) => Ok(Scalar::Text(s.clone())),
        (ColumnKind::Categorical, Json::Number(n)) => Ok(Scalar::Text(n.to_string())),
        // result values are mixed: keep numbers numeric so range comparisons work
        (ColumnKind::Text, Json::Number(n)) => number_scalar(n).ok_or_else(|| invalid(format!("not a finite number: {n}"))),
        (_, Json::Bool(b)) => Ok(Scalar::Text(b.to_string())),
        (_, v) => Err(invalid(format!("unsupported value {v}"))),
    }
}

fn number_scalar(n: &serde_json::Number) -> Option<Scalar> {
    if let Some(i) = n.as_i64() {
        return Some(Scalar::Int(i));
    }
    n.as_f64().filter(|f| f.is_finite()).map(Scalar::Float)
}

fn parse_number(s: &str) -> Option<Scalar> {
    let t = s.trim();
    if let Ok(i) = t.parse::<i64>() {
        return Some(Scalar::Int(i));
    }
    t.parse::<f64>().ok().filter(|f| f.is_finite()).map(Scalar::Float)
}

impl Predicate {
    pub fn column(&self) -> Column {
        match self {
            Predicate::IsNull(c) | Predicate::IsNotNull(c) => *c,
            Predicate::Compare { column, .. } | Predicate::In { column, .. } | Predicate::Contains { column, .. } => *column,
        }
    }

    fn to_sql(&self, args: &mut Vec<Scalar>) -> String {
        let col = self.column().name();
        match self {
            Predicate::IsNull(_) => format!("{col} IS NULL"),
            Predicate::IsNotNull(_) => format!("{col} IS NOT NULL"),
            Predicate::Compare { op, value, .. } => {
                args.push(value.clone());
                format!("{col} {} ?", op.sql())
            }
            Predicate::In { values, .. } => {
                args.extend(values.iter().cloned());
                let placeholders = vec!["?"; values.len()].join(", ");
                format!("{col} IN ({placeholders})")
            }
            Predicate::Contains { needle, .. } => {
                args.push(Scalar::Text(format!("%{needle}%")));
                format!("lower({col}) like lower(?)")
            }
        }
    }
}

impl Filter {
    /// matches every row
    pub fn all() -> Self {
        Filter { predicates: Vec::new(), logic: Logic::And }
    }

    pub fn to_sql(&self) -> (String, Vec<Scalar>) {
        if self.predicates.is_empty() {
            return (TAUTOLOGY.into(), Vec::new());
        }
        let mut args = Vec::new();
        let clauses: Vec<String> = self.predicates.iter().map(|p| p.to_sql(&mut args)).collect();
        let sep = format!(" {} ", self.logic.keyword());
        (clauses.join(&sep), args)
    }

    /// Evaluate against a fact-table batch. Null cells never satisfy a comparison.
    pub fn evaluate(&self, batch: &RecordBatch) -> Result<BooleanArray> {
        let n = batch.num_rows();
        let mut masks = self.predicates.iter().map(|p| eval_predicate(p, batch));
        let Some(first) = masks.next() else {
            return Ok(BooleanArray::from(vec![true; n]));
        };
        let mut acc = first?;
        for mask in masks {
            let mask = mask?;
            acc = match self.logic {
                Logic::And => arrow::compute::and(&acc, &mask)?,
                Logic::Or => arrow::compute::or(&acc, &mask)?,
            };
        }
        Ok(acc)
    }
}

// --- evaluation on RecordBatch ---

enum Cell<'a> { Null, Int(i64), Float(f64), Text(&'a str), Date(i32) }

fn cell(arr: &ArrayRef, i: usize) -> Cell<'_> {
    if arr.is_null(i) {
        return Cell::Null;
    }
    if let Some(a) = arr.as_any().downcast_ref::<StringArray>() {
        return Cell::Text(a.value(i));
    }
    if let Some(a) = arr.as_any().downcast_ref::<Int64Array>() {
        return Cell::Int(a.value(i));
    }
    if let Some(a) = arr.as_any().downcast_ref::<Float64Array>() {
        return Cell::Float(a.value(i));
    }
    if let Some(a) = arr.as_any().downcast_ref::<Date32Array>() {
        return Cell::Date(a.value(i));
    }
    Cell::Null
}

fn column_array<'a>(batch: &'a RecordBatch, col: Column) -> Result<&'a ArrayRef> {
    let idx = batch.schema().index_of(col.name()).map_err(LabLensError::Arrow)?;
    Ok(batch.column(idx))
}

fn compare_cell(c: &Cell<'_>, v: &Scalar) -> Option<Ordering> {
    match (c, v) {
        (Cell::Null, _) => None,
        (Cell::Int(a), Scalar::Int(b)) => Some(a.cmp(b)),
        (Cell::Int(a), Scalar::Float(b)) => (*a as f64).partial_cmp(b),
        (Cell::Float(a), Scalar::Int(b)) => a.partial_cmp(&(*b as f64)),
        (Cell::Float(a), Scalar::Float(b)) => a.partial_cmp(b),
        (Cell::Text(a), Scalar::Text(b)) => Some((*a).cmp(b.as_str())),
        // mixed result column: numeric comparison only when the cell parses
        (Cell::Text(a), Scalar::Int(b)) => a.trim().parse::<f64>().ok()?.partial_cmp(&(*b as f64)),
        (Cell::Text(a), Scalar::Float(b)) => a.trim().parse::<f64>().ok()?.partial_cmp(b),
        (Cell::Date(a), Scalar::Date(b)) => Some(a.cmp(&to_epoch_days(*b))),
        _ => None,
    }
}

fn eval_predicate(pred: &Predicate, batch: &RecordBatch) -> Result<BooleanArray> {
    let arr = column_array(batch, pred.column())?;
    let n = batch.num_rows();
    let mut b = BooleanBuilder::with_capacity(n);
    match pred {
        Predicate::IsNull(_) => return Ok(arrow::compute::is_null(arr)?),
        Predicate::IsNotNull(_) => return Ok(arrow::compute::is_not_null(arr)?),
        Predicate::Compare { op, value, .. } => {
            for i in 0..n {
                let m = compare_cell(&cell(arr, i), value).map(|o| op.matches(o)).unwrap_or(false);
                b.append_value(m);
            }
        }
        Predicate::In { values, .. } => {
            for i in 0..n {
                let c = cell(arr, i);
                b.append_value(values.iter().any(|v| compare_cell(&c, v) == Some(Ordering::Equal)));
            }
        }
        Predicate::Contains { needle, .. } => {
            let re = like_regex(&format!("%{}%", needle.to_lowercase()))?;
            for i in 0..n {
                let m = match cell(arr, i) {
                    Cell::Text(s) => re.is_match(&s.to_lowercase()),
                    _ => false,
                };
                b.append_value(m);
            }
        }
    }
    Ok(b.finish())
}

// SQL LIKE pattern: % = any run, _ = exactly one char; matched in linear time
fn like_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::from("(?s)^");
    let mut literal = String::new();
    for c in pattern.chars() {
        match c {
            '%' | '_' => {
                re.push_str(&regex::escape(&std::mem::take(&mut literal)));
                re.push_str(if c == '%' { ".*" } else { "." });
            }
            c => literal.push(c),
        }
    }
    re.push_str(&regex::escape(&literal));
    re.push('$');
    Regex::new(&re).map_err(|e| LabLensError::Other(format!("contains pattern: {e}")))
}
