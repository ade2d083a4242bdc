//! Structured record queries for the realtime path
//!
//! Provides:
//! - `QueryDescriptor` parsed from a model reply (`{collection, filters, sort, limit}`)
//! - Filter operators `$eq $ne $gt $gte $lt $lte $contains $in`
//! - Identifier validation and SQL compilation with bound parameters
//! - In-memory evaluation of the same descriptor
//! - `QueryBuilder`, the structured model call that writes the descriptor

use crate::config::RealtimeConfig;
use crate::errors::{AppError, Result};
use crate::llm::{ChatMessage, Completer, CompletionOptions};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::sync::{Arc, OnceLock};
use tracing::{debug, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "$eq")]
    Eq,
    #[serde(rename = "$ne")]
    Ne,
    #[serde(rename = "$gt")]
    Gt,
    #[serde(rename = "$gte")]
    Gte,
    #[serde(rename = "$lt")]
    Lt,
    #[serde(rename = "$lte")]
    Lte,
    #[serde(rename = "$contains")]
    Contains,
    #[serde(rename = "$in")]
    In,
}

impl FilterOp {
    pub fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "$eq" => Self::Eq,
            "$ne" => Self::Ne,
            "$gt" => Self::Gt,
            "$gte" => Self::Gte,
            "$lt" => Self::Lt,
            "$lte" => Self::Lte,
            "$contains" | "$containsi" => Self::Contains,
            "$in" => Self::In,
            _ => return None,
        })
    }

    fn is_range(self) -> bool {
        matches!(self, Self::Gt | Self::Gte | Self::Lt | Self::Lte)
    }

    fn sql_operator(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Contains => "ILIKE",
            Self::In => "@>",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    pub direction: SortDirection,
}

/// Validated query over one whitelisted collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    pub collection: String,
    pub filters: Vec<FieldFilter>,
    pub sort: Vec<SortSpec>,
    pub limit: usize,
}

/// Parameter bound into a compiled statement
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Json(Value),
    Float(f64),
    Text(String),
    Int(i64),
}

/// SQL text with `$n` placeholders and their values
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

fn identifier_regex() -> &'static Regex {
    static IDENT: OnceLock<Regex> = OnceLock::new();
    IDENT.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("valid identifier regex"))
}

/// Plain SQL identifier: letters, digits, underscore, not starting with a digit
pub fn is_valid_identifier(name: &str) -> bool {
    identifier_regex().is_match(name)
}

fn check_identifier(name: &str) -> Result<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(AppError::InvalidFormat {
            message: format!("Invalid field name '{}'", name),
        })
    }
}

fn check_value(op: FilterOp, value: &Value) -> Result<()> {
    let ok = match op {
        FilterOp::Eq | FilterOp::Ne => !value.is_object(),
        FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => value.is_number() || value.is_string(),
        FilterOp::Contains => !value.is_null() && !value.is_object() && !value.is_array(),
        FilterOp::In => value.is_array(),
    };
    if ok {
        Ok(())
    } else {
        Err(AppError::InvalidFormat {
            message: format!("Unsupported value {} for {:?}", value, op),
        })
    }
}

fn parse_filters(raw: Option<&Value>) -> Result<Vec<FieldFilter>> {
    let Some(Value::Object(map)) = raw else {
        return Ok(Vec::new());
    };

    let mut filters = Vec::new();
    for (field, condition) in map {
        check_identifier(field)?;
        match condition {
            // {"field": {"$gt": 1, "$lt": 5}}
            Value::Object(ops) if ops.keys().all(|k| k.starts_with('$')) && !ops.is_empty() => {
                for (op, value) in ops {
                    let op = FilterOp::parse(op).ok_or_else(|| AppError::InvalidFormat {
                        message: format!("Unknown operator '{}'", op),
                    })?;
                    check_value(op, value)?;
                    filters.push(FieldFilter {
                        field: field.clone(),
                        op,
                        value: value.clone(),
                    });
                }
            }
            // {"field": value} is shorthand for $eq
            value => {
                check_value(FilterOp::Eq, value)?;
                filters.push(FieldFilter {
                    field: field.clone(),
                    op: FilterOp::Eq,
                    value: value.clone(),
                });
            }
        }
    }
    Ok(filters)
}

fn parse_direction(value: &Value) -> SortDirection {
    match value {
        Value::String(s) if s.eq_ignore_ascii_case("desc") => SortDirection::Desc,
        Value::Number(n) if n.as_i64() == Some(-1) => SortDirection::Desc,
        _ => SortDirection::Asc,
    }
}

fn parse_sort_entry(entry: &str) -> Result<SortSpec> {
    // "field", "-field" or "field:desc"
    let (field, direction) = if let Some(field) = entry.strip_prefix('-') {
        (field, SortDirection::Desc)
    } else if let Some((field, dir)) = entry.split_once(':') {
        (field, parse_direction(&Value::String(dir.to_string())))
    } else {
        (entry, SortDirection::Asc)
    };
    check_identifier(field)?;
    Ok(SortSpec {
        field: field.to_string(),
        direction,
    })
}

fn parse_sort(raw: Option<&Value>) -> Result<Vec<SortSpec>> {
    match raw {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(field, dir)| {
                check_identifier(field)?;
                Ok(SortSpec {
                    field: field.clone(),
                    direction: parse_direction(dir),
                })
            })
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(vec![parse_sort_entry(s.trim())?]),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| parse_sort_entry(s.trim()))
            .collect(),
        _ => Ok(Vec::new()),
    }
}

impl QueryDescriptor {
    /// Parse and validate a descriptor written by the model.
    ///
    /// A missing or empty `collection` is `NoCollectionSpecified`; a name
    /// outside `allowed` is `UnknownCollection`. `limit` is capped at
    /// `max_rows`.
    pub fn parse(raw: &Value, allowed: &[String], max_rows: usize) -> Result<Self> {
        let collection = raw
            .get("collection")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or(AppError::NoCollectionSpecified)?;

        let collection = allowed
            .iter()
            .find(|c| c.eq_ignore_ascii_case(collection))
            .ok_or_else(|| AppError::UnknownCollection {
                name: collection.to_string(),
            })?
            .clone();
        check_identifier(&collection)?;

        let limit = raw
            .get("limit")
            .and_then(Value::as_u64)
            .map(|l| l as usize)
            .filter(|l| *l > 0)
            .unwrap_or(max_rows)
            .min(max_rows);

        Ok(Self {
            collection,
            filters: parse_filters(raw.get("filters"))?,
            sort: parse_sort(raw.get("sort"))?,
            limit,
        })
    }

    /// Compile into a Postgres statement over `to_jsonb` rows.
    ///
    /// Identifiers were validated at parse time; every value is bound.
    pub fn to_sql(&self) -> CompiledQuery {
        let mut params = Vec::new();
        let mut clauses = Vec::new();

        for filter in &self.filters {
            let field = &filter.field;
            let idx = params.len() + 1;
            let op = filter.op.sql_operator();
            let clause = match (filter.op, &filter.value) {
                (FilterOp::Eq | FilterOp::Ne, value) => {
                    params.push(SqlParam::Json(value.clone()));
                    format!("r->'{}' {} ${}::jsonb", field, op, idx)
                }
                (o, Value::Number(n)) if o.is_range() => {
                    params.push(SqlParam::Float(n.as_f64().unwrap_or_default()));
                    format!(
                        "(CASE WHEN jsonb_typeof(r->'{f}') = 'number' THEN (r->>'{f}')::float8 END) {} ${}",
                        op,
                        idx,
                        f = field
                    )
                }
                (o, value) if o.is_range() => {
                    params.push(SqlParam::Text(value_text(value)));
                    format!("r->>'{}' {} ${}", field, op, idx)
                }
                (FilterOp::Contains, value) => {
                    params.push(SqlParam::Text(format!("%{}%", escape_like(&value_text(value)))));
                    format!("r->>'{}' ILIKE ${}", field, idx)
                }
                (_, value) => {
                    params.push(SqlParam::Json(value.clone()));
                    format!("${}::jsonb @> jsonb_build_array(r->'{}')", idx, field)
                }
            };
            clauses.push(clause);
        }

        let mut sql = format!(
            "SELECT r FROM (SELECT to_jsonb(t) AS r FROM \"{}\" t) AS s",
            self.collection
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        if !self.sort.is_empty() {
            let order: Vec<String> = self
                .sort
                .iter()
                .map(|s| {
                    let dir = match s.direction {
                        SortDirection::Asc => "ASC",
                        SortDirection::Desc => "DESC",
                    };
                    format!("r->'{}' {} NULLS LAST", s.field, dir)
                })
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.join(", "));
        }
        params.push(SqlParam::Int(self.limit as i64));
        sql.push_str(&format!(" LIMIT ${}", params.len()));

        CompiledQuery { sql, params }
    }

    /// Whether a JSON row satisfies every filter
    pub fn matches(&self, row: &Value) -> bool {
        self.filters.iter().all(|f| filter_matches(f, row))
    }

    /// Filter, sort and truncate rows in memory
    pub fn apply(&self, rows: impl IntoIterator<Item = Value>) -> Vec<Value> {
        let mut rows: Vec<Value> = rows.into_iter().filter(|r| self.matches(r)).collect();
        if !self.sort.is_empty() {
            rows.sort_by(|a, b| {
                for spec in &self.sort {
                    let ord = compare_for_sort(a.get(&spec.field), b.get(&spec.field));
                    let ord = match spec.direction {
                        SortDirection::Asc => ord,
                        SortDirection::Desc => ord.reverse(),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }
        rows.truncate(self.limit);
        rows
    }
}

/// Statement returning up to `limit` rows of a collection
pub fn sample_sql(collection: &str, limit: usize) -> Result<CompiledQuery> {
    check_identifier(collection)?;
    Ok(CompiledQuery {
        sql: format!("SELECT to_jsonb(t) AS r FROM \"{}\" t LIMIT $1", collection),
        params: vec![SqlParam::Int(limit as i64)],
    })
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn compare_scalar(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn filter_matches(filter: &FieldFilter, row: &Value) -> bool {
    let Some(actual) = row.get(&filter.field).filter(|v| !v.is_null()) else {
        return false;
    };
    let expected = &filter.value;

    match filter.op {
        FilterOp::Eq => json_eq(actual, expected),
        FilterOp::Ne => !json_eq(actual, expected),
        FilterOp::Gt => compare_scalar(actual, expected) == Some(Ordering::Greater),
        FilterOp::Gte => matches!(compare_scalar(actual, expected), Some(Ordering::Greater | Ordering::Equal)),
        FilterOp::Lt => compare_scalar(actual, expected) == Some(Ordering::Less),
        FilterOp::Lte => matches!(compare_scalar(actual, expected), Some(Ordering::Less | Ordering::Equal)),
        FilterOp::Contains => value_text(actual)
            .to_lowercase()
            .contains(&value_text(expected).to_lowercase()),
        FilterOp::In => expected
            .as_array()
            .is_some_and(|items| items.iter().any(|item| json_eq(actual, item))),
    }
}

fn compare_for_sort(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a.filter(|v| !v.is_null()), b.filter(|v| !v.is_null())) {
        (Some(x), Some(y)) => compare_scalar(x, y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Strip the identifier field from every object row
pub fn simplify_rows(rows: Vec<Value>, id_field: &str) -> Vec<Value> {
    rows.into_iter()
        .map(|row| match row {
            Value::Object(mut map) => {
                map.remove(id_field);
                Value::Object(map)
            }
            other => other,
        })
        .collect()
}

const QUERY_BUILDER_PROMPT: &str = "You translate a customer question into a database query.\n\
Reply with a single JSON object of the form \
{\"collection\": string, \"filters\": object, \"sort\": object, \"limit\": number}.\n\
- \"collection\" must be one of the collections listed below. Use null when none fits.\n\
- \"filters\" maps a field name to a value (equality) or to an object of operators: \
$eq, $ne, $gt, $gte, $lt, $lte, $contains, $in.\n\
- \"sort\" maps a field name to \"asc\" or \"desc\".\n\
- Only use field names that appear in the sample records.";

/// Model-backed builder for realtime queries
pub struct QueryBuilder {
    completer: Arc<dyn Completer>,
    config: RealtimeConfig,
}

impl QueryBuilder {
    pub fn new(completer: Arc<dyn Completer>, config: RealtimeConfig) -> Self {
        Self { completer, config }
    }

    pub fn collections(&self) -> &[String] {
        &self.config.collections
    }

    fn build_messages(&self, question: &str, samples: &Map<String, Value>) -> Vec<ChatMessage> {
        let mut prompt = format!("{}\n\nCollections and sample records:\n", QUERY_BUILDER_PROMPT);
        for collection in &self.config.collections {
            let rows = samples.get(collection).cloned().unwrap_or(Value::Array(Vec::new()));
            prompt.push_str(&format!("- {}: {}\n", collection, rows));
        }
        vec![ChatMessage::system(prompt), ChatMessage::user(question)]
    }

    /// Ask the model for a descriptor and validate it
    #[instrument(skip(self, samples))]
    pub async fn build(&self, question: &str, samples: &Map<String, Value>) -> Result<QueryDescriptor> {
        let messages = self.build_messages(question, samples);
        let reply = self.completer.complete(&messages, &CompletionOptions::structured()).await?;

        let raw: Value = serde_json::from_str(reply.trim()).map_err(|e| AppError::ExtractionParse {
            message: format!("Query descriptor is not JSON: {}", e),
        })?;
        let descriptor = QueryDescriptor::parse(&raw, &self.config.collections, self.config.row_limit)?;
        debug!(collection = %descriptor.collection, filters = descriptor.filters.len(), "Built realtime query");
        Ok(descriptor)
    }
}
