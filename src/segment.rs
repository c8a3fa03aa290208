//! Segment rules to SQL.
//!
//! Segments are edited as query-builder rule trees over the columns of a cube.
//! This module renders those trees as SQL predicates, wraps them in the
//! population count query, and converts dataset join definitions to and from
//! their `read_parquet` SQL form. Running the SQL is left to the caller.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;
use thiserror::Error;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
        .expect("Invalid identifier pattern")
});

static JOIN_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"read_parquet\(\[(.*?)\]\)\s+AS\s+t_(\d+)(?:\s+ON\s+\((.*?)\))?")
        .expect("Invalid join table pattern")
});

static JOIN_CONDITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"t_(\d+)\.([A-Za-z_][A-Za-z0-9_]*)\s*=\s*t_\d+\.([A-Za-z_][A-Za-z0-9_]*)")
        .expect("Invalid join condition pattern")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SegmentError {
    #[error("invalid field name: {0:?}")]
    InvalidField(String),

    #[error("unknown operator {operator:?} on field {field}")]
    UnknownOperator { field: String, operator: String },

    #[error("invalid value for {field} {operator}: {reason}")]
    InvalidValue {
        field: String,
        operator: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combinator {
    #[default]
    #[serde(alias = "AND")]
    And,
    #[serde(alias = "OR")]
    Or,
}

impl Combinator {
    fn as_sql(&self) -> &'static str {
        match self {
            Self::And => " and ",
            Self::Or => " or ",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleGroup {
    #[serde(default)]
    pub combinator: Combinator,
    #[serde(default)]
    pub not: bool,
    pub rules: Vec<RuleNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleNode {
    Group(RuleGroup),
    Rule(Rule),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub field: String,
    pub operator: String,
    #[serde(default)]
    pub value: Value,
}

/// One row of `DESCRIBE` output for a cube.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub column_name: String,
    pub column_type: String,
}

impl ColumnMeta {
    pub fn is_list(&self) -> bool {
        self.column_type.ends_with("[]")
    }
}

/// Render a rule group as a SQL predicate.
pub fn to_sql_where(group: &RuleGroup, columns: &[ColumnMeta]) -> Result<String, SegmentError> {
    let parts = group
        .rules
        .iter()
        .map(|node| match node {
            RuleNode::Group(inner) => to_sql_where(inner, columns),
            RuleNode::Rule(rule) => rule_to_sql(rule, columns),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let body = if parts.is_empty() {
        "(1 = 1)".to_string()
    } else {
        format!("({})", parts.join(group.combinator.as_sql()))
    };

    Ok(if group.not {
        format!("NOT {}", body)
    } else {
        body
    })
}

fn rule_to_sql(rule: &Rule, columns: &[ColumnMeta]) -> Result<String, SegmentError> {
    let field = rule.field.as_str();
    if !IDENTIFIER.is_match(field) {
        return Err(SegmentError::InvalidField(rule.field.clone()));
    }
    let invalid = |reason: &str| SegmentError::InvalidValue {
        field: rule.field.clone(),
        operator: rule.operator.clone(),
        reason: reason.to_string(),
    };

    let sql = match rule.operator.as_str() {
        op @ ("=" | "!=" | "<" | ">" | "<=" | ">=") => {
            let value = literal(&rule.value).ok_or_else(|| invalid("expected a scalar"))?;
            format!("{} {} {}", field, op, value)
        }
        "contains" | "beginsWith" | "endsWith" | "doesNotContain" | "doesNotBeginWith"
        | "doesNotEndWith" => {
            let text = scalar_text(&rule.value).ok_or_else(|| invalid("expected text"))?;
            let pattern = match rule.operator.as_str() {
                "contains" | "doesNotContain" => format!("%{}%", text),
                "beginsWith" | "doesNotBeginWith" => format!("{}%", text),
                _ => format!("%{}", text),
            };
            let like = if rule.operator.starts_with("doesNot") {
                "not like"
            } else {
                "like"
            };
            format!("{} {} {}", field, like, quote(&pattern))
        }
        "null" => format!("{} is null", field),
        "notNull" => format!("{} is not null", field),
        "in" | "notIn" => {
            let values = list_values(&rule.value);
            if values.is_empty() {
                return Err(invalid("expected at least one value"));
            }
            let negate = rule.operator == "notIn";
            let is_list = columns
                .iter()
                .any(|c| c.column_name == rule.field && c.is_list());

            if is_list {
                let any = values
                    .iter()
                    .map(|v| scalar_text(v).map(|t| format!("array_contains({}, {})", field, quote(&t))))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| invalid("expected scalar values"))?
                    .join(" or ");
                if negate {
                    format!("NOT ({})", any)
                } else {
                    format!("({})", any)
                }
            } else {
                let literals = values
                    .iter()
                    .map(literal)
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| invalid("expected scalar values"))?
                    .join(", ");
                let op = if negate { "not in" } else { "in" };
                format!("{} {} ({})", field, op, literals)
            }
        }
        "between" | "notBetween" => {
            let values = list_values(&rule.value);
            let [low, high] = values.as_slice() else {
                return Err(invalid("expected two values"));
            };
            let low = literal(low).ok_or_else(|| invalid("expected scalar bounds"))?;
            let high = literal(high).ok_or_else(|| invalid("expected scalar bounds"))?;
            let op = if rule.operator == "between" {
                "between"
            } else {
                "not between"
            };
            format!("{} {} {} and {}", field, op, low, high)
        }
        other => {
            return Err(SegmentError::UnknownOperator {
                field: rule.field.clone(),
                operator: other.to_string(),
            })
        }
    };

    Ok(sql)
}

fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// SQL literal for a scalar value.
fn literal(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(quote(s)),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some("NULL".to_string()),
        _ => None,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Arrays as-is; strings split on commas.
fn list_values(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| Value::String(part.to_string()))
            .collect(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

/// Count of rows (or distinct ids) of a cube matching an optional predicate.
pub fn population_sql(
    cube_sql: &str,
    where_clause: Option<&str>,
    id_field: Option<&str>,
    distinct: bool,
) -> Result<String, SegmentError> {
    let column = match id_field {
        Some(field) if !IDENTIFIER.is_match(field) => {
            return Err(SegmentError::InvalidField(field.to_string()))
        }
        Some(field) => field,
        None => "*",
    };
    let distinct = if distinct { "DISTINCT " } else { "" };
    let filter = where_clause
        .map(str::trim)
        .filter(|w| !w.is_empty())
        .map(|w| format!(" WHERE {}", w))
        .unwrap_or_default();

    Ok(format!(
        "SELECT COUNT({}{}) AS population FROM ({}){}",
        distinct,
        column,
        cube_sql.trim().trim_end_matches(';'),
        filter
    ))
}

/// Distinct values of one column, for value pickers. List columns are unnested.
pub fn distinct_values_sql(
    cube_sql: &str,
    column: &ColumnMeta,
    search: Option<&str>,
) -> Result<String, SegmentError> {
    let field = column.column_name.as_str();
    if !IDENTIFIER.is_match(field) {
        return Err(SegmentError::InvalidField(field.to_string()));
    }
    let select = if column.is_list() {
        format!("unnest({}) AS {}", field, field)
    } else {
        field.to_string()
    };
    let filter = search
        .filter(|s| !s.is_empty())
        .map(|s| format!(" WHERE {} like {}", field, quote(&format!("%{}%", s))))
        .unwrap_or_default();

    Ok(format!(
        "SELECT DISTINCT {} FROM ({}){}",
        select,
        cube_sql.trim().trim_end_matches(';'),
        filter
    ))
}

/// Parquet files joined into one queryable dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub tables: Vec<DatasetTable>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetTable {
    pub files: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<JoinCondition>,
}

/// `t_{source_table}.{source_column} = t_{this}.{target_column}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinCondition {
    pub source_table: usize,
    pub source_column: String,
    pub target_column: String,
}

/// Fails on a dataset without tables or a table without files.
pub fn build_join_sql(dataset: &Dataset) -> Result<String, SegmentError> {
    let empty = |field: String, reason: &str| SegmentError::InvalidValue {
        field,
        operator: "join".to_string(),
        reason: reason.to_string(),
    };
    if dataset.tables.is_empty() {
        return Err(empty("tables".to_string(), "expected at least one table"));
    }

    let mut tables = Vec::with_capacity(dataset.tables.len());
    for (index, table) in dataset.tables.iter().enumerate() {
        if table.files.is_empty() {
            return Err(empty(format!("t_{}", index), "expected at least one file"));
        }
        let files = table
            .files
            .iter()
            .map(|f| quote(f))
            .collect::<Vec<_>>()
            .join(",");

        let mut conditions = Vec::with_capacity(table.conditions.len());
        for c in &table.conditions {
            for column in [&c.source_column, &c.target_column] {
                if !IDENTIFIER.is_match(column) || column.contains('.') {
                    return Err(SegmentError::InvalidField(column.clone()));
                }
            }
            conditions.push(format!(
                "t_{}.{} = t_{}.{}",
                c.source_table, c.source_column, index, c.target_column
            ));
        }

        let on = if conditions.is_empty() {
            String::new()
        } else {
            format!(" ON ({})", conditions.join(" AND "))
        };
        tables.push(format!("read_parquet([{}]) AS t_{}{}", files, index, on));
    }

    Ok(format!("SELECT * FROM {}", tables.join(" JOIN ")))
}

/// Inverse of [`build_join_sql`]. `None` when the SQL has no parquet tables.
pub fn parse_join_sql(sql: &str) -> Option<Dataset> {
    let mut tables: Vec<(usize, DatasetTable)> = JOIN_TABLE
        .captures_iter(sql)
        .filter_map(|caps| {
            let index = caps.get(2)?.as_str().parse().ok()?;
            let files = caps
                .get(1)
                .map(|m| {
                    m.as_str()
                        .split(',')
                        .map(|f| f.trim().trim_matches('\'').replace("''", "'"))
                        .filter(|f| !f.is_empty())
                        .collect()
                })
                .unwrap_or_default();
            let conditions = caps
                .get(3)
                .map(|m| {
                    JOIN_CONDITION
                        .captures_iter(m.as_str())
                        .filter_map(|c| {
                            Some(JoinCondition {
                                source_table: c.get(1)?.as_str().parse().ok()?,
                                source_column: c.get(2)?.as_str().to_string(),
                                target_column: c.get(3)?.as_str().to_string(),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            Some((index, DatasetTable { files, conditions }))
        })
        .collect();

    if tables.is_empty() {
        return None;
    }
    tables.sort_by_key(|(index, _)| *index);
    Some(Dataset {
        tables: tables.into_iter().map(|(_, table)| table).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn group(value: Value) -> RuleGroup {
        serde_json::from_value(value).unwrap()
    }

    fn columns() -> Vec<ColumnMeta> {
        vec![
            ColumnMeta {
                column_name: "age".to_string(),
                column_type: "BIGINT".to_string(),
            },
            ColumnMeta {
                column_name: "tags".to_string(),
                column_type: "VARCHAR[]".to_string(),
            },
        ]
    }

    #[test]
    fn test_flat_and_group() {
        let query = group(json!({
            "combinator": "and",
            "rules": [
                { "field": "age", "operator": ">=", "value": 20 },
                { "field": "city", "operator": "=", "value": "Seoul" }
            ]
        }));
        assert_eq!(
            to_sql_where(&query, &columns()).unwrap(),
            "(age >= 20 and city = 'Seoul')"
        );
    }

    #[test]
    fn test_nested_and_negated_groups() {
        let query = group(json!({
            "combinator": "or",
            "not": true,
            "rules": [
                { "field": "name", "operator": "beginsWith", "value": "O'Br" },
                {
                    "combinator": "and",
                    "rules": [
                        { "field": "age", "operator": "between", "value": "10,20" },
                        { "field": "email", "operator": "notNull", "value": "" }
                    ]
                }
            ]
        }));
        assert_eq!(
            to_sql_where(&query, &columns()).unwrap(),
            "NOT (name like 'O''Br%' or (age between '10' and '20' and email is not null))"
        );
    }

    #[test]
    fn test_empty_group_matches_everything() {
        let query = group(json!({ "combinator": "and", "rules": [] }));
        assert_eq!(to_sql_where(&query, &[]).unwrap(), "(1 = 1)");
    }

    #[test]
    fn test_in_on_list_column_uses_array_contains() {
        let query = group(json!({
            "rules": [{ "field": "tags", "operator": "in", "value": ["vip", "new"] }]
        }));
        assert_eq!(
            to_sql_where(&query, &columns()).unwrap(),
            "((array_contains(tags, 'vip') or array_contains(tags, 'new')))"
        );

        let scalar = group(json!({
            "rules": [{ "field": "age", "operator": "notIn", "value": [1, 2] }]
        }));
        assert_eq!(to_sql_where(&scalar, &columns()).unwrap(), "(age not in (1, 2))");
    }

    #[test]
    fn test_like_operators() {
        let cases = [
            ("contains", "name like '%kim%'"),
            ("endsWith", "name like '%kim'"),
            ("doesNotContain", "name not like '%kim%'"),
            ("doesNotBeginWith", "name not like 'kim%'"),
        ];
        for (operator, expected) in cases {
            let query = group(json!({
                "rules": [{ "field": "name", "operator": operator, "value": "kim" }]
            }));
            assert_eq!(to_sql_where(&query, &[]).unwrap(), format!("({})", expected));
        }
    }

    #[test]
    fn test_rejects_bad_rules() {
        let bad_field = group(json!({
            "rules": [{ "field": "age; drop table x", "operator": "=", "value": 1 }]
        }));
        assert!(matches!(
            to_sql_where(&bad_field, &[]),
            Err(SegmentError::InvalidField(_))
        ));

        let bad_op = group(json!({
            "rules": [{ "field": "age", "operator": "~", "value": 1 }]
        }));
        assert!(matches!(
            to_sql_where(&bad_op, &[]),
            Err(SegmentError::UnknownOperator { .. })
        ));

        let bad_between = group(json!({
            "rules": [{ "field": "age", "operator": "between", "value": [1] }]
        }));
        assert!(matches!(
            to_sql_where(&bad_between, &[]),
            Err(SegmentError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_population_sql() {
        assert_eq!(
            population_sql("SELECT * FROM events;", Some("(age > 1)"), Some("user_id"), true).unwrap(),
            "SELECT COUNT(DISTINCT user_id) AS population FROM (SELECT * FROM events) WHERE (age > 1)"
        );
        assert_eq!(
            population_sql("SELECT 1", None, None, false).unwrap(),
            "SELECT COUNT(*) AS population FROM (SELECT 1)"
        );
        assert!(population_sql("SELECT 1", None, Some("a b"), false).is_err());
    }

    #[test]
    fn test_distinct_values_unnests_lists() {
        let sql = distinct_values_sql("SELECT * FROM users", &columns()[1], Some("v")).unwrap();
        assert_eq!(
            sql,
            "SELECT DISTINCT unnest(tags) AS tags FROM (SELECT * FROM users) WHERE tags like '%v%'"
        );
    }

    #[test]
    fn test_join_sql_parses_back() {
        let dataset = Dataset {
            tables: vec![
                DatasetTable {
                    files: vec!["s3://b/users.parquet".to_string()],
                    conditions: vec![],
                },
                DatasetTable {
                    files: vec!["s3://b/o1.parquet".to_string(), "s3://b/o2.parquet".to_string()],
                    conditions: vec![JoinCondition {
                        source_table: 0,
                        source_column: "id".to_string(),
                        target_column: "user_id".to_string(),
                    }],
                },
            ],
        };

        let sql = build_join_sql(&dataset).unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM read_parquet(['s3://b/users.parquet']) AS t_0 JOIN \
             read_parquet(['s3://b/o1.parquet','s3://b/o2.parquet']) AS t_1 ON (t_0.id = t_1.user_id)"
        );
        assert_eq!(parse_join_sql(&sql), Some(dataset));
        assert_eq!(parse_join_sql("SELECT 1"), None);
    }

    #[test]
    fn test_join_sql_needs_tables_and_files() {
        let err = build_join_sql(&Dataset { tables: vec![] }).unwrap_err();
        assert_eq!(
            err,
            SegmentError::InvalidValue {
                field: "tables".to_string(),
                operator: "join".to_string(),
                reason: "expected at least one table".to_string(),
            }
        );

        let no_files = Dataset {
            tables: vec![DatasetTable {
                files: vec![],
                conditions: vec![],
            }],
        };
        assert!(matches!(
            build_join_sql(&no_files),
            Err(SegmentError::InvalidValue { field, .. }) if field == "t_0"
        ));
    }
}
