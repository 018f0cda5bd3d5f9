//! Column-level predicates evaluated against cached records and pushed down to the store.

use std::fmt;

use regex::Regex;
use serde_json::Value;

use super::error::DomainError;
use super::record::{Record, Scalar, compare_scalars, key_part};

/// How a list of conditions (or two predicate branches) combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinMode {
    #[default]
    And,
    Or,
}

impl JoinMode {
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_uppercase().as_str() {
            "AND" => Some(Self::And),
            "OR" => Some(Self::Or),
            _ => None,
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
        }
    }
}

/// The operator of a condition together with its comparison value.
#[derive(Debug, Clone)]
pub enum Comparison {
    Gt(Scalar),
    Lt(Scalar),
    Ge(Scalar),
    Le(Scalar),
    Eq(Scalar),
    Ne(Scalar),
    /// Record value is one of the listed values.
    In(Vec<Scalar>),
    /// Any listed value is contained in the record value (an array or a comma-separated list).
    InReversed(Vec<Scalar>),
    /// Record value is null (`true`) or not null (`false`).
    IsNull(bool),
    Matches(Regex),
    NotMatches(Regex),
}

impl Comparison {
    pub fn operator(&self) -> &'static str {
        match self {
            Self::Gt(_) => ">",
            Self::Lt(_) => "<",
            Self::Ge(_) => ">=",
            Self::Le(_) => "<=",
            Self::Eq(_) => "=",
            Self::Ne(_) => "!=",
            Self::In(_) => "IN",
            Self::InReversed(_) => "IN-REVERSED",
            Self::IsNull(_) => "IS-NULL",
            Self::Matches(_) => "MATCHES",
            Self::NotMatches(_) => "NOT-MATCHES",
        }
    }

    /// Builds a comparison from an operator token and its JSON argument.
    pub fn parse(operator: &str, value: &Value) -> Result<Self, DomainError> {
        let token = operator.trim().to_ascii_uppercase();
        let comparison = match token.as_str() {
            ">" => Self::Gt(scalar_argument(&token, value)?),
            "<" => Self::Lt(scalar_argument(&token, value)?),
            ">=" => Self::Ge(scalar_argument(&token, value)?),
            "<=" => Self::Le(scalar_argument(&token, value)?),
            "=" => Self::Eq(scalar_argument(&token, value)?),
            "!=" | "<>" | "≠" => Self::Ne(scalar_argument(&token, value)?),
            "IN" => Self::In(list_argument(&token, value)?),
            "IN-REVERSED" | "INREV" => Self::InReversed(list_argument(&token, value)?),
            "IS-NULL" | "IS" => match value {
                Value::Null => Self::IsNull(true),
                Value::Bool(flag) => Self::IsNull(*flag),
                _ => return Err(DomainError::malformed("IS-NULL expects a boolean or null")),
            },
            "MATCHES" | "RLIKE" => Self::Matches(pattern_argument(value)?),
            "NOT-MATCHES" | "NOT RLIKE" => Self::NotMatches(pattern_argument(value)?),
            _ => return Err(DomainError::unknown_operator(operator)),
        };
        Ok(comparison)
    }

    pub fn evaluate(&self, actual: &Scalar) -> bool {
        match self {
            Self::Gt(expected) => ordered(actual, expected, |o| o.is_gt()),
            Self::Lt(expected) => ordered(actual, expected, |o| o.is_lt()),
            Self::Ge(expected) => ordered(actual, expected, |o| o.is_ge()),
            Self::Le(expected) => ordered(actual, expected, |o| o.is_le()),
            Self::Eq(expected) => {
                !actual.is_null() && !expected.is_null() && key_part(actual) == key_part(expected)
            }
            Self::Ne(expected) => {
                !actual.is_null() && !expected.is_null() && key_part(actual) != key_part(expected)
            }
            Self::In(values) => {
                !actual.is_null() && {
                    let actual = key_part(actual);
                    values.iter().any(|value| key_part(value) == actual)
                }
            }
            Self::InReversed(values) => {
                let members = list_members(actual);
                values
                    .iter()
                    .any(|value| members.contains(&key_part(value)))
            }
            Self::IsNull(expected) => actual.is_null() == *expected,
            Self::Matches(pattern) => !actual.is_null() && pattern.is_match(&key_part(actual)),
            Self::NotMatches(pattern) => !actual.is_null() && !pattern.is_match(&key_part(actual)),
        }
    }
}

fn ordered(actual: &Scalar, expected: &Scalar, accept: impl Fn(std::cmp::Ordering) -> bool) -> bool {
    !actual.is_null() && !expected.is_null() && accept(compare_scalars(actual, expected))
}

/// Members of a record value used as a list: array elements or comma-separated parts.
pub fn list_members(value: &Scalar) -> Vec<String> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().map(key_part).collect(),
        Value::String(text) => text.split(',').map(|part| part.trim().to_string()).collect(),
        other => vec![key_part(other)],
    }
}

fn scalar_argument(operator: &str, value: &Value) -> Result<Scalar, DomainError> {
    match value {
        Value::Array(_) | Value::Object(_) => Err(DomainError::malformed(format!(
            "operator `{operator}` expects a scalar argument"
        ))),
        scalar => Ok(scalar.clone()),
    }
}

fn list_argument(operator: &str, value: &Value) -> Result<Vec<Scalar>, DomainError> {
    match value {
        Value::Array(items) if items.iter().all(|item| !item.is_array() && !item.is_object()) => {
            Ok(items.clone())
        }
        Value::Array(_) | Value::Object(_) => Err(DomainError::malformed(format!(
            "operator `{operator}` expects a list of scalars"
        ))),
        scalar => Ok(vec![scalar.clone()]),
    }
}

fn pattern_argument(value: &Value) -> Result<Regex, DomainError> {
    let Value::String(pattern) = value else {
        return Err(DomainError::malformed("pattern operators expect a string"));
    };
    Regex::new(pattern).map_err(|err| DomainError::invalid_pattern(pattern.as_str(), err))
}

/// `(column, comparison)`; the column may carry a `prefix.` qualifier.
#[derive(Debug, Clone)]
pub struct ColumnCondition {
    pub column: String,
    pub comparison: Comparison,
}

impl ColumnCondition {
    pub fn new(column: impl Into<String>, comparison: Comparison) -> Self {
        Self {
            column: column.into(),
            comparison,
        }
    }

    /// Column name without any qualifier, as it appears in records.
    pub fn bare_column(&self) -> &str {
        self.column
            .rsplit_once('.')
            .map_or(self.column.as_str(), |(_, name)| name)
    }

    pub fn evaluate(&self, record: &Record) -> bool {
        self.comparison
            .evaluate(record.get(self.bare_column()).unwrap_or(&Value::Null))
    }

    /// Parses `[column, value, operator]`.
    pub fn from_json(value: &Value) -> Result<Self, DomainError> {
        let Value::Array(parts) = value else {
            return Err(DomainError::malformed("condition must be an array"));
        };
        let [column, argument, operator] = parts.as_slice() else {
            return Err(DomainError::malformed(
                "condition must be [column, value, operator]",
            ));
        };
        let (Value::String(column), Value::String(operator)) = (column, operator) else {
            return Err(DomainError::malformed(
                "condition column and operator must be strings",
            ));
        };
        Ok(Self::new(column.as_str(), Comparison::parse(operator, argument)?))
    }
}

impl fmt::Display for ColumnCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.column, self.comparison.operator())
    }
}

/// Conditions combined under a single join mode. An empty set matches everything.
#[derive(Debug, Clone, Default)]
pub struct ConditionSet {
    pub conditions: Vec<ColumnCondition>,
    pub mode: JoinMode,
}

impl ConditionSet {
    pub fn new(conditions: Vec<ColumnCondition>, mode: JoinMode) -> Self {
        Self { conditions, mode }
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn evaluate(&self, record: &Record) -> bool {
        if self.conditions.is_empty() {
            return true;
        }
        match self.mode {
            JoinMode::And => self.conditions.iter().all(|c| c.evaluate(record)),
            JoinMode::Or => self.conditions.iter().any(|c| c.evaluate(record)),
        }
    }

    /// Rewrites `IN-REVERSED` as `IN`, for stores that cannot express containment.
    pub fn translate_in_reversed(&self) -> Self {
        let conditions = self
            .conditions
            .iter()
            .map(|condition| match &condition.comparison {
                Comparison::InReversed(values) => {
                    ColumnCondition::new(condition.column.clone(), Comparison::In(values.clone()))
                }
                _ => condition.clone(),
            })
            .collect();
        Self {
            conditions,
            mode: self.mode,
        }
    }

    /// Parses `[[column, value, operator], ..., "AND" | "OR"]`; the mode token is optional.
    pub fn from_json(value: &Value) -> Result<Self, DomainError> {
        let Value::Array(items) = value else {
            return Err(DomainError::malformed("conditions must be an array"));
        };

        let (mode, items) = match items.split_last() {
            Some((Value::String(token), rest)) => {
                let mode = JoinMode::parse(token).ok_or_else(|| {
                    DomainError::malformed(format!("unknown join mode `{token}`"))
                })?;
                (mode, rest)
            }
            _ => (JoinMode::And, items.as_slice()),
        };

        let conditions = items
            .iter()
            .map(ColumnCondition::from_json)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { conditions, mode })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record(value: Value) -> Record {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn parses_mode_token_from_tail() {
        let set = ConditionSet::from_json(&json!([
            ["status", "paid", "="],
            ["total", 10, ">"],
            "OR"
        ]))
        .expect("valid conditions");
        assert_eq!(set.mode, JoinMode::Or);
        assert_eq!(set.conditions.len(), 2);

        let set = ConditionSet::from_json(&json!([["status", "paid", "="]])).expect("valid");
        assert_eq!(set.mode, JoinMode::And);
    }

    #[test]
    fn rejects_unknown_operators_at_parse_time() {
        let err = ConditionSet::from_json(&json!([["a", 1, "LIKE"]])).unwrap_err();
        assert_eq!(err, DomainError::unknown_operator("LIKE"));

        assert!(ConditionSet::from_json(&json!([["a", "(", "MATCHES"]])).is_err());
        assert!(ConditionSet::from_json(&json!([["a", 1]])).is_err());
        assert!(ConditionSet::from_json(&json!([["a", 1, "="], "XOR"])).is_err());
    }

    #[test]
    fn evaluates_each_operator() {
        let row = record(json!({
            "total": 15,
            "status": "paid",
            "tags": "news,tech",
            "deleted_at": null
        }));

        let cases = [
            (json!(["total", 10, ">"]), true),
            (json!(["total", "20", "<"]), true),
            (json!(["total", 15, ">="]), true),
            (json!(["total", 14, "<="]), false),
            (json!(["status", "paid", "="]), true),
            (json!(["status", "paid", "!="]), false),
            (json!(["status", ["open", "paid"], "IN"]), true),
            (json!(["tags", ["tech"], "IN-REVERSED"]), true),
            (json!(["tags", "sports", "INREV"]), false),
            (json!(["deleted_at", true, "IS-NULL"]), true),
            (json!(["status", null, "IS"]), false),
            (json!(["status", "^pa", "MATCHES"]), true),
            (json!(["status", "^pa", "NOT-MATCHES"]), false),
            (json!(["missing", 1, "="]), false),
        ];

        for (condition, expected) in cases {
            let parsed = ColumnCondition::from_json(&condition).expect("valid condition");
            assert_eq!(parsed.evaluate(&row), expected, "condition {condition}");
        }
    }

    #[test]
    fn combines_with_mode() {
        let row = record(json!({"a": 1, "b": 2}));
        let and = ConditionSet::from_json(&json!([["a", 1, "="], ["b", 3, "="]])).expect("valid");
        let or = ConditionSet::from_json(&json!([["a", 1, "="], ["b", 3, "="], "OR"])).expect("valid");
        assert!(!and.evaluate(&row));
        assert!(or.evaluate(&row));
        assert!(ConditionSet::default().evaluate(&row));
    }

    #[test]
    fn prefixed_columns_read_bare_names() {
        let condition = ColumnCondition::from_json(&json!(["o.status", "paid", "="])).expect("valid");
        assert!(condition.evaluate(&record(json!({"status": "paid"}))));
    }

    #[test]
    fn in_reversed_translates_to_in() {
        let set = ConditionSet::from_json(&json!([["tags", ["a"], "IN-REVERSED"]])).expect("valid");
        let translated = set.translate_in_reversed();
        assert!(matches!(translated.conditions[0].comparison, Comparison::In(_)));
    }
}
