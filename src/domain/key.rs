//! Key columns, key tuples and composite identifiers.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use super::error::DomainError;
use super::record::{Scalar, is_scalar, key_part};

/// Default separator between identifier components. Assumed never to occur inside a component.
pub const DEFAULT_DELIMITER: &str = "/";

/// A column that identifies rows, optionally qualified with a table or alias prefix.
///
/// The prefix only affects how the column is addressed in store predicates; values are
/// read back from rows by the bare name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyColumn {
    prefix: Option<String>,
    name: String,
}

impl KeyColumn {
    pub fn new(name: impl Into<String>) -> Result<Self, DomainError> {
        let name = name.into();
        ensure_identifier(&name)?;
        Ok(Self { prefix: None, name })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Result<Self, DomainError> {
        let prefix = prefix.into();
        ensure_identifier(&prefix)?;
        self.prefix = Some(prefix);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// `prefix.name` when prefixed, otherwise `name`.
    pub fn qualified(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}.{}", self.name),
            None => self.name.clone(),
        }
    }

    /// Parses a list of column names, failing on the first invalid one.
    pub fn parse_all<S: AsRef<str>>(names: &[S]) -> Result<Vec<Self>, DomainError> {
        names.iter().map(|name| name.as_ref().parse()).collect()
    }
}

impl FromStr for KeyColumn {
    type Err = DomainError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.rsplit_once('.') {
            Some((prefix, name)) => Self::new(name)
                .and_then(|column| column.with_prefix(prefix))
                .map_err(|_| DomainError::invalid_key_column(raw)),
            None => Self::new(raw),
        }
    }
}

impl fmt::Display for KeyColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified())
    }
}

fn ensure_identifier(value: &str) -> Result<(), DomainError> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
    if valid {
        Ok(())
    } else {
        Err(DomainError::invalid_key_column(value))
    }
}

/// Key components for one lookup. `None` marks a null-padded component, which
/// constrains nothing when filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyTuple(Vec<Option<Scalar>>);

impl KeyTuple {
    pub fn new(components: Vec<Option<Scalar>>) -> Self {
        Self(components)
    }

    /// Reads a key given as a scalar or an array of scalars. Anything else is malformed.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Array(items) if !items.is_empty() && items.iter().all(is_scalar) => {
                Some(Self(items.iter().cloned().map(Some).collect()))
            }
            Value::Array(_) | Value::Object(_) => None,
            scalar => Some(Self(vec![Some(scalar.clone())])),
        }
    }

    /// Splits an identifier back into string components.
    pub fn from_identifier(id: &str, delimiter: &str) -> Self {
        Self(
            split_identifier(id, delimiter)
                .into_iter()
                .map(|part| Some(Value::String(part)))
                .collect(),
        )
    }

    pub fn components(&self) -> &[Option<Scalar>] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fits the tuple to `width` components. Longer tuples are rejected; shorter ones are
    /// null-padded when `fill` is set and rejected otherwise.
    pub fn fit(mut self, width: usize, fill: bool) -> Option<Self> {
        match self.0.len().cmp(&width) {
            std::cmp::Ordering::Equal => Some(self),
            std::cmp::Ordering::Greater => None,
            std::cmp::Ordering::Less if fill => {
                self.0.resize(width, None);
                Some(self)
            }
            std::cmp::Ordering::Less => None,
        }
    }
}

pub fn join_identifier<S: AsRef<str>>(parts: &[S], delimiter: &str) -> String {
    parts
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(delimiter)
}

pub fn split_identifier(id: &str, delimiter: &str) -> Vec<String> {
    if delimiter.is_empty() {
        return vec![id.to_string()];
    }
    id.split(delimiter).map(str::to_string).collect()
}

/// Where a row lands in a keyed result: its identifier and, when grouping, its sub-key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub sub_key: Option<String>,
}

/// Builds the identity of a row from its key values.
///
/// Null values are skipped when `skip_nulls` is set so that padded components do not leave
/// empty segments behind. With `group_by_first > 0` the leading components form the
/// identifier and the rest form the sub-key.
pub fn identify(
    values: &[&Scalar],
    group_by_first: usize,
    delimiter: &str,
    skip_nulls: bool,
) -> Identity {
    let parts: Vec<String> = values
        .iter()
        .filter(|value| !(skip_nulls && value.is_null()))
        .map(|value| key_part(value))
        .collect();

    if group_by_first == 0 || group_by_first >= parts.len() {
        return Identity {
            id: join_identifier(&parts, delimiter),
            sub_key: (group_by_first > 0).then(String::new),
        };
    }

    let (head, tail) = parts.split_at(group_by_first);
    Identity {
        id: join_identifier(head, delimiter),
        sub_key: Some(join_identifier(tail, delimiter)),
    }
}

/// Checks the grouping invariant `0 <= group_by_first < width`.
pub fn check_grouping(group_by_first: usize, width: usize) -> Result<(), DomainError> {
    if group_by_first >= width && group_by_first > 0 {
        return Err(DomainError::InvalidGrouping {
            group: group_by_first,
            available: width,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_prefixed_columns() {
        let column: KeyColumn = "o.id".parse().expect("valid column");
        assert_eq!(column.prefix(), Some("o"));
        assert_eq!(column.name(), "id");
        assert_eq!(column.qualified(), "o.id");

        assert!("".parse::<KeyColumn>().is_err());
        assert!("id; drop".parse::<KeyColumn>().is_err());
        assert!(".id".parse::<KeyColumn>().is_err());
    }

    #[test]
    fn key_tuples_from_json() {
        assert_eq!(KeyTuple::from_value(&json!(7)).map(|t| t.len()), Some(1));
        assert_eq!(KeyTuple::from_value(&json!([1, "a"])).map(|t| t.len()), Some(2));
        assert!(KeyTuple::from_value(&json!([[1], 2])).is_none());
        assert!(KeyTuple::from_value(&json!({"id": 1})).is_none());
        assert!(KeyTuple::from_value(&json!([])).is_none());
    }

    #[test]
    fn fit_pads_or_drops() {
        let tuple = KeyTuple::from_value(&json!([1])).expect("tuple");
        assert!(tuple.clone().fit(2, false).is_none());
        let padded = tuple.fit(2, true).expect("padded");
        assert_eq!(padded.components(), &[Some(json!(1)), None]);

        let long = KeyTuple::from_value(&json!([1, 2, 3])).expect("tuple");
        assert!(long.fit(2, true).is_none());
    }

    #[test]
    fn identifier_round_trips_with_grouping() {
        let values = [json!(12), json!("ab"), json!(3)];
        let refs: Vec<&Scalar> = values.iter().collect();

        for group in 0..values.len() {
            let identity = identify(&refs, group, "/", false);
            let mut parts = split_identifier(&identity.id, "/");
            if let Some(sub_key) = identity.sub_key.as_deref() {
                assert_eq!(split_identifier(sub_key, "/").len(), values.len() - group);
                parts.extend(split_identifier(sub_key, "/"));
            }
            assert_eq!(parts, ["12", "ab", "3"]);
        }
    }

    #[test]
    fn padded_nulls_do_not_leave_empty_segments() {
        let values = [json!(5), Value::Null];
        let refs: Vec<&Scalar> = values.iter().collect();
        assert_eq!(identify(&refs, 0, "/", true).id, "5");
        assert_eq!(identify(&refs, 0, "/", false).id, "5/");
    }

    #[test]
    fn grouping_must_leave_a_sub_key() {
        assert!(check_grouping(0, 1).is_ok());
        assert!(check_grouping(1, 2).is_ok());
        assert!(check_grouping(2, 2).is_err());
    }
}
