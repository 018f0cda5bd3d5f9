//! Renders [`TableQuery`] trees into Postgres SQL.
//!
//! Rows come back as `row_to_json` objects so column types never need to be known up front.
//! Equality, membership and pattern operators compare the column's text form against text
//! binds, matching the string-form equality records are compared with in process.

use serde_json::Value;
use sqlx::{Postgres, QueryBuilder};

use crate::application::repos::{Predicate, StoreError, TableQuery};
use crate::domain::condition::{ColumnCondition, Comparison};
use crate::domain::record::{Scalar, key_part};

fn valid_identifier(part: &str) -> bool {
    !part.is_empty()
        && part
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

/// Quotes `name` or `prefix.name` as `"prefix"."name"`.
pub(crate) fn quote_path(path: &str) -> Result<String, StoreError> {
    let parts: Vec<&str> = path.split('.').collect();
    if parts.len() > 2 || !parts.iter().all(|part| valid_identifier(part)) {
        return Err(StoreError::InvalidIdentifier(path.to_string()));
    }
    Ok(parts
        .iter()
        .map(|part| format!("\"{part}\""))
        .collect::<Vec<_>>()
        .join("."))
}

/// Quotes a table reference: `table`, `schema.table`, optionally followed by an alias.
pub(crate) fn quote_table(table: &str) -> Result<String, StoreError> {
    let mut words = table.split_whitespace();
    let name = words
        .next()
        .ok_or_else(|| StoreError::InvalidIdentifier(table.to_string()))?;
    let mut rendered = quote_path(name)?;
    match (words.next(), words.next()) {
        (None, _) => {}
        (Some(alias), None) if valid_identifier(alias) => {
            rendered.push_str(&format!(" \"{alias}\""));
        }
        _ => return Err(StoreError::InvalidIdentifier(table.to_string())),
    }
    Ok(rendered)
}

fn as_number(value: &Scalar) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Builds the complete select for `query`.
pub(crate) fn build_select(query: &TableQuery) -> Result<QueryBuilder<'static, Postgres>, StoreError> {
    let mut qb = QueryBuilder::new("SELECT row_to_json(t) FROM (SELECT ");
    if query.columns.is_empty() {
        qb.push("*");
    } else {
        let columns = query
            .columns
            .iter()
            .map(|column| quote_path(column))
            .collect::<Result<Vec<_>, _>>()?;
        qb.push(columns.join(", "));
    }
    qb.push(" FROM ");
    qb.push(quote_table(&query.table)?);

    if let Some(predicate) = &query.predicate {
        qb.push(" WHERE ");
        push_predicate(&mut qb, predicate)?;
    }

    let window = &query.window;
    if !window.order_by.is_empty() {
        let direction = window.direction.as_sql();
        let order = window
            .order_by
            .iter()
            .map(|column| quote_path(column).map(|quoted| format!("{quoted} {direction}")))
            .collect::<Result<Vec<_>, _>>()?;
        qb.push(" ORDER BY ");
        qb.push(order.join(", "));
    }
    if let Some(limit) = window.limit {
        qb.push(" LIMIT ");
        qb.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
    }
    if let Some(offset) = window.offset {
        qb.push(" OFFSET ");
        qb.push_bind(i64::try_from(offset).unwrap_or(i64::MAX));
    }
    qb.push(") t");
    Ok(qb)
}

fn push_predicate(
    qb: &mut QueryBuilder<'static, Postgres>,
    predicate: &Predicate,
) -> Result<(), StoreError> {
    match predicate {
        Predicate::Condition(condition) => push_condition(qb, condition),
        Predicate::KeyTuples { columns, tuples } => push_key_tuples(qb, columns, tuples),
        Predicate::Join { left, right, mode } => {
            qb.push("(");
            push_predicate(qb, left)?;
            qb.push(format!(" {} ", mode.as_sql()));
            push_predicate(qb, right)?;
            qb.push(")");
            Ok(())
        }
    }
}

fn push_key_tuples(
    qb: &mut QueryBuilder<'static, Postgres>,
    columns: &[String],
    tuples: &[Vec<Option<Scalar>>],
) -> Result<(), StoreError> {
    let quoted = columns
        .iter()
        .map(|column| quote_path(column))
        .collect::<Result<Vec<_>, _>>()?;
    if tuples.is_empty() {
        qb.push("FALSE");
        return Ok(());
    }

    qb.push("(");
    for (index, tuple) in tuples.iter().enumerate() {
        if index > 0 {
            qb.push(" OR ");
        }
        qb.push("(");
        let mut constrained = 0;
        for (column, component) in quoted.iter().zip(tuple) {
            let Some(value) = component else {
                continue;
            };
            if constrained > 0 {
                qb.push(" AND ");
            }
            constrained += 1;
            if value.is_null() {
                qb.push(format!("{column} IS NULL"));
            } else {
                qb.push(format!("{column}::text = "));
                qb.push_bind(key_part(value));
            }
        }
        if constrained == 0 {
            qb.push("TRUE");
        }
        qb.push(")");
    }
    qb.push(")");
    Ok(())
}

fn push_condition(
    qb: &mut QueryBuilder<'static, Postgres>,
    condition: &ColumnCondition,
) -> Result<(), StoreError> {
    let column = quote_path(&condition.column)?;
    match &condition.comparison {
        Comparison::Eq(value) | Comparison::Ne(value) if value.is_null() => {
            qb.push("FALSE");
        }
        Comparison::Eq(value) => {
            qb.push(format!("{column}::text = "));
            qb.push_bind(key_part(value));
        }
        Comparison::Ne(value) => {
            qb.push(format!("{column}::text <> "));
            qb.push_bind(key_part(value));
        }
        Comparison::Gt(value)
        | Comparison::Lt(value)
        | Comparison::Ge(value)
        | Comparison::Le(value) => {
            let operator = condition.comparison.operator();
            match (value, as_number(value)) {
                (Value::Null, _) => {
                    qb.push("FALSE");
                }
                (_, Some(number)) => {
                    qb.push(format!("{column} {operator} "));
                    qb.push_bind(number);
                }
                (value, None) => {
                    qb.push(format!("{column}::text {operator} "));
                    qb.push_bind(key_part(value));
                }
            }
        }
        Comparison::In(values) => {
            let members: Vec<String> = values
                .iter()
                .filter(|value| !value.is_null())
                .map(key_part)
                .collect();
            qb.push(format!("{column}::text = ANY("));
            qb.push_bind(members);
            qb.push(")");
        }
        Comparison::InReversed(values) => {
            let members: Vec<String> = values.iter().map(key_part).collect();
            qb.push(format!(
                "regexp_split_to_array({column}::text, '\\s*,\\s*') && "
            ));
            qb.push_bind(members);
            qb.push("::text[]");
        }
        Comparison::IsNull(true) => {
            qb.push(format!("{column} IS NULL"));
        }
        Comparison::IsNull(false) => {
            qb.push(format!("{column} IS NOT NULL"));
        }
        Comparison::Matches(pattern) => {
            qb.push(format!("{column}::text ~ "));
            qb.push_bind(pattern.as_str().to_string());
        }
        Comparison::NotMatches(pattern) => {
            qb.push(format!("{column}::text !~ "));
            qb.push_bind(pattern.as_str().to_string());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::application::repos::{QueryWindow, SortDirection};
    use crate::domain::condition::{ConditionSet, JoinMode};

    fn query(predicate: Option<Predicate>) -> TableQuery {
        TableQuery {
            table: "orders o".into(),
            columns: vec!["o.id".into(), "status".into()],
            predicate,
            window: QueryWindow {
                limit: Some(10),
                offset: Some(5),
                order_by: vec!["o.id".into()],
                direction: SortDirection::Desc,
            },
        }
    }

    #[test]
    fn renders_window_and_projection() {
        let qb = build_select(&query(None)).expect("valid query");
        assert_eq!(
            qb.sql(),
            "SELECT row_to_json(t) FROM (SELECT \"o\".\"id\", \"status\" FROM \"orders\" \"o\" \
             ORDER BY \"o\".\"id\" DESC LIMIT $1 OFFSET $2) t"
        );
    }

    #[test]
    fn renders_key_tuples_with_wildcards() {
        let predicate = Predicate::KeyTuples {
            columns: vec!["order_id".into(), "item_id".into()],
            tuples: vec![vec![Some(json!(1)), Some(json!(2))], vec![Some(json!(3)), None]],
        };
        let qb = build_select(&query(Some(predicate))).expect("valid query");
        assert!(qb.sql().contains(
            "WHERE ((\"order_id\"::text = $1 AND \"item_id\"::text = $2) OR (\"order_id\"::text = $3))"
        ));
    }

    #[test]
    fn renders_conditions_joined_by_mode() {
        let set = ConditionSet::from_json(&json!([
            ["total", 10, ">"],
            ["tags", ["a", "b"], "IN-REVERSED"],
            ["note", true, "IS-NULL"],
            "OR"
        ]))
        .expect("valid conditions");
        let keys = Predicate::KeyTuples {
            columns: vec!["id".into()],
            tuples: vec![vec![Some(json!(7))]],
        };
        let tree = Predicate::join(
            keys,
            Predicate::from_conditions(&set).expect("non-empty"),
            JoinMode::And,
        );
        let qb = build_select(&query(Some(tree))).expect("valid query");
        let sql = qb.sql();
        assert!(sql.contains("((\"id\"::text = $1)) AND ((\"total\" > $2 OR "));
        assert!(sql.contains("regexp_split_to_array(\"tags\"::text, '\\s*,\\s*') && $3::text[]"));
        assert!(sql.contains("\"note\" IS NULL)"));
    }

    #[test]
    fn rejects_unsafe_identifiers() {
        let mut bad = query(None);
        bad.columns = vec!["id; DROP TABLE orders".into()];
        assert!(matches!(
            build_select(&bad),
            Err(StoreError::InvalidIdentifier(_))
        ));

        assert!(quote_table("orders o extra").is_err());
        assert_eq!(quote_table("public.orders").expect("valid"), "\"public\".\"orders\"");
    }
}
