use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("unknown condition operator `{operator}`")]
    UnknownOperator { operator: String },
    #[error("malformed condition: {message}")]
    MalformedCondition { message: String },
    #[error("malformed return predicate: {message}")]
    MalformedPredicate { message: String },
    #[error("invalid pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("invalid key column `{column}`")]
    InvalidKeyColumn { column: String },
    #[error("cannot group by the first {group} of {available} key components")]
    InvalidGrouping { group: usize, available: usize },
}

impl DomainError {
    pub fn unknown_operator(operator: impl Into<String>) -> Self {
        Self::UnknownOperator {
            operator: operator.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedCondition {
            message: message.into(),
        }
    }

    pub fn malformed_predicate(message: impl Into<String>) -> Self {
        Self::MalformedPredicate {
            message: message.into(),
        }
    }

    pub fn invalid_pattern(pattern: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_key_column(column: impl Into<String>) -> Self {
        Self::InvalidKeyColumn {
            column: column.into(),
        }
    }
}
