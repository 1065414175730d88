use thiserror::Error;

/// Fatal conditions raised while loading, building or decoding a conversation.
///
/// Recoverable conditions (dangling parents, skipped records, unmatched
/// placeholders) are reported as values alongside successful results instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed record at position {position}{}: {reason}", display_id(.id))]
    MalformedRecord {
        /// Zero-based position of the record in input (pre-order for nested input).
        position: usize,
        /// Identifier of the record, when it has one.
        id: Option<String>,
        /// Name of the missing or invalid field.
        field: &'static str,
        reason: String,
    },

    #[error("duplicate identifier with conflicting content: {id}")]
    DuplicateIdentifier { id: String },

    #[error("parent cycle detected: {}", .ids.join(" -> "))]
    CycleDetected { ids: Vec<String> },

    #[error("invalid export document: {reason}")]
    InvalidExport { reason: String },

    #[error("unsupported input: {reason}")]
    UnsupportedInput { reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn display_id(id: &Option<String>) -> String {
    match id {
        Some(id) => format!(" (id {id})"),
        None => String::new(),
    }
}

impl Error {
    pub(crate) fn invalid_export(reason: impl Into<String>) -> Self {
        Error::InvalidExport {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_record_names_the_record() {
        let err = Error::MalformedRecord {
            position: 3,
            id: Some("m4".to_string()),
            field: "role",
            reason: "missing role".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "malformed record at position 3 (id m4): missing role"
        );
    }

    #[test]
    fn cycle_lists_every_identifier() {
        let err = Error::CycleDetected {
            ids: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(err.to_string(), "parent cycle detected: a -> b");
    }
}
