use std::fmt;

/// Machine-readable error codes surfaced to scanning stations and operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    InvalidInput,
    TagNotFound,
    LabelNotFound,
    InvalidStateTransition,
    LabelAlreadyRegistered,
    TagNumberTaken,
    LabelBoundElsewhere,
    TagBoundElsewhere,
    RetriesExhausted,
    StorageFailure,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::InvalidInput => "E1002",
            Self::TagNotFound => "E2001",
            Self::LabelNotFound => "E2002",
            Self::InvalidStateTransition => "E2003",
            Self::LabelAlreadyRegistered => "E3001",
            Self::TagNumberTaken => "E3002",
            Self::LabelBoundElsewhere => "E3003",
            Self::TagBoundElsewhere => "E3004",
            Self::RetriesExhausted => "E3005",
            Self::StorageFailure => "E5001",
        }
    }

    /// Short human-facing summary for logs and station displays.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::InvalidInput => "Invalid input",
            Self::TagNotFound => "Hold tag not found",
            Self::LabelNotFound => "QR label not registered",
            Self::InvalidStateTransition => "Operation not allowed in current state",
            Self::LabelAlreadyRegistered => "QR label already registered",
            Self::TagNumberTaken => "Tag number already in use",
            Self::LabelBoundElsewhere => "QR label bound to another tag",
            Self::TagBoundElsewhere => "Hold tag bound to another label",
            Self::RetriesExhausted => "Concurrent update conflict",
            Self::StorageFailure => "Storage failure",
        }
    }

    /// Optional remediation hint that can be shown at the scanning station.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in holdtag.toml and retry."),
            Self::InvalidInput => None,
            Self::TagNotFound => Some("Check the tag id printed on the hold tag."),
            Self::LabelNotFound => Some("Register the QR label before scanning it onto a tag."),
            Self::InvalidStateTransition => {
                Some("Closed tags are read-only; a tag closes only after a final disposition.")
            }
            Self::LabelAlreadyRegistered => None,
            Self::TagNumberTaken => Some("Use the next free tag number."),
            Self::LabelBoundElsewhere => Some("Use force rebind with a reason to move the label."),
            Self::TagBoundElsewhere => Some("Unbind the other label from this tag first."),
            Self::RetriesExhausted => Some("Another station changed the same record; scan again."),
            Self::StorageFailure => Some("Check disk space and database permissions."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// The kind of record an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    HoldTag,
    QrLabel,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::HoldTag => "hold tag",
            Self::QrLabel => "label",
        })
    }
}

/// Invariant breaches reported as conflicts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Conflict {
    #[error("label {qr_id} is already registered")]
    LabelAlreadyRegistered { qr_id: String },

    #[error("tag number {tag_number} is already used by hold tag {tag_id}")]
    TagNumberTaken { tag_number: String, tag_id: String },

    #[error(
        "label {qr_id} already bound to tag {current_tag_id}; use force rebind with reason to move it to {requested_tag_id}"
    )]
    LabelBoundElsewhere {
        qr_id: String,
        current_tag_id: String,
        requested_tag_id: String,
    },

    #[error(
        "tag {tag_id} already bound to label {current_qr_id}; unbind it before binding label {requested_qr_id}"
    )]
    TagBoundElsewhere {
        tag_id: String,
        current_qr_id: String,
        requested_qr_id: String,
    },

    #[error("{entity} {id} kept changing under concurrent updates; gave up after {attempts} attempts")]
    RetriesExhausted {
        entity: EntityKind,
        id: String,
        attempts: u32,
    },
}

impl Conflict {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::LabelAlreadyRegistered { .. } => ErrorCode::LabelAlreadyRegistered,
            Self::TagNumberTaken { .. } => ErrorCode::TagNumberTaken,
            Self::LabelBoundElsewhere { .. } => ErrorCode::LabelBoundElsewhere,
            Self::TagBoundElsewhere { .. } => ErrorCode::TagBoundElsewhere,
            Self::RetriesExhausted { .. } => ErrorCode::RetriesExhausted,
        }
    }
}

/// Errors returned by every hold-tag and binding operation.
///
/// Raw `rusqlite` errors never cross this boundary: transient ones are
/// retried, the rest become [`HoldError::Storage`].
#[derive(Debug, thiserror::Error)]
pub enum HoldError {
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: EntityKind, id: String },

    #[error(transparent)]
    Conflict(#[from] Conflict),

    #[error("cannot {operation} {entity} {id}: {state}")]
    InvalidState {
        entity: EntityKind,
        id: String,
        state: String,
        operation: &'static str,
    },

    #[error("storage failure during {context}: {message}")]
    Storage { context: String, message: String },
}

impl HoldError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn tag_not_found(tag_id: &str) -> Self {
        Self::NotFound {
            entity: EntityKind::HoldTag,
            id: tag_id.to_string(),
        }
    }

    pub(crate) fn label_not_found(qr_id: &str) -> Self {
        Self::NotFound {
            entity: EntityKind::QrLabel,
            id: qr_id.to_string(),
        }
    }

    pub(crate) fn storage(context: impl Into<String>, err: &rusqlite::Error) -> Self {
        Self::Storage {
            context: context.into(),
            message: err.to_string(),
        }
    }

    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Validation { .. } => ErrorCode::InvalidInput,
            Self::NotFound {
                entity: EntityKind::HoldTag,
                ..
            } => ErrorCode::TagNotFound,
            Self::NotFound {
                entity: EntityKind::QrLabel,
                ..
            } => ErrorCode::LabelNotFound,
            Self::Conflict(conflict) => conflict.code(),
            Self::InvalidState { .. } => ErrorCode::InvalidStateTransition,
            Self::Storage { .. } => ErrorCode::StorageFailure,
        }
    }

    /// Optional remediation hint for operators.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }

    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Result alias for domain operations.
pub type HoldResult<T> = Result<T, HoldError>;

/// Map raw SQLite failures on read paths to [`HoldError::Storage`].
pub(crate) trait StorageResultExt<T> {
    fn storage(self, context: &str) -> HoldResult<T>;
}

impl<T> StorageResultExt<T> for rusqlite::Result<T> {
    fn storage(self, context: &str) -> HoldResult<T> {
        self.map_err(|err| HoldError::storage(context, &err))
    }
}

#[cfg(test)]
mod tests {
    use super::{Conflict, EntityKind, ErrorCode, HoldError};
    use std::collections::HashSet;

    #[test]
    fn all_codes_are_unique() {
        let all = [
            ErrorCode::ConfigParseError,
            ErrorCode::InvalidInput,
            ErrorCode::TagNotFound,
            ErrorCode::LabelNotFound,
            ErrorCode::InvalidStateTransition,
            ErrorCode::LabelAlreadyRegistered,
            ErrorCode::TagNumberTaken,
            ErrorCode::LabelBoundElsewhere,
            ErrorCode::TagBoundElsewhere,
            ErrorCode::RetriesExhausted,
            ErrorCode::StorageFailure,
        ];

        let mut seen = HashSet::new();
        for code in all {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn code_format_is_machine_friendly() {
        let code = ErrorCode::LabelBoundElsewhere.code();
        assert_eq!(code.len(), 5);
        assert!(code.starts_with('E'));
        assert!(code.chars().skip(1).all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn label_conflict_names_both_tags_and_force_rebind() {
        let err = HoldError::from(Conflict::LabelBoundElsewhere {
            qr_id: "QR-1".into(),
            current_tag_id: "ht-aaa".into(),
            requested_tag_id: "ht-bbb".into(),
        });
        let msg = err.to_string();
        assert!(msg.contains("QR-1"));
        assert!(msg.contains("ht-aaa"));
        assert!(msg.contains("ht-bbb"));
        assert!(msg.contains("force rebind"));
        assert_eq!(err.code(), ErrorCode::LabelBoundElsewhere);
        assert!(err.is_conflict());
    }

    #[test]
    fn not_found_code_depends_on_entity() {
        let tag = HoldError::NotFound {
            entity: EntityKind::HoldTag,
            id: "ht-1".into(),
        };
        let label = HoldError::NotFound {
            entity: EntityKind::QrLabel,
            id: "QR-9".into(),
        };
        assert_eq!(tag.code(), ErrorCode::TagNotFound);
        assert_eq!(label.code(), ErrorCode::LabelNotFound);
        assert_eq!(label.to_string(), "label QR-9 not found");
    }
}
