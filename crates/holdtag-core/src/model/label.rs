use serde::{Deserialize, Serialize};

/// Current binding of a physical QR label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Binding {
    Unbound,
    Bound {
        tag_id: String,
        assigned_at_us: i64,
        assigned_by: String,
    },
}

impl Binding {
    /// Tag this binding points at, if any.
    #[must_use]
    pub fn tag_id(&self) -> Option<&str> {
        match self {
            Self::Unbound => None,
            Self::Bound { tag_id, .. } => Some(tag_id),
        }
    }

    #[must_use]
    pub const fn is_bound(&self) -> bool {
        matches!(self, Self::Bound { .. })
    }

    /// Build from the nullable column triple stored in `qr_labels`.
    ///
    /// Returns `None` when the columns are partially set, which the schema
    /// CHECK constraint rules out.
    #[must_use]
    pub fn from_columns(
        tag_id: Option<String>,
        assigned_at_us: Option<i64>,
        assigned_by: Option<String>,
    ) -> Option<Self> {
        match (tag_id, assigned_at_us, assigned_by) {
            (None, None, None) => Some(Self::Unbound),
            (Some(tag_id), Some(assigned_at_us), Some(assigned_by)) => Some(Self::Bound {
                tag_id,
                assigned_at_us,
                assigned_by,
            }),
            _ => None,
        }
    }
}

/// A closed-out binding in a label's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PastAssignment {
    pub qr_id: String,
    pub tag_id: String,
    pub assigned_at_us: i64,
    pub assigned_by: String,
    pub unassigned_at_us: i64,
    pub unassigned_by: String,
    pub reason: Option<String>,
}

/// Ledger entry for one physical QR label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrLabel {
    pub qr_id: String,
    pub binding: Binding,
    pub version: i64,
    pub registered_by: String,
    pub created_at_us: i64,
}

impl QrLabel {
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.binding.is_bound()
    }

    #[must_use]
    pub fn current_tag_id(&self) -> Option<&str> {
        self.binding.tag_id()
    }
}

/// Current binding plus the ordered history of a label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingHistory {
    pub label: QrLabel,
    /// Oldest first.
    pub previous_assignments: Vec<PastAssignment>,
}

/// One entry in a tag's label history, current binding included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagLabelAssignment {
    pub qr_id: String,
    pub assigned_at_us: i64,
    pub assigned_by: String,
    /// `None` while the assignment is still active.
    pub unassigned_at_us: Option<i64>,
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::Binding;

    #[test]
    fn from_columns_rejects_partial_rows() {
        assert_eq!(Binding::from_columns(None, None, None), Some(Binding::Unbound));
        assert!(Binding::from_columns(Some("ht-1".into()), None, Some("op".into())).is_none());
        assert!(Binding::from_columns(None, Some(1), None).is_none());

        let bound = Binding::from_columns(Some("ht-1".into()), Some(7), Some("op".into()))
            .expect("complete row");
        assert_eq!(bound.tag_id(), Some("ht-1"));
        assert!(bound.is_bound());
    }

    #[test]
    fn binding_serializes_with_state_tag() {
        let json = serde_json::to_value(Binding::Unbound).expect("serialize");
        assert_eq!(json["state"], "unbound");
    }
}
