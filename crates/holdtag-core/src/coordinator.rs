//! Scan-time binding rules between QR labels and hold tags.
//!
//! A label cycles `Unassigned -> Assigned -> Unassigned` forever. Moving it
//! from one tag to another needs an explicit forced rebind with a reason;
//! closing a tag releases whatever label it holds.

use rusqlite::Transaction;
use serde::Serialize;

use crate::error::{Conflict, EntityKind, HoldError, HoldResult, StorageResultExt};
use crate::model::ids::{validate_actor, validate_qr_id, validate_tag_ref};
use crate::model::{BindingHistory, HoldTag, PastAssignment, QrLabel, TagLabelAssignment};
use crate::retry::{AttemptError, AttemptResultExt};
use crate::store::hold_tags::{self, TagClosed, closed_tag};
use crate::store::ledger;
use crate::store::{Step, Store};

/// Reason recorded when a binding ends because its tag closed.
pub const TAG_CLOSED_REASON: &str = "tag closed";

/// What a scan did to the label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    /// Unassigned label now bound.
    Bound,
    /// Label was already on this tag; nothing written.
    AlreadyBound,
    /// Label moved off another tag by a forced rebind.
    Rebound { released: PastAssignment },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindOutcome {
    pub label: QrLabel,
    pub tag: HoldTag,
    pub transition: Transition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnbindOutcome {
    pub label: QrLabel,
    /// `None` when the label was already unbound.
    pub released: Option<PastAssignment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    AlreadyBound,
    Bind,
    Rebind,
}

/// Decide what binding `label` to `tag` means, given the label currently
/// holding `tag` (if any).
fn decide(
    label: &QrLabel,
    tag: &HoldTag,
    holder: Option<&QrLabel>,
    force: bool,
) -> Result<Decision, HoldError> {
    if !tag.is_open() {
        return Err(closed_tag(&tag.tag_id, "bind a label to"));
    }
    if label.current_tag_id() == Some(tag.tag_id.as_str()) {
        return Ok(Decision::AlreadyBound);
    }
    if let Some(other) = holder.filter(|h| h.qr_id != label.qr_id) {
        return Err(Conflict::TagBoundElsewhere {
            tag_id: tag.tag_id.clone(),
            current_qr_id: other.qr_id.clone(),
            requested_qr_id: label.qr_id.clone(),
        }
        .into());
    }
    match label.current_tag_id() {
        None => Ok(Decision::Bind),
        Some(_) if force => Ok(Decision::Rebind),
        Some(current) => Err(Conflict::LabelBoundElsewhere {
            qr_id: label.qr_id.clone(),
            current_tag_id: current.to_string(),
            requested_tag_id: tag.tag_id.clone(),
        }
        .into()),
    }
}

/// Binding operations on a [`Store`].
pub struct BindingCoordinator<'a> {
    store: &'a mut Store,
}

impl<'a> BindingCoordinator<'a> {
    pub(crate) fn new(store: &'a mut Store) -> Self {
        Self { store }
    }

    /// Bind a scanned label to a tag.
    ///
    /// # Errors
    ///
    /// [`HoldError::NotFound`] for an unknown label or tag,
    /// [`HoldError::InvalidState`] for a closed tag, and a [`Conflict`] when
    /// the tag holds another label or the label sits on another tag.
    pub fn scan(&mut self, qr_id: &str, tag_id: &str, operator: &str) -> HoldResult<BindOutcome> {
        bind_flow(self.store, qr_id, tag_id, operator, None)
    }

    /// Move a label onto `tag_id`, closing out its current binding with
    /// `reason`. Both steps commit together or not at all.
    ///
    /// # Errors
    ///
    /// [`HoldError::Validation`] for a blank reason, otherwise as
    /// [`Self::scan`] minus the label-bound-elsewhere conflict.
    pub fn force_rebind(
        &mut self,
        qr_id: &str,
        tag_id: &str,
        operator: &str,
        reason: &str,
    ) -> HoldResult<BindOutcome> {
        bind_flow(self.store, qr_id, tag_id, operator, Some(reason))
    }

    /// Explicitly release a label.
    ///
    /// # Errors
    ///
    /// [`HoldError::NotFound`] for an unknown label.
    pub fn unbind(
        &mut self,
        qr_id: &str,
        operator: &str,
        reason: Option<&str>,
    ) -> HoldResult<UnbindOutcome> {
        unbind_flow(self.store, qr_id, operator, reason)
    }

    /// # Errors
    ///
    /// [`HoldError::NotFound`] for an unknown label.
    pub fn query_binding_history(&mut self, qr_id: &str) -> HoldResult<BindingHistory> {
        self.store.ledger().history(qr_id)
    }

    /// The hold tag a scanned label currently points at.
    ///
    /// # Errors
    ///
    /// [`HoldError::NotFound`] for an unknown label.
    pub fn resolve_scan(&mut self, qr_id: &str) -> HoldResult<Option<HoldTag>> {
        let label = self.store.ledger().get_binding(qr_id)?;
        match label.current_tag_id() {
            None => Ok(None),
            Some(tag_id) => self.store.hold_tags().get_hold_tag(tag_id).map(Some),
        }
    }

    /// Every label a tag has carried, the current one last.
    ///
    /// # Errors
    ///
    /// [`HoldError::NotFound`] for an unknown tag.
    pub fn tag_binding_history(&mut self, tag_id: &str) -> HoldResult<Vec<TagLabelAssignment>> {
        self.store.hold_tags().get_hold_tag(tag_id)?;
        ledger::tag_history(self.store.connection(), tag_id).storage("load tag label history")
    }
}

fn normalize_reason(reason: Option<&str>) -> Option<String> {
    reason
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
}

pub(crate) fn bind_flow(
    store: &mut Store,
    qr_id: &str,
    tag_id: &str,
    operator: &str,
    force_reason: Option<&str>,
) -> HoldResult<BindOutcome> {
    validate_qr_id(qr_id)?;
    validate_tag_ref(tag_id)?;
    validate_actor("operator", operator)?;
    let force = force_reason.is_some();
    let reason = normalize_reason(force_reason);
    if force && reason.is_none() {
        return Err(HoldError::validation("reason", "a forced rebind needs a reason"));
    }
    let op = if force { "force_rebind" } else { "bind" };

    let outcome = store.optimistic(
        op,
        EntityKind::QrLabel,
        qr_id,
        |conn| {
            let label = ledger::load_label(conn, qr_id)
                .attempt("load label")?
                .ok_or_else(|| HoldError::label_not_found(qr_id))?;
            let tag = hold_tags::load_hold_tag(conn, tag_id)
                .attempt("load hold tag")?
                .ok_or_else(|| HoldError::tag_not_found(tag_id))?;
            let holder = ledger::find_label_for_tag(conn, tag_id).attempt("find label for tag")?;

            match decide(&label, &tag, holder.as_ref(), force)? {
                Decision::AlreadyBound => Ok(Step::Done(BindOutcome {
                    label,
                    tag,
                    transition: Transition::AlreadyBound,
                })),
                decision => Ok(Step::Apply((label, tag, decision))),
            }
        },
        |tx, (label, tag, decision), now| {
            let (label_version, transition) = if decision == Decision::Rebind {
                let released = ledger::apply_unbind(tx, &label, operator, reason.as_deref(), now)?;
                (label.version + 1, Transition::Rebound { released })
            } else {
                (label.version, Transition::Bound)
            };
            let label = ledger::apply_bind(tx, qr_id, label_version, &tag, operator, now)?;
            let tag = hold_tags::load_hold_tag(tx, tag_id)
                .attempt("reload hold tag")?
                .ok_or_else(|| HoldError::tag_not_found(tag_id))?;
            Ok(BindOutcome {
                label,
                tag,
                transition,
            })
        },
    )?;

    match &outcome.transition {
        Transition::Bound => tracing::info!(qr_id, tag_id, operator, "label bound"),
        Transition::AlreadyBound => tracing::debug!(qr_id, tag_id, "label already bound to tag"),
        Transition::Rebound { released } => tracing::info!(
            qr_id,
            from_tag = %released.tag_id,
            to_tag = tag_id,
            operator,
            reason = reason.as_deref().unwrap_or_default(),
            "label force-rebound"
        ),
    }
    Ok(outcome)
}

pub(crate) fn unbind_flow(
    store: &mut Store,
    qr_id: &str,
    operator: &str,
    reason: Option<&str>,
) -> HoldResult<UnbindOutcome> {
    validate_qr_id(qr_id)?;
    validate_actor("operator", operator)?;
    let reason = normalize_reason(reason);

    let outcome = store.optimistic(
        "unbind",
        EntityKind::QrLabel,
        qr_id,
        |conn| {
            let label = ledger::load_label(conn, qr_id)
                .attempt("load label")?
                .ok_or_else(|| HoldError::label_not_found(qr_id))?;
            if label.is_active() {
                Ok(Step::Apply(label))
            } else {
                Ok(Step::Done(UnbindOutcome {
                    label,
                    released: None,
                }))
            }
        },
        |tx, label, now| {
            let released = ledger::apply_unbind(tx, &label, operator, reason.as_deref(), now)?;
            Ok(UnbindOutcome {
                label: ledger::reload_label(tx, qr_id)?,
                released: Some(released),
            })
        },
    )?;

    if let Some(released) = &outcome.released {
        tracing::info!(qr_id, tag_id = %released.tag_id, operator, "label unbound");
    }
    Ok(outcome)
}

/// Release the label bound to a tag that just closed, inside the closing
/// transaction.
pub(crate) fn on_tag_closed(
    tx: &Transaction<'_>,
    closed: &TagClosed,
) -> Result<Option<PastAssignment>, AttemptError> {
    let Some(label) =
        ledger::find_label_for_tag(tx, &closed.tag_id).attempt("find label for closed tag")?
    else {
        return Ok(None);
    };
    let released = ledger::apply_unbind(
        tx,
        &label,
        &closed.closed_by,
        Some(TAG_CLOSED_REASON),
        closed.closed_at_us,
    )?;
    tracing::debug!(qr_id = %label.qr_id, tag_id = %closed.tag_id, "released label of closed tag");
    Ok(Some(released))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Binding, ProductInfo, QcDetails, Shift, TagStatus};
    use chrono::NaiveDate;

    fn label(qr: &str, tag: Option<&str>) -> QrLabel {
        QrLabel {
            qr_id: qr.into(),
            binding: match tag {
                None => Binding::Unbound,
                Some(t) => Binding::Bound {
                    tag_id: t.into(),
                    assigned_at_us: 1,
                    assigned_by: "op".into(),
                },
            },
            version: 1,
            registered_by: "qc".into(),
            created_at_us: 0,
        }
    }

    fn tag(id: &str, status: TagStatus) -> HoldTag {
        HoldTag {
            tag_id: id.into(),
            tag_number: id.to_uppercase(),
            tag_date: NaiveDate::from_ymd_opt(2024, 5, 1).expect("date"),
            product: ProductInfo::default(),
            qc: QcDetails {
                reason: "hold".into(),
                shift: Shift::A,
                disposition: String::new(),
                outcome: None,
                signed_by: None,
                qc_date: None,
            },
            latest_disposition: String::new(),
            status,
            version: 1,
            created_by: "qc".into(),
            created_at_us: 0,
            updated_at_us: 0,
            closed_at_us: None,
            closed_by: None,
        }
    }

    #[test]
    fn unassigned_label_on_free_tag_binds() {
        let d = decide(&label("QR-1", None), &tag("ht-1", TagStatus::Open), None, false);
        assert_eq!(d.expect("bind"), Decision::Bind);
    }

    #[test]
    fn same_tag_is_already_bound() {
        let l = label("QR-1", Some("ht-1"));
        let d = decide(&l, &tag("ht-1", TagStatus::Open), Some(&l), false);
        assert_eq!(d.expect("noop"), Decision::AlreadyBound);
    }

    #[test]
    fn other_tag_without_force_names_both_tags() {
        let err = decide(
            &label("QR-1", Some("ht-1")),
            &tag("ht-2", TagStatus::Open),
            None,
            false,
        )
        .expect_err("conflict");
        match err {
            HoldError::Conflict(Conflict::LabelBoundElsewhere {
                current_tag_id,
                requested_tag_id,
                ..
            }) => {
                assert_eq!(current_tag_id, "ht-1");
                assert_eq!(requested_tag_id, "ht-2");
            }
            other => panic!("expected LabelBoundElsewhere, got {other:?}"),
        }
    }

    #[test]
    fn other_tag_with_force_rebinds() {
        let d = decide(
            &label("QR-1", Some("ht-1")),
            &tag("ht-2", TagStatus::Open),
            None,
            true,
        );
        assert_eq!(d.expect("rebind"), Decision::Rebind);
    }

    #[test]
    fn occupied_tag_conflicts_even_with_force() {
        let holder = label("QR-9", Some("ht-2"));
        for force in [false, true] {
            let err = decide(
                &label("QR-1", None),
                &tag("ht-2", TagStatus::Open),
                Some(&holder),
                force,
            )
            .expect_err("occupied");
            assert!(matches!(
                err,
                HoldError::Conflict(Conflict::TagBoundElsewhere { .. })
            ));
        }
    }

    #[test]
    fn closed_tag_is_invalid_state() {
        let err = decide(&label("QR-1", None), &tag("ht-1", TagStatus::Closed), None, false)
            .expect_err("closed");
        assert!(matches!(err, HoldError::InvalidState { .. }));
    }

    #[test]
    fn blank_reasons_normalize_to_none() {
        assert_eq!(normalize_reason(Some("   ")), None);
        assert_eq!(normalize_reason(None), None);
        assert_eq!(normalize_reason(Some(" mislabel ")).as_deref(), Some("mislabel"));
    }
}
