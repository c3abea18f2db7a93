//! Shadow model and end-of-run checks.
//!
//! Stations run one at a time, so every operation has exactly one correct
//! result. The [`ShadowModel`] predicts it from a plain in-memory view of the
//! ledger; any difference from what the store returned is a
//! [`Discrepancy`]. After the run, [`final_check`] compares the model with the
//! store and runs the store's own invariant checks.

use std::collections::BTreeMap;

use anyhow::Result;
use holdtag_core::ErrorCode;
use holdtag_core::HoldConfig;
use holdtag_core::model::{DispositionOutcome, TagStatus};
use holdtag_core::verify::{self, Violation};
use holdtag_core::{Store, TagFilter};
use serde::Serialize;

use crate::station::{Action, Effect, Observed, qr_id};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ModelTag {
    tag_id: String,
    open: bool,
    outcome: Option<DispositionOutcome>,
}

/// In-memory view of what the store should contain.
#[derive(Debug, Clone, Default)]
pub struct ShadowModel {
    auto_close: Vec<DispositionOutcome>,
    /// Keyed by slot.
    tags: BTreeMap<usize, ModelTag>,
    /// Registered labels and the slot each is bound to.
    labels: BTreeMap<usize, Option<usize>>,
    /// Closed-out bindings recorded so far.
    releases: usize,
}

/// The store disagreed with the model on one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Discrepancy {
    pub step: usize,
    pub station: String,
    pub action: Action,
    pub expected: Observed,
    pub observed: Observed,
}

/// A difference found after the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FinalMismatch {
    /// The store reported a broken invariant.
    Invariant { violation: Violation },
    /// A label's binding differs from the model.
    Binding {
        qr_id: String,
        expected: Option<String>,
        actual: Option<String>,
    },
    /// A tag's open/closed state differs from the model.
    TagStatus { tag_id: String, expected_open: bool },
    /// Row counts differ from the model.
    Count {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
}

impl ShadowModel {
    #[must_use]
    pub fn new(config: &HoldConfig) -> Self {
        Self {
            auto_close: config.disposition.auto_close.clone(),
            ..Self::default()
        }
    }

    /// Tag id created for `slot`, if any.
    #[must_use]
    pub fn tag_id(&self, slot: usize) -> Option<&str> {
        self.tags.get(&slot).map(|t| t.tag_id.as_str())
    }

    #[must_use]
    pub fn is_registered(&self, label: usize) -> bool {
        self.labels.contains_key(&label)
    }

    #[must_use]
    pub fn bound_slot(&self, label: usize) -> Option<usize> {
        self.labels.get(&label).copied().flatten()
    }

    #[must_use]
    pub fn is_open(&self, slot: usize) -> bool {
        self.tags.get(&slot).is_some_and(|t| t.open)
    }

    /// What the store must answer to `action` in the current state, when the
    /// action's tag slot was resolved to `tag_id`.
    #[must_use]
    pub fn predict(&self, action: &Action, tag_id: &str) -> Observed {
        match *action {
            Action::CreateTag { slot } => {
                if self.tags.contains_key(&slot) {
                    fail(ErrorCode::TagNumberTaken)
                } else {
                    Observed::Success(Effect::Created)
                }
            }
            Action::RegisterLabel { label } => {
                if self.is_registered(label) {
                    fail(ErrorCode::LabelAlreadyRegistered)
                } else {
                    Observed::Success(Effect::Registered)
                }
            }
            Action::Scan { label, slot } => self.predict_bind(label, slot, tag_id, false),
            Action::ForceRebind { label, slot } => self.predict_bind(label, slot, tag_id, true),
            Action::Unbind { label } => {
                if self.is_registered(label) {
                    Observed::Success(Effect::Unbound {
                        released: self.bound_slot(label).is_some(),
                    })
                } else {
                    fail(ErrorCode::LabelNotFound)
                }
            }
            Action::Dispose { slot, outcome } => match self.resolve(slot, tag_id) {
                None => fail(ErrorCode::TagNotFound),
                Some(tag) if !tag.open => fail(ErrorCode::InvalidStateTransition),
                Some(_) => {
                    let closed = self.auto_close.contains(&outcome) && outcome.is_final();
                    Observed::Success(Effect::Disposed {
                        closed,
                        released: closed && self.holder(slot).is_some(),
                    })
                }
            },
            Action::Close { slot } => match self.resolve(slot, tag_id) {
                None => fail(ErrorCode::TagNotFound),
                Some(tag) if !tag.open => Observed::Success(Effect::Closed {
                    already_closed: true,
                    released: false,
                }),
                Some(tag) if !tag.outcome.is_some_and(DispositionOutcome::is_final) => {
                    fail(ErrorCode::InvalidStateTransition)
                }
                Some(_) => Observed::Success(Effect::Closed {
                    already_closed: false,
                    released: self.holder(slot).is_some(),
                }),
            },
        }
    }

    /// The tag in `slot`, if `tag_id` actually names it.
    fn resolve(&self, slot: usize, tag_id: &str) -> Option<&ModelTag> {
        self.tags.get(&slot).filter(|t| t.tag_id == tag_id)
    }

    fn predict_bind(&self, label: usize, slot: usize, tag_id: &str, force: bool) -> Observed {
        if !self.is_registered(label) {
            return fail(ErrorCode::LabelNotFound);
        }
        let Some(tag) = self.resolve(slot, tag_id) else {
            return fail(ErrorCode::TagNotFound);
        };
        if !tag.open {
            return fail(ErrorCode::InvalidStateTransition);
        }
        let current = self.bound_slot(label);
        if current == Some(slot) {
            return Observed::Success(Effect::AlreadyBound);
        }
        if self.holder(slot).is_some_and(|other| other != label) {
            return fail(ErrorCode::TagBoundElsewhere);
        }
        match current {
            None => Observed::Success(Effect::Bound),
            Some(_) if force => Observed::Success(Effect::Rebound),
            Some(_) => fail(ErrorCode::LabelBoundElsewhere),
        }
    }

    fn holder(&self, slot: usize) -> Option<usize> {
        self.labels
            .iter()
            .find(|(_, bound)| **bound == Some(slot))
            .map(|(label, _)| *label)
    }

    /// Advance the model by a successful `action`. `created_tag_id` is the id
    /// the store assigned when `action` created a tag.
    pub fn apply(&mut self, action: &Action, effect: Effect, created_tag_id: Option<String>) {
        match (*action, effect) {
            (Action::CreateTag { slot }, Effect::Created) => {
                self.tags.insert(
                    slot,
                    ModelTag {
                        tag_id: created_tag_id.unwrap_or_default(),
                        open: true,
                        outcome: None,
                    },
                );
            }
            (Action::RegisterLabel { label }, Effect::Registered) => {
                self.labels.insert(label, None);
            }
            (Action::Scan { label, slot } | Action::ForceRebind { label, slot }, Effect::Bound) => {
                self.labels.insert(label, Some(slot));
            }
            (Action::ForceRebind { label, slot }, Effect::Rebound) => {
                self.releases += 1;
                self.labels.insert(label, Some(slot));
            }
            (Action::Unbind { label }, Effect::Unbound { released: true }) => {
                self.releases += 1;
                self.labels.insert(label, None);
            }
            (Action::Dispose { slot, outcome }, Effect::Disposed { closed, .. }) => {
                if let Some(tag) = self.tags.get_mut(&slot) {
                    tag.outcome = Some(outcome);
                }
                if closed {
                    self.close(slot);
                }
            }
            (Action::Close { slot }, Effect::Closed { already_closed: false, .. }) => {
                self.close(slot);
            }
            _ => {}
        }
    }

    fn close(&mut self, slot: usize) {
        if let Some(tag) = self.tags.get_mut(&slot) {
            tag.open = false;
        }
        if let Some(label) = self.holder(slot) {
            self.releases += 1;
            self.labels.insert(label, None);
        }
    }
}

const fn fail(code: ErrorCode) -> Observed {
    Observed::Failed(code.code())
}

/// Compare the finished store with the model and run the invariant checks.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub fn final_check(store: &mut Store, model: &ShadowModel) -> Result<Vec<FinalMismatch>> {
    let mut out: Vec<FinalMismatch> = verify::check_invariants(store.connection())?
        .violations
        .into_iter()
        .map(|violation| FinalMismatch::Invariant { violation })
        .collect();

    let labels = store.ledger().list_labels(false)?;
    push_count(&mut out, "labels", model.labels.len(), labels.len());
    for label in &labels {
        let expected = qr_slot(&label.qr_id)
            .and_then(|idx| model.bound_slot(idx))
            .and_then(|slot| model.tag_id(slot))
            .map(str::to_string);
        let actual = label.current_tag_id().map(str::to_string);
        if expected != actual {
            out.push(FinalMismatch::Binding {
                qr_id: label.qr_id.clone(),
                expected,
                actual,
            });
        }
    }

    let tags = store.hold_tags().list_hold_tags(&TagFilter::default())?;
    push_count(&mut out, "hold tags", model.tags.len(), tags.len());
    for (slot, model_tag) in &model.tags {
        let Some(tag) = tags.iter().find(|t| t.tag_id == model_tag.tag_id) else {
            out.push(FinalMismatch::TagStatus {
                tag_id: model_tag.tag_id.clone(),
                expected_open: model.is_open(*slot),
            });
            continue;
        };
        if (tag.status == TagStatus::Open) != model_tag.open {
            out.push(FinalMismatch::TagStatus {
                tag_id: tag.tag_id.clone(),
                expected_open: model_tag.open,
            });
        }
    }

    let released: usize = labels
        .iter()
        .map(|label| store.ledger().history(&label.qr_id).map(|h| h.previous_assignments.len()))
        .sum::<Result<usize, _>>()?;
    push_count(&mut out, "released bindings", model.releases, released);

    Ok(out)
}

fn push_count(out: &mut Vec<FinalMismatch>, what: &'static str, expected: usize, actual: usize) {
    if expected != actual {
        out.push(FinalMismatch::Count {
            what,
            expected,
            actual,
        });
    }
}

fn qr_slot(qr: &str) -> Option<usize> {
    qr.strip_prefix("QR-")
        .and_then(|n| n.parse().ok())
        .filter(|idx| qr_id(*idx) == qr)
}
