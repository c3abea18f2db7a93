//! Scanning stations and the operations they issue.
//!
//! Each station owns its own [`Store`] on the shared database file, the same
//! way physical stations do on the floor.

use std::path::Path;

use anyhow::Result;
use holdtag_core::model::{DispositionInput, DispositionOutcome, NewHoldTag, ProductInfo};
use holdtag_core::{HoldConfig, HoldError, Store, Transition};
use serde::Serialize;

/// Date stamped on every simulated disposition.
pub const SIM_QC_DATE: &str = "2024-05-01";

/// One operation issued by a station.
///
/// Tags are addressed by slot; the simulator resolves a slot to the tag id the
/// store generated, or to a placeholder id for a slot that was never created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Action {
    CreateTag { slot: usize },
    RegisterLabel { label: usize },
    Scan { label: usize, slot: usize },
    ForceRebind { label: usize, slot: usize },
    Unbind { label: usize },
    Dispose { slot: usize, outcome: DispositionOutcome },
    Close { slot: usize },
}

/// What a successful operation did, reduced to what the oracle can predict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum Effect {
    Created,
    Registered,
    Bound,
    AlreadyBound,
    Rebound,
    Unbound { released: bool },
    Disposed { closed: bool, released: bool },
    Closed { already_closed: bool, released: bool },
}

/// Result of one operation: an effect, or the stable error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Observed {
    Success(Effect),
    Failed(&'static str),
}

impl Observed {
    fn from_result<T>(result: Result<T, HoldError>, effect: impl FnOnce(T) -> Effect) -> Self {
        match result {
            Ok(value) => Self::Success(effect(value)),
            Err(err) => Self::Failed(err.code().code()),
        }
    }
}

#[must_use]
pub fn tag_number(slot: usize) -> String {
    format!("HT-{slot:04}")
}

#[must_use]
pub fn qr_id(label: usize) -> String {
    format!("QR-{label:04}")
}

/// Placeholder id for a slot that has no tag yet. Never generated by the store.
#[must_use]
pub fn missing_tag_id(slot: usize) -> String {
    format!("ht-missing{slot}")
}

/// A scanning station.
#[derive(Debug)]
pub struct Station {
    pub name: String,
    store: Store,
}

impl Station {
    /// Open a station's store on the shared database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open(index: usize, path: &Path, config: HoldConfig) -> Result<Self> {
        Ok(Self {
            name: format!("station-{index}"),
            store: Store::open(path, config)?,
        })
    }

    pub const fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    /// Perform `action`. `tag_id` is the resolved id for the action's slot.
    ///
    /// Returns the observed result and, for a created tag, its new id.
    pub fn perform(&mut self, action: &Action, tag_id: &str) -> (Observed, Option<String>) {
        let name = self.name.clone();
        match action {
            Action::CreateTag { slot } => {
                let fields = new_tag(*slot);
                match self.store.hold_tags().create_hold_tag(&fields, &name) {
                    Ok(tag) => (Observed::Success(Effect::Created), Some(tag.tag_id)),
                    Err(err) => (Observed::Failed(err.code().code()), None),
                }
            }
            Action::RegisterLabel { label } => {
                let result = self.store.ledger().register_label(&qr_id(*label), &name);
                (Observed::from_result(result, |_| Effect::Registered), None)
            }
            Action::Scan { label, .. } => {
                let result = self.store.coordinator().scan(&qr_id(*label), tag_id, &name);
                (Observed::from_result(result, |o| transition_effect(&o.transition)), None)
            }
            Action::ForceRebind { label, .. } => {
                let result =
                    self.store
                        .coordinator()
                        .force_rebind(&qr_id(*label), tag_id, &name, "relabel");
                (Observed::from_result(result, |o| transition_effect(&o.transition)), None)
            }
            Action::Unbind { label } => {
                let result = self.store.coordinator().unbind(&qr_id(*label), &name, None);
                let observed = Observed::from_result(result, |o| Effect::Unbound {
                    released: o.released.is_some(),
                });
                (observed, None)
            }
            Action::Dispose { outcome, .. } => {
                let input = DispositionInput {
                    outcome: outcome.as_str().to_string(),
                    note: format!("{outcome} by {name}"),
                    signed_by: name.clone(),
                    qc_date: SIM_QC_DATE.to_string(),
                };
                let result = self.store.workflow().record_disposition(tag_id, &input);
                let observed = Observed::from_result(result, |r| Effect::Disposed {
                    closed: r.closed,
                    released: r.released.is_some(),
                });
                (observed, None)
            }
            Action::Close { .. } => {
                let result = self.store.workflow().close_hold_tag(tag_id, &name);
                let observed = Observed::from_result(result, |r| Effect::Closed {
                    already_closed: r.already_closed,
                    released: r.released.is_some(),
                });
                (observed, None)
            }
        }
    }
}

const fn transition_effect(transition: &Transition) -> Effect {
    match transition {
        Transition::Bound => Effect::Bound,
        Transition::AlreadyBound => Effect::AlreadyBound,
        Transition::Rebound { .. } => Effect::Rebound,
    }
}

fn new_tag(slot: usize) -> NewHoldTag {
    let shifts = ["A", "B", "C", "D"];
    NewHoldTag {
        tag_number: tag_number(slot),
        date: SIM_QC_DATE.to_string(),
        product: ProductInfo {
            product: "Wafers".to_string(),
            size: "12oz".to_string(),
            code: format!("WF-{slot}"),
            location: "Dock 4".to_string(),
            amount: u32::try_from(slot % 40 + 1).unwrap_or(1),
            ..ProductInfo::default()
        },
        reason: "Seal integrity".to_string(),
        shift: shifts[slot % shifts.len()].to_string(),
    }
}
