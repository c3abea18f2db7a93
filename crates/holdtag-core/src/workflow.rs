//! QC disposition workflow: record a decision and, for outcomes configured
//! to auto-close, close the tag and release its label in the same commit.

use serde::Serialize;

use crate::error::{EntityKind, HoldResult};
use crate::model::ids::validate_tag_ref;
use crate::model::{DispositionInput, HoldTag, PastAssignment};
use crate::store::hold_tags::{self, CloseReceipt};
use crate::store::{Step, Store};

/// Result of recording a disposition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispositionReceipt {
    pub tag: HoldTag,
    /// The outcome auto-closed the tag.
    pub closed: bool,
    /// Label released by the auto-close, if one was bound.
    pub released: Option<PastAssignment>,
}

/// Disposition operations on a [`Store`].
pub struct DispositionWorkflow<'a> {
    store: &'a mut Store,
}

impl<'a> DispositionWorkflow<'a> {
    pub(crate) fn new(store: &'a mut Store) -> Self {
        Self { store }
    }

    /// Validate and record a QC decision, closing the tag when the outcome
    /// is listed in `disposition.auto_close`.
    ///
    /// # Errors
    ///
    /// [`crate::HoldError::Validation`] for a malformed payload, otherwise
    /// the errors of [`crate::HoldTagStore::update_disposition`].
    pub fn record_disposition(
        &mut self,
        tag_id: &str,
        input: &DispositionInput,
    ) -> HoldResult<DispositionReceipt> {
        validate_tag_ref(tag_id)?;
        let validated = input.validate(self.store.config().disposition.max_note_len)?;
        let auto_close = self.store.config().auto_closes(validated.disposition.outcome);

        let receipt = self.store.optimistic(
            "record_disposition",
            EntityKind::HoldTag,
            tag_id,
            |conn| {
                Ok(Step::<_, DispositionReceipt>::Apply(hold_tags::plan_disposition(
                    conn, tag_id,
                )?))
            },
            |tx, current, now| {
                let updated = hold_tags::apply_disposition(
                    tx,
                    &current,
                    &validated.disposition,
                    &validated.signed_by,
                    validated.qc_date,
                    now,
                )?;
                if !auto_close {
                    return Ok(DispositionReceipt {
                        tag: updated,
                        closed: false,
                        released: None,
                    });
                }
                let CloseReceipt { tag, released, .. } =
                    hold_tags::close_with_cascade(tx, &updated, &validated.signed_by, now)?;
                Ok(DispositionReceipt {
                    tag,
                    closed: true,
                    released,
                })
            },
        )?;

        tracing::info!(
            tag_id,
            outcome = %validated.disposition.outcome,
            signed_by = %validated.signed_by,
            closed = receipt.closed,
            released_label = receipt.released.as_ref().map(|p| p.qr_id.as_str()),
            "disposition recorded"
        );
        Ok(receipt)
    }

    /// Close a tag explicitly, releasing its label.
    ///
    /// # Errors
    ///
    /// As [`crate::HoldTagStore::close_hold_tag`].
    pub fn close_hold_tag(&mut self, tag_id: &str, closed_by: &str) -> HoldResult<CloseReceipt> {
        self.store.hold_tags().close_hold_tag(tag_id, closed_by)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HoldConfig;
    use crate::error::HoldError;
    use crate::model::{DispositionOutcome, NewHoldTag, ProductInfo, TagStatus};

    fn store_with(config: HoldConfig) -> Store {
        Store::open_in_memory(config).expect("open store")
    }

    fn tag(store: &mut Store) -> HoldTag {
        store
            .hold_tags()
            .create_hold_tag(
                &NewHoldTag {
                    tag_number: "HT-100".into(),
                    date: String::new(),
                    product: ProductInfo {
                        product: "Granola Bars".into(),
                        amount: 8,
                        ..ProductInfo::default()
                    },
                    reason: "Foreign material".into(),
                    shift: "C".into(),
                },
                "qc",
            )
            .expect("create")
    }

    fn input(outcome: &str) -> DispositionInput {
        DispositionInput {
            outcome: outcome.into(),
            note: "checked by lab".into(),
            signed_by: "supervisor".into(),
            qc_date: "2024-05-03".into(),
        }
    }

    #[test]
    fn release_auto_closes_and_releases_label() {
        let mut store = store_with(HoldConfig::default());
        let t = tag(&mut store);
        store.ledger().register_label("QR-1", "qc").expect("register");
        store.coordinator().scan("QR-1", &t.tag_id, "op").expect("scan");

        let receipt = store
            .workflow()
            .record_disposition(&t.tag_id, &input("release"))
            .expect("record");
        assert!(receipt.closed);
        assert_eq!(receipt.tag.status, TagStatus::Closed);
        assert_eq!(receipt.tag.qc.outcome, Some(DispositionOutcome::Release));
        let released = receipt.released.expect("label released");
        assert_eq!(released.qr_id, "QR-1");
        assert_eq!(released.reason.as_deref(), Some("tag closed"));

        assert!(!store.ledger().get_binding("QR-1").expect("label").is_active());
    }

    #[test]
    fn rework_keeps_tag_open_by_default() {
        let mut store = store_with(HoldConfig::default());
        let t = tag(&mut store);
        let receipt = store
            .workflow()
            .record_disposition(&t.tag_id, &input("rework"))
            .expect("record");
        assert!(!receipt.closed);
        assert!(receipt.tag.is_open());
        assert_eq!(receipt.tag.latest_disposition, "rework: checked by lab");

        let closed = store
            .workflow()
            .close_hold_tag(&t.tag_id, "supervisor")
            .expect("explicit close");
        assert_eq!(closed.tag.status, TagStatus::Closed);
    }

    #[test]
    fn auto_close_set_is_configurable() {
        let mut config = HoldConfig::default();
        config.disposition.auto_close = vec![DispositionOutcome::Rework];
        let mut store = store_with(config);
        let t = tag(&mut store);

        let receipt = store
            .workflow()
            .record_disposition(&t.tag_id, &input("rework"))
            .expect("record");
        assert!(receipt.closed);
    }

    #[test]
    fn invalid_payload_writes_nothing() {
        let mut store = store_with(HoldConfig::default());
        let t = tag(&mut store);
        let mut bad = input("release");
        bad.qc_date = "05/03/2024".into();

        let err = store
            .workflow()
            .record_disposition(&t.tag_id, &bad)
            .expect_err("bad date");
        assert!(matches!(err, HoldError::Validation { field: "qc_date", .. }));
        assert_eq!(store.hold_tags().get_hold_tag(&t.tag_id).expect("get"), t);
    }

    #[test]
    fn pending_outcome_never_closes() {
        let mut store = store_with(HoldConfig::default());
        let t = tag(&mut store);
        let receipt = store
            .workflow()
            .record_disposition(&t.tag_id, &input("pending"))
            .expect("record");
        assert!(!receipt.closed);
    }
}
