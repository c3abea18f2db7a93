use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use chrono::NaiveDate;

use crate::error::HoldError;
use crate::model::ids::validate_actor;

/// Closed set of QC decisions for held inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispositionOutcome {
    /// Decision not made yet; the note records interim findings.
    Pending,
    /// Inventory cleared for use.
    Release,
    /// Inventory sent back for rework.
    Rework,
    /// Inventory scrapped.
    Destroy,
}

impl DispositionOutcome {
    pub const ALL: [Self; 4] = [Self::Pending, Self::Release, Self::Rework, Self::Destroy];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Release => "release",
            Self::Rework => "rework",
            Self::Destroy => "destroy",
        }
    }

    /// Whether this outcome resolves the hold, allowing the tag to close.
    #[must_use]
    pub const fn is_final(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for DispositionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispositionOutcome {
    type Err = HoldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "release" | "released" => Ok(Self::Release),
            "rework" => Ok(Self::Rework),
            "destroy" | "destroyed" | "disposed" => Ok(Self::Destroy),
            other => Err(HoldError::validation(
                "outcome",
                format!("'{other}' is not one of pending, release, rework, destroy"),
            )),
        }
    }
}

/// A validated disposition ready to be written onto a hold tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disposition {
    pub outcome: DispositionOutcome,
    /// Free-text note attached to the decision.
    pub note: String,
}

impl Disposition {
    /// Text cached as the tag's `latest_disposition`.
    #[must_use]
    pub fn summary(&self) -> String {
        if self.note.is_empty() {
            self.outcome.to_string()
        } else {
            format!("{}: {}", self.outcome, self.note)
        }
    }
}

/// Disposition payload as submitted by a QC station.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispositionInput {
    pub outcome: String,
    #[serde(default)]
    pub note: String,
    pub signed_by: String,
    /// ISO date (`YYYY-MM-DD`) the decision was signed.
    pub qc_date: String,
}

/// Output of [`DispositionInput::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedDisposition {
    pub disposition: Disposition,
    pub signed_by: String,
    pub qc_date: NaiveDate,
}

impl DispositionInput {
    /// Validate and normalize the payload.
    ///
    /// # Errors
    ///
    /// Returns [`HoldError::Validation`] for an unknown outcome, a blank
    /// signer, a malformed QC date, or a note longer than `max_note_len`.
    pub fn validate(&self, max_note_len: usize) -> Result<ValidatedDisposition, HoldError> {
        let outcome: DispositionOutcome = self.outcome.parse()?;
        validate_actor("signed_by", &self.signed_by)?;

        let qc_date = parse_qc_date(&self.qc_date)?;

        let note = self.note.trim().to_string();
        if note.chars().count() > max_note_len {
            return Err(HoldError::validation(
                "note",
                format!("longer than {max_note_len} characters"),
            ));
        }

        Ok(ValidatedDisposition {
            disposition: Disposition { outcome, note },
            signed_by: self.signed_by.trim().to_string(),
            qc_date,
        })
    }
}

/// Parse an ISO `YYYY-MM-DD` date field.
///
/// # Errors
///
/// Returns [`HoldError::Validation`] naming `qc_date` if parsing fails.
pub fn parse_qc_date(raw: &str) -> Result<NaiveDate, HoldError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|e| {
        HoldError::validation("qc_date", format!("'{raw}' is not a YYYY-MM-DD date ({e})"))
    })
}
