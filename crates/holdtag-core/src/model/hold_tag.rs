use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::error::HoldError;
use crate::model::disposition::{DispositionOutcome, parse_qc_date};

/// The four production shifts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Shift {
    A,
    B,
    C,
    D,
}

impl Shift {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
        }
    }
}

impl fmt::Display for Shift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Shift {
    type Err = HoldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Self::A),
            "B" => Ok(Self::B),
            "C" => Ok(Self::C),
            "D" => Ok(Self::D),
            other => Err(HoldError::validation(
                "shift",
                format!("'{other}' is not one of A, B, C, D"),
            )),
        }
    }
}

/// Hold tag lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagStatus {
    Open,
    Closed,
}

impl TagStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for TagStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TagStatus {
    type Err = HoldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            other => Err(HoldError::validation(
                "status",
                format!("'{other}' is not one of open, closed"),
            )),
        }
    }
}

/// Product metadata copied from the pallet being held.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductInfo {
    pub product: String,
    pub size: String,
    pub code: String,
    pub location: String,
    pub pallet_tag: String,
    pub amount: u32,
    pub formula: String,
    pub upc: String,
}

/// Quality-control section of a hold tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QcDetails {
    pub reason: String,
    pub shift: Shift,
    /// Free-text disposition note; empty until a disposition is recorded.
    pub disposition: String,
    pub outcome: Option<DispositionOutcome>,
    pub signed_by: Option<String>,
    pub qc_date: Option<NaiveDate>,
}

/// The canonical hold tag record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldTag {
    pub tag_id: String,
    pub tag_number: String,
    pub tag_date: NaiveDate,
    pub product: ProductInfo,
    pub qc: QcDetails,
    pub latest_disposition: String,
    pub status: TagStatus,
    pub version: i64,
    pub created_by: String,
    pub created_at_us: i64,
    pub updated_at_us: i64,
    pub closed_at_us: Option<i64>,
    pub closed_by: Option<String>,
}

impl HoldTag {
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == TagStatus::Open
    }

    /// Whether a final outcome has been recorded, which is required to close.
    #[must_use]
    pub fn has_final_disposition(&self) -> bool {
        self.qc.outcome.is_some_and(DispositionOutcome::is_final)
    }
}

/// Hold tag fields as submitted when a QC hold is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewHoldTag {
    pub tag_number: String,
    /// ISO date printed on the tag; defaults to today when empty.
    pub date: String,
    #[serde(flatten)]
    pub product: ProductInfo,
    pub reason: String,
    pub shift: String,
}

/// Output of [`NewHoldTag::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedHoldTag {
    pub tag_number: String,
    pub tag_date: Option<NaiveDate>,
    pub product: ProductInfo,
    pub reason: String,
    pub shift: Shift,
}

impl NewHoldTag {
    /// Check required QC fields and normalize whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`HoldError::Validation`] naming the first offending field.
    pub fn validate(&self) -> Result<ValidatedHoldTag, HoldError> {
        let tag_number = required("tag_number", &self.tag_number)?;
        let product_name = required("product", &self.product.product)?;
        let reason = required("reason", &self.reason)?;
        if self.shift.trim().is_empty() {
            return Err(HoldError::validation("shift", "is required"));
        }
        let shift: Shift = self.shift.parse()?;
        if self.product.amount == 0 {
            return Err(HoldError::validation("amount", "must be greater than zero"));
        }

        let tag_date = if self.date.trim().is_empty() {
            None
        } else {
            Some(parse_qc_date(&self.date).map_err(|_| {
                HoldError::validation("date", format!("'{}' is not a YYYY-MM-DD date", self.date))
            })?)
        };

        let product = ProductInfo {
            product: product_name,
            size: self.product.size.trim().to_string(),
            code: self.product.code.trim().to_string(),
            location: self.product.location.trim().to_string(),
            pallet_tag: self.product.pallet_tag.trim().to_string(),
            amount: self.product.amount,
            formula: self.product.formula.trim().to_string(),
            upc: self.product.upc.trim().to_string(),
        };

        Ok(ValidatedHoldTag {
            tag_number,
            tag_date,
            product,
            reason,
            shift,
        })
    }
}

fn required(field: &'static str, value: &str) -> Result<String, HoldError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(HoldError::validation(field, "is required"));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NewHoldTag {
        NewHoldTag {
            tag_number: "HT-1042".into(),
            date: "2024-05-01".into(),
            product: ProductInfo {
                product: "Vanilla Wafers".into(),
                size: "12oz".into(),
                code: "VW12".into(),
                location: "Dock 4".into(),
                pallet_tag: "P-88812".into(),
                amount: 40,
                formula: "F-221".into(),
                upc: "012345678905".into(),
            },
            reason: "Underweight packs".into(),
            shift: "b".into(),
        }
    }

    #[test]
    fn validate_accepts_complete_tag() {
        let v = sample().validate().expect("valid tag");
        assert_eq!(v.shift, Shift::B);
        assert_eq!(v.tag_date, NaiveDate::from_ymd_opt(2024, 5, 1));
    }

    #[test]
    fn validate_rejects_unknown_shift() {
        let mut t = sample();
        t.shift = "E".into();
        let err = t.validate().expect_err("shift E");
        assert!(matches!(err, HoldError::Validation { field: "shift", .. }));
    }

    #[test]
    fn validate_reports_missing_required_fields() {
        let cases: [(&str, fn(&mut NewHoldTag)); 5] = [
            ("tag_number", |t| t.tag_number.clear()),
            ("product", |t| t.product.product = "  ".into()),
            ("reason", |t| t.reason.clear()),
            ("shift", |t| t.shift.clear()),
            ("amount", |t| t.product.amount = 0),
        ];
        for (field, mutate) in cases {
            let mut t = sample();
            mutate(&mut t);
            match t.validate() {
                Err(HoldError::Validation { field: got, .. }) => assert_eq!(got, field),
                other => panic!("expected validation error on {field}, got {other:?}"),
            }
        }
    }

    #[test]
    fn new_hold_tag_deserializes_flat_json() {
        let json = r#"{
            "tag_number": "HT-7",
            "product": "Crackers",
            "amount": 12,
            "palletTag": "ignored",
            "pallet_tag": "P-1",
            "reason": "Seal failure",
            "shift": "D"
        }"#;
        let t: NewHoldTag = serde_json::from_str(json).expect("parse");
        assert_eq!(t.product.pallet_tag, "P-1");
        assert_eq!(t.product.amount, 12);
        assert!(t.validate().is_ok());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [TagStatus::Open, TagStatus::Closed] {
            assert_eq!(status.as_str().parse::<TagStatus>().ok(), Some(status));
        }
    }
}
