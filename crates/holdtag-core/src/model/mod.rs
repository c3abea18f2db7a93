//! Domain records and caller-facing input payloads.

pub mod disposition;
pub mod hold_tag;
pub mod ids;
pub mod label;

pub use disposition::{Disposition, DispositionInput, DispositionOutcome, ValidatedDisposition};
pub use hold_tag::{HoldTag, NewHoldTag, ProductInfo, QcDetails, Shift, TagStatus};
pub use label::{Binding, BindingHistory, PastAssignment, QrLabel, TagLabelAssignment};
