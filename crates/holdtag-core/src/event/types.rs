//! Event type enum covering every audited mutation.
//!
//! String representation uses the `<entity>.<verb>` dotted format stored in
//! the `events` table.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The six event types in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EventType {
    /// A hold tag was recorded.
    TagCreate,
    /// A disposition was written onto a hold tag.
    TagDisposition,
    /// A hold tag was closed.
    TagClose,
    /// A physical QR label was registered.
    LabelRegister,
    /// A label was bound to a hold tag.
    LabelBind,
    /// A label was released from its hold tag.
    LabelUnbind,
}

/// Error returned when parsing an unknown event type string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownEventType {
    /// The unrecognised input string.
    pub raw: String,
}

impl fmt::Display for UnknownEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown event type '{}': expected one of tag.create, tag.disposition, \
             tag.close, label.register, label.bind, label.unbind",
            self.raw
        )
    }
}

impl std::error::Error for UnknownEventType {}

impl EventType {
    /// All known event types in catalog order.
    pub const ALL: [Self; 6] = [
        Self::TagCreate,
        Self::TagDisposition,
        Self::TagClose,
        Self::LabelRegister,
        Self::LabelBind,
        Self::LabelUnbind,
    ];

    /// Return the canonical dotted string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TagCreate => "tag.create",
            Self::TagDisposition => "tag.disposition",
            Self::TagClose => "tag.close",
            Self::LabelRegister => "label.register",
            Self::LabelBind => "label.bind",
            Self::LabelUnbind => "label.unbind",
        }
    }

    /// Whether the event mutates a QR label (and so feeds the label projection).
    #[must_use]
    pub const fn is_label_event(self) -> bool {
        matches!(self, Self::LabelRegister | Self::LabelBind | Self::LabelUnbind)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tag.create" => Ok(Self::TagCreate),
            "tag.disposition" => Ok(Self::TagDisposition),
            "tag.close" => Ok(Self::TagClose),
            "label.register" => Ok(Self::LabelRegister),
            "label.bind" => Ok(Self::LabelBind),
            "label.unbind" => Ok(Self::LabelUnbind),
            _ => Err(UnknownEventType { raw: s.to_string() }),
        }
    }
}

impl TryFrom<String> for EventType {
    type Error = UnknownEventType;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.as_str().to_string()
    }
}
