//! Typed payload data structs for each event type.
//!
//! The discriminant is stored in the `event_type` column, not inside the JSON,
//! so deserialization goes through [`EventData::deserialize_for`].

use serde::{Deserialize, Serialize};
use std::fmt;

use super::types::EventType;
use crate::model::{DispositionOutcome, Shift};

/// Typed payload for an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventData {
    TagCreate(TagCreateData),
    TagDisposition(TagDispositionData),
    TagClose(TagCloseData),
    LabelRegister(LabelRegisterData),
    LabelBind(LabelBindData),
    LabelUnbind(LabelUnbindData),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCreateData {
    pub tag_number: String,
    pub product: String,
    pub amount: u32,
    pub shift: Shift,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDispositionData {
    pub outcome: DispositionOutcome,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub note: String,
    pub signed_by: String,
    pub qc_date: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCloseData {
    pub latest_disposition: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LabelRegisterData {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelBindData {
    pub tag_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelUnbindData {
    pub tag_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when a stored payload does not match its event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataParseError {
    pub event_type: EventType,
    pub message: String,
}

impl fmt::Display for DataParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {} payload: {}", self.event_type, self.message)
    }
}

impl std::error::Error for DataParseError {}

impl EventData {
    /// The event type this payload belongs to.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        match self {
            Self::TagCreate(_) => EventType::TagCreate,
            Self::TagDisposition(_) => EventType::TagDisposition,
            Self::TagClose(_) => EventType::TagClose,
            Self::LabelRegister(_) => EventType::LabelRegister,
            Self::LabelBind(_) => EventType::LabelBind,
            Self::LabelUnbind(_) => EventType::LabelUnbind,
        }
    }

    /// Deserialize a JSON payload into the variant selected by `event_type`.
    ///
    /// # Errors
    ///
    /// Returns a [`DataParseError`] if the JSON is malformed or does not match
    /// the schema for the given event type.
    pub fn deserialize_for(event_type: EventType, json: &str) -> Result<Self, DataParseError> {
        let result = match event_type {
            EventType::TagCreate => serde_json::from_str(json).map(Self::TagCreate),
            EventType::TagDisposition => serde_json::from_str(json).map(Self::TagDisposition),
            EventType::TagClose => serde_json::from_str(json).map(Self::TagClose),
            EventType::LabelRegister => serde_json::from_str(json).map(Self::LabelRegister),
            EventType::LabelBind => serde_json::from_str(json).map(Self::LabelBind),
            EventType::LabelUnbind => serde_json::from_str(json).map(Self::LabelUnbind),
        };
        result.map_err(|e| DataParseError {
            event_type,
            message: e.to_string(),
        })
    }

    /// Serialize the inner payload to compact JSON.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if serialization fails.
    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            Self::TagCreate(d) => serde_json::to_string(d),
            Self::TagDisposition(d) => serde_json::to_string(d),
            Self::TagClose(d) => serde_json::to_string(d),
            Self::LabelRegister(d) => serde_json::to_string(d),
            Self::LabelBind(d) => serde_json::to_string(d),
            Self::LabelUnbind(d) => serde_json::to_string(d),
        }
    }
}

impl Serialize for EventData {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::TagCreate(d) => d.serialize(serializer),
            Self::TagDisposition(d) => d.serialize(serializer),
            Self::TagClose(d) => d.serialize(serializer),
            Self::LabelRegister(d) => d.serialize(serializer),
            Self::LabelBind(d) => d.serialize(serializer),
            Self::LabelUnbind(d) => d.serialize(serializer),
        }
    }
}
