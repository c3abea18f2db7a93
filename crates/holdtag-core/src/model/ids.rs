//! Identifier validation and generation for hold tags and QR labels.
//!
//! Hold tag ids are generated by the store (`ht-` followed by 10 base36
//! characters). QR label ids are printed on the physical label and supplied by
//! the caller, so they are validated but never generated.

use rand::Rng;

use crate::error::HoldError;

/// Prefix for generated hold tag ids.
pub const TAG_ID_PREFIX: &str = "ht-";

/// Longest accepted QR label code.
pub const MAX_QR_ID_LEN: usize = 128;

const TAG_ID_SUFFIX_LEN: usize = 10;
const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generate a fresh hold tag id.
///
/// The suffix is derived from a BLAKE3 digest over the tag number, the
/// creation timestamp and 64 bits of entropy, so two stations creating tags
/// in the same microsecond still diverge.
#[must_use]
pub fn generate_tag_id(tag_number: &str, created_at_us: i64) -> String {
    let entropy: u64 = rand::thread_rng().r#gen();
    let mut hasher = blake3::Hasher::new();
    hasher.update(tag_number.as_bytes());
    hasher.update(&created_at_us.to_le_bytes());
    hasher.update(&entropy.to_le_bytes());
    let digest = hasher.finalize();

    let mut id = String::with_capacity(TAG_ID_PREFIX.len() + TAG_ID_SUFFIX_LEN);
    id.push_str(TAG_ID_PREFIX);
    for byte in digest.as_bytes().iter().take(TAG_ID_SUFFIX_LEN) {
        id.push(char::from(BASE36[usize::from(*byte) % BASE36.len()]));
    }
    id
}

/// Validate a QR label code as scanned.
///
/// # Errors
///
/// Returns [`HoldError::Validation`] if the code is empty, too long, or
/// contains whitespace or control characters.
pub fn validate_qr_id(qr_id: &str) -> Result<(), HoldError> {
    if qr_id.is_empty() {
        return Err(HoldError::validation("qr_id", "must not be empty"));
    }
    if qr_id.len() > MAX_QR_ID_LEN {
        return Err(HoldError::validation(
            "qr_id",
            format!("longer than {MAX_QR_ID_LEN} bytes"),
        ));
    }
    if qr_id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(HoldError::validation(
            "qr_id",
            format!("'{}' contains whitespace or control characters", qr_id.escape_debug()),
        ));
    }
    Ok(())
}

/// Validate a hold tag id reference supplied by a caller.
///
/// # Errors
///
/// Returns [`HoldError::Validation`] if the id is blank.
pub fn validate_tag_ref(tag_id: &str) -> Result<(), HoldError> {
    if tag_id.trim().is_empty() {
        return Err(HoldError::validation("tag_id", "must not be empty"));
    }
    Ok(())
}

/// Validate a caller-supplied identity (`assigned_by`, `signed_by`, ...).
///
/// # Errors
///
/// Returns [`HoldError::Validation`] naming `field` if the identity is blank.
pub fn validate_actor(field: &'static str, actor: &str) -> Result<(), HoldError> {
    if actor.trim().is_empty() {
        return Err(HoldError::validation(field, "must not be empty"));
    }
    Ok(())
}
