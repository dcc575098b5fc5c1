//! Input validation for the public surface
//!
//! Every save request passes through here before touching storage.

use serde_json::{Map, Value};

use crate::constants::{
    MAX_CONTENT_BYTES, MAX_METADATA_BYTES, MAX_PRINCIPAL_BYTES,
};
use crate::errors::{MemoryError, Result};

/// Validate a user or session identifier: non-empty, bounded, no NUL bytes.
pub fn validate_principal(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(MemoryError::invalid(field, "must not be empty"));
    }
    if value.len() > MAX_PRINCIPAL_BYTES {
        return Err(MemoryError::invalid(
            field,
            format!("exceeds {MAX_PRINCIPAL_BYTES} bytes"),
        ));
    }
    if value.contains('\0') {
        return Err(MemoryError::invalid(field, "must not contain NUL"));
    }
    // Session ids become sidecar filenames.
    if value.contains('/') || value.contains('\\') || value == "." || value == ".." {
        return Err(MemoryError::invalid(
            field,
            "must not contain path separators",
        ));
    }
    Ok(())
}

/// Validate content bounds: 1 byte to 100 KiB.
pub fn validate_content(content: &str) -> Result<()> {
    if content.is_empty() {
        return Err(MemoryError::invalid("content", "must not be empty"));
    }
    if content.len() > MAX_CONTENT_BYTES {
        return Err(MemoryError::TooLarge {
            what: "content".to_string(),
            size: content.len(),
            max: MAX_CONTENT_BYTES,
        });
    }
    Ok(())
}

/// Validate metadata: total encoded size at most 16 KiB.
pub fn validate_metadata(metadata: &Map<String, Value>) -> Result<()> {
    if metadata.is_empty() {
        return Ok(());
    }
    let encoded = serde_json::to_vec(metadata).map_err(|e| MemoryError::Internal(e.into()))?;
    if encoded.len() > MAX_METADATA_BYTES {
        return Err(MemoryError::TooLarge {
            what: "metadata".to_string(),
            size: encoded.len(),
            max: MAX_METADATA_BYTES,
        });
    }
    Ok(())
}

/// Validate an importance weight: must land in [0.0, 1.0] and be finite.
pub fn validate_importance(importance: f32) -> Result<()> {
    if !importance.is_finite() || !(0.0..=1.0).contains(&importance) {
        return Err(MemoryError::invalid(
            "importance",
            "must be within [0.0, 1.0]",
        ));
    }
    Ok(())
}

/// Validate an explicit TTL.
pub fn validate_ttl_hours(ttl_hours: u32) -> Result<()> {
    if ttl_hours == 0 {
        return Err(MemoryError::invalid("ttl_hours", "must be at least 1"));
    }
    Ok(())
}
