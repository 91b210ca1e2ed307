//! Input validation for share requests
//!
//! Provides validation functions for identifiers, item names and free-text
//! purposes before they reach the database or an external API.

use crate::{Result, ShareError};

/// Maximum length for URIs and other identifiers
pub const MAX_IDENTIFIER_LEN: usize = 255;

/// Maximum length for item display names (folder prefixes can be long)
pub const MAX_ITEM_NAME_LEN: usize = 1024;

/// Maximum length for request and reject purposes
pub const MAX_PURPOSE_LEN: usize = 2000;

/// Validate a URI or identifier
///
/// Requirements:
/// - Not empty
/// - <= 255 characters
/// - Alphanumeric, underscore, hyphen, dot, colon, slash only
pub fn validate_identifier(param: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(ShareError::invalid_input(param, value, "must not be empty"));
    }

    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(ShareError::invalid_input(
            param,
            truncate_for_message(value),
            format!("must be at most {} characters", MAX_IDENTIFIER_LEN),
        ));
    }

    if !value
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | '/'))
    {
        return Err(ShareError::invalid_input(
            param,
            value,
            "contains invalid characters (allowed: alphanumeric, _, -, ., :, /)",
        ));
    }

    Ok(())
}

/// Validate an item display name
///
/// Requirements:
/// - Not empty or whitespace only
/// - <= 1024 characters
/// - No control characters
/// - No `..` path segments
pub fn validate_item_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(ShareError::invalid_input("itemName", name, "must not be empty"));
    }

    if name.len() > MAX_ITEM_NAME_LEN {
        return Err(ShareError::invalid_input(
            "itemName",
            truncate_for_message(name),
            format!("must be at most {} characters", MAX_ITEM_NAME_LEN),
        ));
    }

    if name.chars().any(char::is_control) {
        return Err(ShareError::invalid_input(
            "itemName",
            name.escape_debug().to_string(),
            "must not contain control characters",
        ));
    }

    if name.split('/').any(|segment| segment == "..") {
        return Err(ShareError::invalid_input(
            "itemName",
            name,
            "must not contain '..' path segments",
        ));
    }

    Ok(())
}

/// Validate a request or reject purpose
pub fn validate_purpose(param: &str, purpose: &str) -> Result<()> {
    if purpose.len() > MAX_PURPOSE_LEN {
        return Err(ShareError::invalid_input(
            param,
            truncate_for_message(purpose),
            format!("must be at most {} characters", MAX_PURPOSE_LEN),
        ));
    }
    Ok(())
}

/// Validate a list of item uris passed to a batch operation
pub fn validate_item_uris(item_uris: &[String]) -> Result<()> {
    if item_uris.is_empty() {
        return Err(ShareError::invalid_input(
            "itemUris",
            "[]",
            "at least one item is required",
        ));
    }
    let mut seen = std::collections::HashSet::with_capacity(item_uris.len());
    for uri in item_uris {
        validate_identifier("itemUris", uri)?;
        if !seen.insert(uri.as_str()) {
            return Err(ShareError::invalid_input(
                "itemUris",
                uri.as_str(),
                "must not be listed more than once",
            ));
        }
    }
    Ok(())
}

fn truncate_for_message(value: &str) -> String {
    value.chars().take(32).collect::<String>() + "..."
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        assert!(validate_identifier("shareUri", "share-1234").is_ok());
        assert!(validate_identifier("datasetUri", "ds:sales/v2").is_ok());
        assert!(validate_identifier("groupUri", "data_team.eu").is_ok());
    }

    #[test]
    fn test_invalid_identifiers() {
        assert!(validate_identifier("shareUri", "").is_err());
        assert!(validate_identifier("shareUri", "a b").is_err());
        assert!(validate_identifier("shareUri", "x'; DROP TABLE share_object;--").is_err());

        let long = "a".repeat(MAX_IDENTIFIER_LEN + 1);
        let err = validate_identifier("shareUri", &long).unwrap_err();
        match err {
            ShareError::InvalidInput { param, .. } => assert_eq!(param, "shareUri"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_item_names() {
        assert!(validate_item_name("orders_table").is_ok());
        assert!(validate_item_name("raw/2024/orders").is_ok());
        assert!(validate_item_name("   ").is_err());
        assert!(validate_item_name("raw/../secrets").is_err());
        assert!(validate_item_name("bad\nname").is_err());
    }

    #[test]
    fn test_purpose_length() {
        assert!(validate_purpose("requestPurpose", "quarterly reporting").is_ok());
        assert!(validate_purpose("requestPurpose", &"x".repeat(MAX_PURPOSE_LEN + 1)).is_err());
    }

    #[test]
    fn test_item_uris_must_not_be_empty() {
        assert!(validate_item_uris(&[]).is_err());
        assert!(validate_item_uris(&["item-1".to_string()]).is_ok());
    }

    #[test]
    fn test_item_uris_must_be_unique() {
        let uris = vec!["item-1".to_string(), "item-2".to_string(), "item-1".to_string()];
        match validate_item_uris(&uris).unwrap_err() {
            ShareError::InvalidInput { param, value, .. } => {
                assert_eq!(param, "itemUris");
                assert_eq!(value, "item-1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
