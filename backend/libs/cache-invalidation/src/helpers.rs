//! Helper functions for cache key management

use crate::{EntityType, InvalidationError, Result};

/// Build cache key from entity type and ID
///
/// # Example
///
/// ```
/// use cache_invalidation::{build_cache_key, EntityType};
///
/// let key = build_cache_key(&EntityType::User, "123");
/// assert_eq!(key, "user:123");
/// ```
pub fn build_cache_key(entity_type: &EntityType, entity_id: &str) -> String {
    format!("{}:{}", entity_type, entity_id)
}

/// Parse cache key into entity type and ID
///
/// Both parts must be non-empty; the ID may itself contain colons.
///
/// # Example
///
/// ```
/// use cache_invalidation::{parse_cache_key, EntityType};
///
/// let (entity_type, entity_id) = parse_cache_key("user:123").unwrap();
/// assert_eq!(entity_type, EntityType::User);
/// assert_eq!(entity_id, "123");
/// ```
pub fn parse_cache_key(key: &str) -> Result<(EntityType, String)> {
    match key.split_once(':') {
        Some((entity_type, entity_id)) if !entity_type.is_empty() && !entity_id.is_empty() => {
            Ok((EntityType::from(entity_type), entity_id.to_string()))
        }
        _ => Err(InvalidationError::InvalidKey(format!(
            "{}. Expected format: <type>:<id>",
            key
        ))),
    }
}
