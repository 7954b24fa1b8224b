//! Identity normalization
//!
//! Converts provider-specific profile shapes into the canonical
//! `IdentityRecord`. Optional fields may be missing; the external id and
//! email never are.

use portal_common::{AttributeMapping, AuthError, AuthResult, IdentityRecord, ProviderKind};
use serde_json::Value;

use crate::sanitize::IdentitySanitizer;

/// Provider-specific fields, already mapped but not yet sanitized.
#[derive(Debug, Clone)]
pub struct RawProfile {
    pub external_id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub department: Option<String>,
    pub provider: ProviderKind,
}

/// Normalizer from raw provider profiles to canonical identity records.
pub struct IdentityNormalizer {
    sanitizer: IdentitySanitizer,
}

impl IdentityNormalizer {
    pub fn new() -> Self {
        Self {
            sanitizer: IdentitySanitizer::new(),
        }
    }

    /// Sanitize a raw profile and enforce the record invariants.
    pub fn normalize(&self, raw: RawProfile) -> AuthResult<IdentityRecord> {
        let external_id = self.sanitizer.clean(&raw.external_id);
        if external_id.is_empty() {
            return Err(AuthError::MissingRequiredAttribute("external_id".to_string()));
        }
        let email = self.sanitizer.email(&raw.email)?;

        Ok(IdentityRecord {
            external_id,
            email,
            display_name: self.sanitizer.clean_optional(raw.display_name.as_deref()),
            department: self.sanitizer.clean_optional(raw.department.as_deref()),
            provider: raw.provider,
        })
    }

    /// Map an OAuth userinfo document onto the canonical record.
    ///
    /// Key lookup is case-insensitive against the configured dialect lists;
    /// numeric subject identifiers are accepted and stringified.
    pub fn from_oauth_profile(
        &self,
        profile: &Value,
        mapping: &AttributeMapping,
    ) -> AuthResult<IdentityRecord> {
        let obj = profile
            .as_object()
            .ok_or_else(|| AuthError::ProfileFetchFailed("profile is not an object".to_string()))?;

        let external_id = lookup(obj, &mapping.external_id)
            .ok_or_else(|| AuthError::MissingRequiredAttribute("external_id".to_string()))?;
        let email = lookup(obj, &mapping.email)
            .ok_or_else(|| AuthError::MissingRequiredAttribute("email".to_string()))?;

        self.normalize(RawProfile {
            external_id,
            email,
            display_name: lookup(obj, &mapping.display_name),
            department: lookup(obj, &mapping.department),
            provider: ProviderKind::Oauth,
        })
    }
}

impl Default for IdentityNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup(obj: &serde_json::Map<String, Value>, accepted: &[String]) -> Option<String> {
    for (key, value) in obj {
        if !AttributeMapping::matches(accepted, key) {
            continue;
        }
        match value {
            Value::String(s) if !s.is_empty() => return Some(s.clone()),
            Value::Number(n) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_sanitizes_and_lower_cases() {
        let n = IdentityNormalizer::new();
        let record = n
            .normalize(RawProfile {
                external_id: "user-123".to_string(),
                email: "Alice@Example.COM".to_string(),
                display_name: Some("Alice <Admin> Li".to_string()),
                department: None,
                provider: ProviderKind::Saml,
            })
            .unwrap();
        assert_eq!(record.email, "alice@example.com");
        assert_eq!(record.display_name, "Alice Admin Li");
        assert_eq!(record.department, "");
    }

    #[test]
    fn test_normalize_requires_external_id_and_email() {
        let n = IdentityNormalizer::new();
        let missing_id = n.normalize(RawProfile {
            external_id: "  ".to_string(),
            email: "a@example.com".to_string(),
            display_name: None,
            department: None,
            provider: ProviderKind::Oauth,
        });
        assert!(matches!(
            missing_id,
            Err(AuthError::MissingRequiredAttribute(f)) if f == "external_id"
        ));
    }

    #[test]
    fn test_oauth_profile_mapping() {
        let n = IdentityNormalizer::new();
        let profile = json!({
            "Sub": 42,
            "EMAIL": "Bob@Corp.Example",
            "name": "Bob",
            "department": "Data Platform"
        });
        let record = n
            .from_oauth_profile(&profile, &AttributeMapping::default())
            .unwrap();
        assert_eq!(record.external_id, "42");
        assert_eq!(record.email, "bob@corp.example");
        assert_eq!(record.department, "Data Platform");
        assert_eq!(record.provider, ProviderKind::Oauth);
    }

    #[test]
    fn test_oauth_profile_missing_email() {
        let n = IdentityNormalizer::new();
        let profile = json!({"sub": "u1", "name": "No Mail"});
        assert!(matches!(
            n.from_oauth_profile(&profile, &AttributeMapping::default()),
            Err(AuthError::MissingRequiredAttribute(f)) if f == "email"
        ));
    }

    #[test]
    fn test_oauth_profile_not_an_object() {
        let n = IdentityNormalizer::new();
        assert!(matches!(
            n.from_oauth_profile(&json!(["a"]), &AttributeMapping::default()),
            Err(AuthError::ProfileFetchFailed(_))
        ));
    }
}
