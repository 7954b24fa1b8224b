//! Identity field sanitization
//!
//! Everything extracted from a provider payload passes through here before
//! it can become part of an `IdentityRecord`.

use portal_common::{AuthError, AuthResult};
use regex::Regex;

/// Maximum stored length for any identity field.
const MAX_FIELD_LEN: usize = 255;

/// Sanitizer for strings lifted out of untrusted provider payloads.
pub struct IdentitySanitizer {
    email_re: Regex,
}

impl IdentitySanitizer {
    pub fn new() -> Self {
        Self {
            email_re: Regex::new(r"^[a-z0-9._%+\-]+@[a-z0-9.\-]+\.[a-z]{2,}$")
                .expect("static email pattern"),
        }
    }

    /// Strip control characters and HTML-significant characters, trim, and
    /// cap at 255 characters.
    pub fn clean(&self, raw: &str) -> String {
        let stripped: String = raw
            .chars()
            .filter(|c| !c.is_control() && !matches!(c, '<' | '>' | '&' | '"' | '\''))
            .collect();
        stripped.trim().chars().take(MAX_FIELD_LEN).collect()
    }

    /// Clean an optional field down to a plain string, empty when absent.
    pub fn clean_optional(&self, raw: Option<&str>) -> String {
        raw.map(|v| self.clean(v)).unwrap_or_default()
    }

    /// Clean, lower-case, and re-validate an email address.
    ///
    /// The shape check runs after sanitization so stripping cannot turn an
    /// invalid address into an accepted one unnoticed.
    pub fn email(&self, raw: &str) -> AuthResult<String> {
        let cleaned = self.clean(raw).to_lowercase();
        if cleaned.is_empty() {
            return Err(AuthError::MissingRequiredAttribute("email".to_string()));
        }
        if !self.email_re.is_match(&cleaned) {
            tracing::debug!("email rejected by shape validation");
            return Err(AuthError::InvalidIdentityField("email".to_string()));
        }
        Ok(cleaned)
    }
}

impl Default for IdentitySanitizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_control_and_html_characters() {
        let s = IdentitySanitizer::new();
        assert_eq!(s.clean("Ada\u{0}\u{7} <script>Lovelace</script>"), "Ada scriptLovelace/script");
        assert_eq!(s.clean("  O\"Brien & Co  "), "OBrien  Co");
    }

    #[test]
    fn test_caps_length_at_255() {
        let s = IdentitySanitizer::new();
        let long = "x".repeat(600);
        assert_eq!(s.clean(&long).len(), 255);
    }

    #[test]
    fn test_email_lower_cased_and_validated() {
        let s = IdentitySanitizer::new();
        assert_eq!(s.email("Alice@Example.COM").unwrap(), "alice@example.com");
    }

    #[test]
    fn test_email_rejects_bad_shapes() {
        let s = IdentitySanitizer::new();
        assert!(matches!(
            s.email("not-an-email"),
            Err(AuthError::InvalidIdentityField(_))
        ));
        assert!(matches!(
            s.email("a@b"),
            Err(AuthError::InvalidIdentityField(_))
        ));
        assert!(matches!(
            s.email(""),
            Err(AuthError::MissingRequiredAttribute(_))
        ));
    }

    #[test]
    fn test_email_rejects_injection_after_stripping() {
        let s = IdentitySanitizer::new();
        // Stripping the angle brackets leaves a shape that must still fail.
        assert!(s.email("<alice@example.com>extra words").is_err());
    }
}
