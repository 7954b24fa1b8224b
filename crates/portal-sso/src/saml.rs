//! SAML 2.0 response validation
//!
//! Parses and validates a base64 POST-binding `Response` from an IdP:
//! structural checks, signature presence, time/audience conditions, subject
//! confirmation, attribute mapping, and replay tracking. Parsing uses
//! roxmltree, which never resolves external entities, so XXE is excluded by
//! construction. Lookups go by local element name so `saml:`/`saml2:`/
//! `samlp:` prefix dialects all resolve.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use regex::Regex;
use roxmltree::{Document, Node};
use uuid::Uuid;

use portal_common::{
    AttributeMapping, AuthError, AuthResult, ConditionViolation, IdentityRecord, ProviderKind,
    ReplayPolicy, SamlProviderConfig,
};

use crate::identity::{IdentityNormalizer, RawProfile};

const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";

/// Fallback lifetime for a seen assertion id when the assertion carries no
/// `NotOnOrAfter` of its own.
const DEFAULT_REPLAY_WINDOW_SECS: i64 = 300;

/// Seen-id cache is swept once it grows past this.
const REPLAY_SWEEP_THRESHOLD: usize = 1024;

/// Cryptographic signature verification seam.
///
/// The validator enforces signature *presence* itself; installing a verifier
/// upgrades that to full verification against the trusted certificate.
/// Running without one is the documented weaker mode, not the default
/// deployment shape.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, response_xml: &str, certificate_pem: &str) -> Result<(), String>;
}

/// SAML 2.0 response validator for one configured provider.
pub struct SamlValidator {
    config: SamlProviderConfig,
    verifier: Option<Arc<dyn SignatureVerifier>>,
    normalizer: IdentityNormalizer,
    seen_ids: DashMap<String, DateTime<Utc>>,
    response_marker: Regex,
}

impl SamlValidator {
    pub fn new(config: SamlProviderConfig) -> Self {
        Self {
            config,
            verifier: None,
            normalizer: IdentityNormalizer::new(),
            seen_ids: DashMap::new(),
            response_marker: Regex::new(r"<(\w+:)?Response[\s>]").expect("static marker pattern"),
        }
    }

    /// Install full signature verification.
    pub fn with_verifier(config: SamlProviderConfig, verifier: Arc<dyn SignatureVerifier>) -> Self {
        let mut validator = Self::new(config);
        validator.verifier = Some(verifier);
        validator
    }

    /// Validate a base64-encoded SAML response end to end.
    pub fn validate(&self, base64_response: &str) -> AuthResult<IdentityRecord> {
        let xml = self.decode(base64_response)?;

        // First line of defense: nothing that lacks a Response root element
        // reaches the XML parser at all.
        if !self.response_marker.is_match(&xml) {
            tracing::warn!(
                provider = %self.config.provider_id,
                "payload has no Response root element"
            );
            return Err(AuthError::MalformedResponse(
                "no Response root element".to_string(),
            ));
        }

        let doc = Document::parse(&xml).map_err(|e| {
            tracing::warn!(provider = %self.config.provider_id, error = %e, "XML parse failed");
            AuthError::MalformedResponse(format!("XML parse failed: {e}"))
        })?;

        self.check_status(&doc)?;
        self.check_signature(&doc, &xml)?;

        let assertion = find_first(doc.root_element(), "Assertion").ok_or_else(|| {
            tracing::warn!(provider = %self.config.provider_id, "response has no assertion");
            AuthError::NoAssertion
        })?;

        let now = Utc::now();
        self.check_conditions(assertion, now)?;
        let name_id = self.check_subject(assertion, now)?;

        let attributes = extract_attributes(assertion);
        let mapping = &self.config.attribute_mapping;
        let email = mapped_value(&attributes, &mapping.email)
            .ok_or_else(|| AuthError::MissingRequiredAttribute("email".to_string()))?;
        let display_name = mapped_value(&attributes, &mapping.display_name);
        let department = mapped_value(&attributes, &mapping.department);

        self.check_replay(&doc, assertion, now)?;

        self.normalizer.normalize(RawProfile {
            external_id: name_id,
            email,
            display_name,
            department,
            provider: ProviderKind::Saml,
        })
    }

    /// Front-channel login URL carrying a fresh `AuthnRequest`.
    pub fn login_url(&self, relay_state: &str) -> String {
        let request_id = format!("_portal_{}", Uuid::new_v4().simple());
        let authn_request = format!(
            r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{}" Version="2.0" IssueInstant="{}" Destination="{}" AssertionConsumerServiceURL="{}" ProtocolBinding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST"><saml:Issuer>{}</saml:Issuer><samlp:NameIDPolicy Format="urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress" AllowCreate="true"/></samlp:AuthnRequest>"#,
            request_id,
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            self.config.idp_sso_url,
            self.config.sp_acs_url,
            self.config.sp_entity_id,
        );
        format!(
            "{}?SAMLRequest={}&RelayState={}",
            self.config.idp_sso_url,
            BASE64.encode(authn_request.as_bytes()),
            relay_state
        )
    }

    fn decode(&self, base64_response: &str) -> AuthResult<String> {
        let bytes = BASE64.decode(base64_response.trim().as_bytes()).map_err(|e| {
            tracing::warn!(provider = %self.config.provider_id, error = %e, "base64 decode failed");
            AuthError::MalformedResponse("base64 decode failed".to_string())
        })?;
        String::from_utf8(bytes).map_err(|_| {
            tracing::warn!(provider = %self.config.provider_id, "response is not valid UTF-8");
            AuthError::MalformedResponse("response is not valid UTF-8".to_string())
        })
    }

    fn check_status(&self, doc: &Document<'_>) -> AuthResult<()> {
        let status = find_first(doc.root_element(), "Status").ok_or_else(|| {
            AuthError::ProtocolStatusFailure("Status element missing".to_string())
        })?;
        let code = find_first(status, "StatusCode")
            .and_then(|n| n.attribute("Value"))
            .unwrap_or("");
        if code != STATUS_SUCCESS {
            // The provider message is kept for diagnostics; callers must not
            // echo it to end users.
            let message = find_first(status, "StatusMessage")
                .and_then(|n| n.text())
                .unwrap_or("")
                .trim();
            tracing::warn!(
                provider = %self.config.provider_id,
                status = code,
                message,
                "IdP reported non-success status"
            );
            return Err(AuthError::ProtocolStatusFailure(format!(
                "{code} {message}"
            )));
        }
        Ok(())
    }

    fn check_signature(&self, doc: &Document<'_>, xml: &str) -> AuthResult<()> {
        let present = doc
            .descendants()
            .any(|n| n.is_element() && n.tag_name().name() == "Signature");
        if !present {
            if self.config.require_signature {
                tracing::warn!(provider = %self.config.provider_id, "response carries no signature");
                return Err(AuthError::SignatureMissing);
            }
            return Ok(());
        }
        match &self.verifier {
            Some(verifier) => verifier
                .verify(xml, &self.config.idp_certificate)
                .map_err(|e| {
                    tracing::warn!(provider = %self.config.provider_id, error = %e, "signature verification failed");
                    AuthError::SignatureInvalid(e)
                }),
            None => {
                tracing::debug!(
                    provider = %self.config.provider_id,
                    "signature present but unverified; no verifier installed"
                );
                Ok(())
            }
        }
    }

    fn check_conditions(&self, assertion: Node<'_, '_>, now: DateTime<Utc>) -> AuthResult<()> {
        let Some(conditions) = find_first(assertion, "Conditions") else {
            return Ok(());
        };
        let skew = Duration::seconds(self.config.clock_skew_secs);

        if let Some(raw) = conditions.attribute("NotBefore") {
            let not_before = parse_instant(raw)?;
            if now + skew < not_before {
                tracing::warn!(provider = %self.config.provider_id, "assertion not yet valid");
                return Err(AuthError::ConditionsInvalid(ConditionViolation::NotYetValid));
            }
        }
        if let Some(raw) = conditions.attribute("NotOnOrAfter") {
            let not_on_or_after = parse_instant(raw)?;
            if now - skew >= not_on_or_after {
                tracing::warn!(provider = %self.config.provider_id, "assertion expired");
                return Err(AuthError::ConditionsInvalid(ConditionViolation::Expired));
            }
        }

        let audiences: Vec<&str> = conditions
            .descendants()
            .filter(|n| n.is_element() && n.tag_name().name() == "Audience")
            .filter_map(|n| n.text())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();
        if !audiences.is_empty() && !audiences.iter().any(|a| *a == self.config.sp_entity_id) {
            tracing::warn!(
                provider = %self.config.provider_id,
                expected = %self.config.sp_entity_id,
                "audience restriction does not name us"
            );
            return Err(AuthError::ConditionsInvalid(
                ConditionViolation::AudienceMismatch,
            ));
        }
        Ok(())
    }

    /// Returns the NameID; rejects missing subjects and stale or misdirected
    /// subject confirmations.
    fn check_subject(&self, assertion: Node<'_, '_>, now: DateTime<Utc>) -> AuthResult<String> {
        let subject = find_first(assertion, "Subject").ok_or(AuthError::MissingSubject)?;
        let name_id = find_first(subject, "NameID")
            .and_then(|n| n.text())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingSubject)?
            .to_string();

        if let Some(confirmation) = find_first(subject, "SubjectConfirmationData") {
            if let Some(recipient) = confirmation.attribute("Recipient") {
                if !self.config.sp_acs_url.is_empty() && recipient != self.config.sp_acs_url {
                    tracing::warn!(
                        provider = %self.config.provider_id,
                        recipient,
                        "subject confirmation addressed to a different ACS"
                    );
                    return Err(AuthError::RecipientMismatch);
                }
            }
            if let Some(raw) = confirmation.attribute("NotOnOrAfter") {
                let not_on_or_after = parse_instant(raw)?;
                if now - Duration::seconds(self.config.clock_skew_secs) >= not_on_or_after {
                    return Err(AuthError::ConditionsInvalid(ConditionViolation::Expired));
                }
            }
        }
        Ok(name_id)
    }

    /// Track response and assertion identifiers against reuse inside their
    /// validity window.
    fn check_replay(
        &self,
        doc: &Document<'_>,
        assertion: Node<'_, '_>,
        now: DateTime<Utc>,
    ) -> AuthResult<()> {
        if self.seen_ids.len() > REPLAY_SWEEP_THRESHOLD {
            self.seen_ids.retain(|_, expiry| now < *expiry);
        }

        let window_end = find_first(assertion, "Conditions")
            .and_then(|c| c.attribute("NotOnOrAfter"))
            .and_then(|raw| parse_instant(raw).ok())
            .unwrap_or_else(|| now + Duration::seconds(DEFAULT_REPLAY_WINDOW_SECS));

        let response_id = doc.root_element().attribute("ID");
        let assertion_id = assertion.attribute("ID");

        for id in [response_id, assertion_id].into_iter().flatten() {
            let replayed = self
                .seen_ids
                .get(id)
                .map(|expiry| now < *expiry)
                .unwrap_or(false);
            if replayed {
                match self.config.replay_policy {
                    ReplayPolicy::Reject => {
                        tracing::warn!(
                            provider = %self.config.provider_id,
                            id,
                            "assertion identifier replayed, rejecting"
                        );
                        return Err(AuthError::ReplayDetected(id.to_string()));
                    }
                    ReplayPolicy::Warn => {
                        tracing::warn!(
                            provider = %self.config.provider_id,
                            id,
                            "assertion identifier replayed, policy allows it through"
                        );
                    }
                }
            }
            self.seen_ids.insert(id.to_string(), window_end);
        }
        Ok(())
    }
}

fn parse_instant(raw: &str) -> AuthResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| AuthError::MalformedResponse(format!("bad timestamp: {raw}")))
}

fn find_first<'a, 'input>(node: Node<'a, 'input>, local: &str) -> Option<Node<'a, 'input>> {
    node.descendants()
        .find(|n| n.is_element() && n.tag_name().name() == local)
}

/// Attribute statements flattened to name -> first value, by local name.
fn extract_attributes(assertion: Node<'_, '_>) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for attr in assertion
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "Attribute")
    {
        let Some(name) = attr.attribute("Name").or_else(|| attr.attribute("FriendlyName")) else {
            continue;
        };
        let value = attr
            .children()
            .filter(|n| n.is_element() && n.tag_name().name() == "AttributeValue")
            .filter_map(|n| n.text())
            .map(str::trim)
            .find(|t| !t.is_empty());
        if let Some(value) = value {
            out.push((name.to_string(), value.to_string()));
        }
    }
    out
}

fn mapped_value(attributes: &[(String, String)], accepted: &[String]) -> Option<String> {
    attributes
        .iter()
        .find(|(name, _)| AttributeMapping::matches(accepted, name))
        .map(|(_, value)| value.clone())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::SecondsFormat;

    pub struct ResponseFixture {
        pub response_id: String,
        pub assertion_id: String,
        pub status: &'static str,
        pub signed: bool,
        pub not_before: DateTime<Utc>,
        pub not_on_or_after: DateTime<Utc>,
        pub audience: String,
        pub recipient: String,
        pub name_id: Option<String>,
        pub email_attr: Option<(&'static str, String)>,
        pub include_assertion: bool,
    }

    impl Default for ResponseFixture {
        fn default() -> Self {
            let now = Utc::now();
            Self {
                response_id: format!("_resp_{}", Uuid::new_v4().simple()),
                assertion_id: format!("_asrt_{}", Uuid::new_v4().simple()),
                status: STATUS_SUCCESS,
                signed: true,
                not_before: now - Duration::minutes(5),
                not_on_or_after: now + Duration::minutes(5),
                audience: "https://portal.example.com".to_string(),
                recipient: "https://portal.example.com/auth/saml/callback".to_string(),
                name_id: Some("user-1@corp.example.com".to_string()),
                email_attr: Some((
                    "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/emailaddress",
                    "User-1@Corp.Example.COM".to_string(),
                )),
                include_assertion: true,
            }
        }
    }

    pub fn config() -> SamlProviderConfig {
        SamlProviderConfig {
            provider_id: "saml".to_string(),
            idp_entity_id: "https://idp.example.com".to_string(),
            idp_sso_url: "https://idp.example.com/sso".to_string(),
            idp_certificate: "-----BEGIN CERTIFICATE-----".to_string(),
            sp_entity_id: "https://portal.example.com".to_string(),
            sp_acs_url: "https://portal.example.com/auth/saml/callback".to_string(),
            clock_skew_secs: 60,
            require_signature: true,
            replay_policy: ReplayPolicy::Reject,
            attribute_mapping: AttributeMapping::default(),
        }
    }

    pub fn render(fixture: &ResponseFixture) -> String {
        let ts = |t: DateTime<Utc>| t.to_rfc3339_opts(SecondsFormat::Secs, true);
        let signature = if fixture.signed {
            r#"<ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:SignatureValue>c2ln</ds:SignatureValue></ds:Signature>"#
        } else {
            ""
        };
        let name_id = fixture
            .name_id
            .as_ref()
            .map(|v| format!("<saml:NameID>{v}</saml:NameID>"))
            .unwrap_or_default();
        let email = fixture
            .email_attr
            .as_ref()
            .map(|(name, value)| {
                format!(
                    r#"<saml:Attribute Name="{name}"><saml:AttributeValue>{value}</saml:AttributeValue></saml:Attribute>"#
                )
            })
            .unwrap_or_default();
        let assertion = if fixture.include_assertion {
            format!(
                r#"<saml:Assertion ID="{assertion_id}" IssueInstant="{issue}">
  <saml:Issuer>https://idp.example.com</saml:Issuer>
  <saml:Subject>
    {name_id}
    <saml:SubjectConfirmation Method="urn:oasis:names:tc:SAML:2.0:cm:bearer">
      <saml:SubjectConfirmationData Recipient="{recipient}" NotOnOrAfter="{noa}"/>
    </saml:SubjectConfirmation>
  </saml:Subject>
  <saml:Conditions NotBefore="{nb}" NotOnOrAfter="{noa}">
    <saml:AudienceRestriction><saml:Audience>{audience}</saml:Audience></saml:AudienceRestriction>
  </saml:Conditions>
  <saml:AttributeStatement>
    {email}
    <saml:Attribute Name="department"><saml:AttributeValue>Data Governance</saml:AttributeValue></saml:Attribute>
    <saml:Attribute Name="displayName"><saml:AttributeValue>Pat Example</saml:AttributeValue></saml:Attribute>
  </saml:AttributeStatement>
</saml:Assertion>"#,
                assertion_id = fixture.assertion_id,
                issue = ts(Utc::now()),
                name_id = name_id,
                recipient = fixture.recipient,
                nb = ts(fixture.not_before),
                noa = ts(fixture.not_on_or_after),
                audience = fixture.audience,
                email = email,
            )
        } else {
            String::new()
        };

        format!(
            r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{response_id}" Version="2.0" IssueInstant="{issue}">
  <saml:Issuer>https://idp.example.com</saml:Issuer>
  {signature}
  <samlp:Status><samlp:StatusCode Value="{status}"/><samlp:StatusMessage>status detail</samlp:StatusMessage></samlp:Status>
  {assertion}
</samlp:Response>"#,
            response_id = fixture.response_id,
            issue = ts(Utc::now()),
            signature = signature,
            status = fixture.status,
            assertion = assertion,
        )
    }

    pub fn encode(fixture: &ResponseFixture) -> String {
        BASE64.encode(render(fixture).as_bytes())
    }
}
