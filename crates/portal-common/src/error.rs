//! Error types for the authentication gateway

use thiserror::Error;

/// Gateway error type
///
/// Tagged failure union shared by the SAML validator, the OAuth flow client,
/// the session issuer and the local-password fallback. A validation never
/// returns a half-populated identity: it is either `Ok(IdentityRecord)` or
/// exactly one of these.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Provider is not configured
    #[error("provider not configured: {0}")]
    ConfigurationMissing(String),

    /// Payload could not be decoded or parsed as a SAML response
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Response status was not success
    #[error("provider reported non-success status: {0}")]
    ProtocolStatusFailure(String),

    /// Response carries no signature element
    #[error("response signature missing")]
    SignatureMissing,

    /// Signature verification failed
    #[error("response signature invalid: {0}")]
    SignatureInvalid(String),

    /// Response contains no assertion
    #[error("response contains no assertion")]
    NoAssertion,

    /// Assertion time/audience conditions failed
    #[error("assertion conditions invalid: {0}")]
    ConditionsInvalid(ConditionViolation),

    /// SubjectConfirmationData recipient does not match the ACS URL
    #[error("subject confirmation recipient mismatch")]
    RecipientMismatch,

    /// Assertion subject has no NameID
    #[error("assertion subject missing NameID")]
    MissingSubject,

    /// A required attribute is absent after mapping
    #[error("required attribute missing: {0}")]
    MissingRequiredAttribute(String),

    /// Assertion or response identifier was already consumed
    #[error("replayed assertion: {0}")]
    ReplayDetected(String),

    /// Token endpoint rejected the code exchange
    #[error("token exchange failed: {0}")]
    TokenExchangeFailed(String),

    /// Userinfo endpoint could not be read
    #[error("profile fetch failed: {0}")]
    ProfileFetchFailed(String),

    /// OAuth state parameter failed signature or shape checks
    #[error("state parameter invalid")]
    StateParamInvalid,

    /// OAuth state parameter is older than the allowed window
    #[error("state parameter expired")]
    StateParamExpired,

    /// Local-password fallback is not enabled
    #[error("local authentication is disabled")]
    LocalAuthDisabled,

    /// No local credential exists for this account
    #[error("account not found or has no local credential")]
    UserNotFoundOrSsoOnly,

    /// Local credential did not verify
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Operator has placed authentication in maintenance mode
    #[error("authentication is under maintenance, try again later")]
    MaintenanceMode,

    /// Provider is degraded; caller should offer local-password auth
    #[error("identity provider degraded, use local credentials")]
    ProviderDegraded,

    /// Provider is degraded and no fallback applies; retry shortly
    #[error("identity provider unavailable, retry shortly")]
    ProviderUnavailable,

    /// Sanitized field failed its shape re-validation
    #[error("invalid identity field: {0}")]
    InvalidIdentityField(String),

    /// User store failure
    #[error("user store error: {0}")]
    UserStore(String),

    /// Session store failure
    #[error("session store error: {0}")]
    SessionStore(String),

    /// Session token could not be signed
    #[error("token signing failed: {0}")]
    TokenSigning(String),
}

impl AuthError {
    /// Transport-class failures feed the availability monitor instead of
    /// being retried inline.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AuthError::TokenExchangeFailed(_) | AuthError::ProfileFetchFailed(_)
        )
    }
}

/// Which condition check rejected the assertion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionViolation {
    /// `NotBefore` is still in the future beyond clock skew
    NotYetValid,
    /// `NotOnOrAfter` has passed beyond clock skew
    Expired,
    /// Audience restriction does not include the SP entity id
    AudienceMismatch,
}

impl std::fmt::Display for ConditionViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotYetValid => write!(f, "not yet valid"),
            Self::Expired => write!(f, "expired"),
            Self::AudienceMismatch => write!(f, "audience mismatch"),
        }
    }
}

/// Result type for the authentication gateway
pub type AuthResult<T> = Result<T, AuthError>;
