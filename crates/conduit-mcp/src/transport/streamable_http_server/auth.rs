use http::request::Parts;
use serde::{Deserialize, Serialize};

/// The identity claim captured when a session is created.
///
/// Every later request on the session must present the same claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdClaim {
    pub claim_type: String,
    pub value: String,
    pub issuer: String,
}

/// Reads the authenticated principal from an incoming request.
///
/// Returning `None` marks the request anonymous.
pub trait CredentialExtractor: Send + Sync + 'static {
    fn extract(&self, parts: &Parts) -> Option<UserIdClaim>;
}

/// Treats every request as anonymous.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousCredentialExtractor;

impl CredentialExtractor for AnonymousCredentialExtractor {
    fn extract(&self, _parts: &Parts) -> Option<UserIdClaim> {
        None
    }
}
