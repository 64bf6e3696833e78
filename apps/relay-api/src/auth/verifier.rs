//! Credential verification against the cluster-shared secret.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::error::RelayError;
use crate::gateway::session::{Permission, SessionData};

/// Claims carried by a client credential.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialClaims {
    user_id: String,
    username: String,
    file_id: String,
    #[serde(default)]
    permission: i64,
    exp: i64,
}

/// Validates signed credentials. The secret is injected at construction
/// so tests can run with distinct keys; there is no process-wide key
/// state.
pub struct TokenVerifier {
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp"]);
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Validate a raw credential and decode its claims.
    ///
    /// Pure check: no caching, no partial claims on failure. Every
    /// failure mode (bad signature, malformed input, expired) collapses
    /// into `RelayError::Auth`; the specific cause is only logged.
    pub fn verify(&self, credential: &str) -> Result<SessionData, RelayError> {
        let decoded = decode::<CredentialClaims>(credential, &self.decoding, &self.validation)
            .map_err(|err| {
                tracing::debug!(?err, "credential verification failed");
                RelayError::Auth
            })?;

        let claims = decoded.claims;
        Ok(SessionData {
            user_id: claims.user_id,
            username: claims.username,
            file_id: claims.file_id,
            permission: Permission::from_level(claims.permission),
            credential: credential.to_string(),
            expires_at: claims.exp,
        })
    }
}
