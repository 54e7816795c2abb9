//! Verification of user bearer tokens from the identity provider.
//!
//! The provider signs asymmetric JWTs; the gateway holds only the RSA public
//! key (`CLERK_JWT_KEY`) and never talks to the provider directly. The
//! token's `sub` claim becomes the session subject; the `azp` claim, when
//! present, must name one of the configured authorized parties.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::error::{GatewayError, GatewayResult};
use crate::state::AuthConfig;

/// Claims the gateway cares about; everything else in the token is ignored.
#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    azp: Option<String>,
}

/// Verifies a user bearer token and returns its subject.
///
/// Error messages are the exact strings the ticket endpoint's clients match
/// on, so they must not be reworded.
pub fn verify_user_token(token: &str, config: &AuthConfig) -> GatewayResult<String> {
    let Some(pem) = config.jwt_public_key.as_deref() else {
        return Err(GatewayError::Configuration(
            "CLERK_JWT_KEY is not configured".into(),
        ));
    };

    let key = DecodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| {
        log::error!("[Auth] Failed to parse verification key: {}", e);
        GatewayError::Unauthorized("Token verification failed".into())
    })?;

    let mut validation = Validation::new(Algorithm::RS256);
    // The provider does not set `aud`; parties are checked via `azp` below.
    validation.validate_aud = false;

    let data = decode::<Claims>(token, &key, &validation)
        .map_err(|_| GatewayError::Unauthorized("Invalid token".into()))?;

    if !azp_allowed(data.claims.azp.as_deref(), &config.authorized_parties) {
        return Err(GatewayError::Unauthorized("Invalid token".into()));
    }

    Ok(data.claims.sub)
}

/// Checks a token's authorized-party claim against the configured list.
///
/// A missing claim passes (single-party deployments omit it); an empty
/// configured list accepts any party.
fn azp_allowed(azp: Option<&str>, parties: &[String]) -> bool {
    match azp {
        None => true,
        Some(_) if parties.is_empty() => true,
        Some(azp) => parties.iter().any(|p| p == azp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_key() -> AuthConfig {
        // Structurally valid RSA public key; no token in these tests is
        // signed by its private half, so decode failures are expected.
        AuthConfig {
            jwt_public_key: Some(TEST_RSA_PUBLIC_PEM.to_string()),
            authorized_parties: vec![],
        }
    }

    const TEST_RSA_PUBLIC_PEM: &str = "-----BEGIN PUBLIC KEY-----
MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEAsXs24Dtq9wG3qV3dbK9o
8ButUDHJKk0wG+viRqdlQnBYXzAwW04t1W6k//CBX4QP2lwucR4akXOCPNF4lrn+
tb0OrXOpL39Y8od8KvqM7OwBMGcqR2Z/aQpL4UN6uiabDHEV3pyO3JPN4PCvUaZ1
QHZpwUQrISzCqjBqwC3RWV5Oa7ZmI8ZZvp9lmZQDbNVS6I4N+dcY6+ZrE7xy37DM
F66ND0ypOzvhZi9IM33OT7zDKuq+A0h/hsgqJDUOx3NSj5r/jzr2eqUc3ubCo34R
J9lKS/bkTBm+iopiqxVo5K6jHIxotD++mwDDHDPHqjjEnqTxFA4Ywk3TZ6D98jan
RwIDAQAB
-----END PUBLIC KEY-----";

    #[test]
    fn missing_key_is_a_configuration_error() {
        let config = AuthConfig::default();
        let err = verify_user_token("whatever", &config).unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));
    }

    #[test]
    fn garbage_token_is_invalid() {
        let config = config_with_key();
        let err = verify_user_token("not.a.jwt", &config).unwrap_err();
        assert_eq!(err.to_string(), "Invalid token");
    }

    #[test]
    fn unparseable_key_reports_verification_failure() {
        let config = AuthConfig {
            jwt_public_key: Some("-----BEGIN PUBLIC KEY-----\nnope\n-----END PUBLIC KEY-----".into()),
            authorized_parties: vec![],
        };
        let err = verify_user_token("not.a.jwt", &config).unwrap_err();
        assert_eq!(err.to_string(), "Token verification failed");
    }

    #[test]
    fn azp_rules() {
        let parties = vec!["https://app.example.com".to_string()];
        assert!(azp_allowed(None, &parties));
        assert!(azp_allowed(Some("https://app.example.com"), &parties));
        assert!(!azp_allowed(Some("https://evil.example.com"), &parties));
        assert!(azp_allowed(Some("https://anything.example.com"), &[]));
    }
}
