//! Device-session token minting.
//!
//! Per-device-session clouds authenticate each MQTT connection with a
//! short-lived token signed by the device's own RSA key and bound to the
//! tenant project.

use chrono::Utc;
use jsonwebtoken::{encode, errors::Error as JwtError, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

/// Claims carried by a device-scoped cloud session token.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceClaims {
    pub iat: i64,
    pub exp: i64,
    pub aud: String,
}

impl DeviceClaims {
    /// Claims valid from now until `now + expiration_secs`, audience-bound
    /// to the tenant project.
    pub fn new(project_id: &str, expiration_secs: u64) -> Self {
        let now = Utc::now().timestamp();
        Self {
            iat: now,
            exp: now + expiration_secs as i64,
            aud: project_id.to_string(),
        }
    }
}

/// Mint an RS256 token from a PEM-encoded RSA private key.
#[inline]
pub fn encode_rs256_jwt<T: Serialize>(claims: &T, rsa_pem: &[u8]) -> Result<String, JwtError> {
    let header = Header::new(Algorithm::RS256);
    encode(&header, claims, &EncodingKey::from_rsa_pem(rsa_pem)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_claims_window() {
        let claims = DeviceClaims::new("test-project", 3600);
        assert_eq!(claims.aud, "test-project");
        assert_eq!(claims.exp - claims.iat, 3600);
        assert!(claims.iat > 0);
    }

    #[test]
    fn claims_serialize_with_the_expected_keys() {
        let claims = DeviceClaims::new("p", 600);
        let value = serde_json::to_value(&claims).unwrap();
        assert!(value.get("iat").is_some());
        assert!(value.get("exp").is_some());
        assert_eq!(value["aud"], "p");
    }

    #[test]
    fn garbage_key_is_rejected() {
        let err = encode_rs256_jwt(&DeviceClaims::new("p", 600), b"not a pem").unwrap_err();
        // jsonwebtoken surfaces this as an InvalidRsaKey-class error
        assert!(!err.to_string().is_empty());
    }
}
