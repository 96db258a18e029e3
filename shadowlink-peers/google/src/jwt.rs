//! Device-scoped JWT minting for Google Cloud IoT MQTT authentication.
//!
//! Each device authenticates with an RS256 token signed by its own private
//! key, audience-bound to the project. Keys live under the keystore
//! directory as `<ep_name>.pem`.

use shadowlink_error::{BridgeError, BridgeResult};
use shadowlink_utils::jwt::{encode_rs256_jwt, DeviceClaims};
use std::path::Path;

pub fn device_key_path(keystore_dir: &str, ep_name: &str) -> std::path::PathBuf {
    Path::new(keystore_dir).join(format!("{ep_name}.pem"))
}

/// Mint a fresh token for the endpoint: claims `{iat: now,
/// exp: now + expiration_secs, aud: project_id}`, RS256.
pub fn create_device_jwt(
    keystore_dir: &str,
    ep_name: &str,
    project_id: &str,
    expiration_secs: u64,
) -> BridgeResult<String> {
    let path = device_key_path(keystore_dir, ep_name);
    let pem = std::fs::read(&path).map_err(|e| BridgeError::CredentialError {
        reason: format!("cannot read device key {}: {}", path.display(), e),
    })?;

    let claims = DeviceClaims::new(project_id, expiration_secs);
    encode_rs256_jwt(&claims, &pem).map_err(|e| BridgeError::CredentialError {
        reason: format!("JWT signing failed for {ep_name}: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_path_layout() {
        assert_eq!(
            device_key_path("keystore", "d1"),
            std::path::PathBuf::from("keystore/d1.pem")
        );
    }

    #[test]
    fn missing_key_is_a_credential_error() {
        let err = create_device_jwt("/nonexistent", "d1", "p", 3600).unwrap_err();
        assert!(matches!(err, BridgeError::CredentialError { .. }));
    }
}
