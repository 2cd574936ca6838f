//! Device identity derivation and canonical signature payloads
//!
//! A device identity is an ed25519 keypair created once per client
//! installation. The device id is a one-way function of the public key, so
//! any claimed id can be checked against its recomputation.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

/// Payload version without a challenge nonce (legacy, loopback only).
pub const PAYLOAD_V1: &str = "v1";
/// Payload version bound to the connection's challenge nonce.
pub const PAYLOAD_V2: &str = "v2";

/// Derive the device id from a base64-encoded ed25519 public key.
///
/// Returns `None` for anything that is not a well-formed key, so callers
/// can treat "not a valid device" uniformly instead of handling errors.
pub fn derive_device_id(public_key_b64: &str) -> Option<String> {
    let raw = BASE64.decode(public_key_b64.trim()).ok()?;
    if raw.len() != ed25519_dalek::PUBLIC_KEY_LENGTH {
        return None;
    }
    let digest = Sha256::digest(&raw);
    Some(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Fields covered by a connect-time device signature.
#[derive(Debug, Clone)]
pub struct PayloadParams<'a> {
    pub device_id: &'a str,
    pub client_id: &'a str,
    pub client_mode: &'a str,
    pub role: &'a str,
    pub scopes: &'a [String],
    pub signed_at_ms: i64,
    pub token: Option<&'a str>,
    pub nonce: Option<&'a str>,
}

/// Build the canonical byte payload a device signs.
///
/// Scopes are sorted and deduplicated so the signature is independent of
/// the order the client listed them in. `PAYLOAD_V2` appends the challenge
/// nonce; `PAYLOAD_V1` is the pre-nonce shape.
pub fn canonical_payload(version: &str, params: &PayloadParams<'_>) -> Vec<u8> {
    let mut scopes: Vec<&str> = params.scopes.iter().map(String::as_str).collect();
    scopes.sort_unstable();
    scopes.dedup();

    let mut fields = vec![
        version.to_string(),
        params.device_id.to_string(),
        params.client_id.to_string(),
        params.client_mode.to_string(),
        params.role.to_string(),
        scopes.join(","),
        params.signed_at_ms.to_string(),
        params.token.unwrap_or("").to_string(),
    ];
    if version == PAYLOAD_V2 {
        fields.push(params.nonce.unwrap_or("").to_string());
    }
    fields.join("|").into_bytes()
}

/// Verify an ed25519 signature over `payload`.
///
/// Any decode failure (key, signature) is a plain `false`, never a panic.
pub fn verify_signature(public_key_b64: &str, payload: &[u8], signature_b64: &str) -> bool {
    let Ok(key_raw) = BASE64.decode(public_key_b64.trim()) else {
        return false;
    };
    let Ok(key_bytes) = <[u8; ed25519_dalek::PUBLIC_KEY_LENGTH]>::try_from(key_raw.as_slice())
    else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_raw) = BASE64.decode(signature_b64.trim()) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&sig_raw) else {
        return false;
    };
    key.verify(payload, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn test_keypair() -> (SigningKey, String) {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let public_b64 = BASE64.encode(signing.verifying_key().as_bytes());
        (signing, public_b64)
    }

    #[test]
    fn test_derive_is_deterministic() {
        let (_, public_b64) = test_keypair();
        let a = derive_device_id(&public_b64).unwrap();
        let b = derive_device_id(&public_b64).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_derive_rejects_malformed_keys() {
        assert!(derive_device_id("not base64!!!").is_none());
        assert!(derive_device_id(&BASE64.encode([1u8; 16])).is_none());
        assert!(derive_device_id("").is_none());
    }

    #[test]
    fn test_canonical_payload_scope_order_independent() {
        let scopes_a = vec!["write".to_string(), "admin".to_string(), "write".to_string()];
        let scopes_b = vec!["admin".to_string(), "write".to_string()];
        fn params<'a>(scopes: &'a [String]) -> PayloadParams<'a> {
            PayloadParams {
                device_id: "d1",
                client_id: "c1",
                client_mode: "cli",
                role: "operator",
                scopes,
                signed_at_ms: 1000,
                token: None,
                nonce: Some("n"),
            }
        }
        assert_eq!(
            canonical_payload(PAYLOAD_V2, &params(&scopes_a)),
            canonical_payload(PAYLOAD_V2, &params(&scopes_b))
        );
    }

    #[test]
    fn test_v1_and_v2_payloads_differ() {
        let params = PayloadParams {
            device_id: "d1",
            client_id: "c1",
            client_mode: "cli",
            role: "operator",
            scopes: &[],
            signed_at_ms: 1000,
            token: None,
            nonce: Some("nonce"),
        };
        assert_ne!(
            canonical_payload(PAYLOAD_V1, &params),
            canonical_payload(PAYLOAD_V2, &params)
        );
    }

    #[test]
    fn test_signature_roundtrip() {
        let (signing, public_b64) = test_keypair();
        let payload = canonical_payload(
            PAYLOAD_V2,
            &PayloadParams {
                device_id: "d1",
                client_id: "c1",
                client_mode: "ui",
                role: "operator",
                scopes: &["admin".to_string()],
                signed_at_ms: 42,
                token: Some("tok"),
                nonce: Some("nonce"),
            },
        );
        let signature = BASE64.encode(signing.sign(&payload).to_bytes());
        assert!(verify_signature(&public_b64, &payload, &signature));
        assert!(!verify_signature(&public_b64, b"other payload", &signature));
        assert!(!verify_signature(&public_b64, &payload, "garbage"));
    }
}
