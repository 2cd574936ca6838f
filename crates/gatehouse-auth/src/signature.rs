//! Connect-time device signature verification
//!
//! Validates the signature block a device presents during the handshake:
//! identity recomputation, freshness, challenge-nonce binding, and the
//! signature itself. Each verification attempt ends in exactly one of five
//! terminal outcomes; callers close the connection with the matching reason.

use crate::identity::{self, PayloadParams, PAYLOAD_V1, PAYLOAD_V2};
use chrono::Utc;
use gatehouse_core::protocol::DeviceAuth;
use thiserror::Error;
use tracing::debug;

/// Accepted skew between the device clock and the gateway clock.
pub const SIGNATURE_SKEW_MS: i64 = 10 * 60 * 1000;

/// Terminal, mutually exclusive verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignatureFailure {
    #[error("device id does not match its public key")]
    DeviceIdMismatch,
    #[error("device signature timestamp outside the accepted window")]
    Stale,
    #[error("device signature is missing the challenge nonce")]
    NonceMissing,
    #[error("device signature nonce does not match the challenge")]
    NonceMismatch,
    #[error("device signature is invalid")]
    Invalid,
}

impl SignatureFailure {
    /// Stable wire/reason slug
    pub fn as_reason(&self) -> &'static str {
        match self {
            SignatureFailure::DeviceIdMismatch => "device-id-mismatch",
            SignatureFailure::Stale => "device-signature-stale",
            SignatureFailure::NonceMissing => "device-nonce-missing",
            SignatureFailure::NonceMismatch => "device-nonce-mismatch",
            SignatureFailure::Invalid => "device-signature-invalid",
        }
    }
}

/// Everything about the connection a signature is checked against.
#[derive(Debug, Clone)]
pub struct SignatureContext<'a> {
    /// Nonce issued in this connection's challenge
    pub challenge_nonce: &'a str,
    /// Loopback connections may use the legacy nonce-less payload
    pub is_local: bool,
    pub client_id: &'a str,
    pub client_mode: &'a str,
    pub role: &'a str,
    pub scopes: &'a [String],
    /// Token covered by the signature, when one was presented
    pub token: Option<&'a str>,
}

/// Validates device signature blocks.
pub struct DeviceSignatureVerifier {
    skew_ms: i64,
}

impl Default for DeviceSignatureVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceSignatureVerifier {
    pub fn new() -> Self {
        Self {
            skew_ms: SIGNATURE_SKEW_MS,
        }
    }

    #[cfg(test)]
    fn with_skew_ms(skew_ms: i64) -> Self {
        Self { skew_ms }
    }

    /// Run the verification state machine against the current clock.
    pub fn verify(
        &self,
        device: &DeviceAuth,
        ctx: &SignatureContext<'_>,
    ) -> Result<(), SignatureFailure> {
        self.verify_at(device, ctx, Utc::now().timestamp_millis())
    }

    pub fn verify_at(
        &self,
        device: &DeviceAuth,
        ctx: &SignatureContext<'_>,
        now_ms: i64,
    ) -> Result<(), SignatureFailure> {
        // 1. The claimed id must match its recomputation; a malformed key
        //    derives to nothing and fails the same way.
        match identity::derive_device_id(&device.public_key) {
            Some(derived) if derived == device.id => {}
            _ => return Err(SignatureFailure::DeviceIdMismatch),
        }

        // 2. Freshness, both directions.
        if (now_ms - device.signed_at_ms).abs() > self.skew_ms {
            return Err(SignatureFailure::Stale);
        }

        // 3. Nonce requirement: bound to the challenge unless loopback.
        match device.nonce.as_deref() {
            None if !ctx.is_local => return Err(SignatureFailure::NonceMissing),
            Some(nonce) if nonce != ctx.challenge_nonce => {
                return Err(SignatureFailure::NonceMismatch)
            }
            _ => {}
        }

        // 4. Verify the current (v2) canonical payload; the nonce slot is
        //    empty for local nonce-less clients.
        let params = PayloadParams {
            device_id: &device.id,
            client_id: ctx.client_id,
            client_mode: ctx.client_mode,
            role: ctx.role,
            scopes: ctx.scopes,
            signed_at_ms: device.signed_at_ms,
            token: ctx.token,
            nonce: device.nonce.as_deref(),
        };
        let payload = identity::canonical_payload(PAYLOAD_V2, &params);
        if identity::verify_signature(&device.public_key, &payload, &device.signature) {
            return Ok(());
        }

        // Legacy shim: pre-nonce clients connecting over loopback signed the
        // v1 payload shape. Explicit secondary check so it can be removed
        // cleanly later.
        if ctx.is_local && device.nonce.is_none() {
            let legacy = identity::canonical_payload(PAYLOAD_V1, &params);
            if identity::verify_signature(&device.public_key, &legacy, &device.signature) {
                debug!("Accepted legacy v1 signature from {}", device.id);
                return Ok(());
            }
        }

        Err(SignatureFailure::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use ed25519_dalek::{Signer, SigningKey};

    const NONCE: &str = "challenge-nonce";

    fn keypair() -> (SigningKey, String, String) {
        let signing = SigningKey::from_bytes(&[42u8; 32]);
        let public_b64 = BASE64.encode(signing.verifying_key().as_bytes());
        let device_id = identity::derive_device_id(&public_b64).unwrap();
        (signing, public_b64, device_id)
    }

    fn ctx(is_local: bool) -> SignatureContext<'static> {
        SignatureContext {
            challenge_nonce: NONCE,
            is_local,
            client_id: "client-1",
            client_mode: "cli",
            role: "operator",
            scopes: &[],
            token: None,
        }
    }

    fn signed_device(
        signing: &SigningKey,
        public_b64: &str,
        device_id: &str,
        signed_at_ms: i64,
        nonce: Option<&str>,
        version: &str,
    ) -> DeviceAuth {
        let params = PayloadParams {
            device_id,
            client_id: "client-1",
            client_mode: "cli",
            role: "operator",
            scopes: &[],
            signed_at_ms,
            token: None,
            nonce,
        };
        let payload = identity::canonical_payload(version, &params);
        DeviceAuth {
            id: device_id.to_string(),
            public_key: public_b64.to_string(),
            signature: BASE64.encode(signing.sign(&payload).to_bytes()),
            signed_at_ms,
            nonce: nonce.map(str::to_string),
        }
    }

    #[test]
    fn test_valid_v2_signature() {
        let (signing, public_b64, device_id) = keypair();
        let device = signed_device(&signing, &public_b64, &device_id, 1000, Some(NONCE), PAYLOAD_V2);
        let verifier = DeviceSignatureVerifier::new();
        assert!(verifier.verify_at(&device, &ctx(false), 1000).is_ok());
    }

    #[test]
    fn test_id_mismatch_wins_over_everything() {
        let (signing, public_b64, device_id) = keypair();
        let mut device =
            signed_device(&signing, &public_b64, &device_id, 1000, Some(NONCE), PAYLOAD_V2);
        device.id = "claimed-something-else".into();
        let verifier = DeviceSignatureVerifier::new();
        assert_eq!(
            verifier.verify_at(&device, &ctx(false), 1000).unwrap_err(),
            SignatureFailure::DeviceIdMismatch
        );
    }

    #[test]
    fn test_malformed_key_reads_as_id_mismatch() {
        let (signing, public_b64, device_id) = keypair();
        let mut device =
            signed_device(&signing, &public_b64, &device_id, 1000, Some(NONCE), PAYLOAD_V2);
        device.public_key = "!!not a key!!".into();
        let verifier = DeviceSignatureVerifier::new();
        assert_eq!(
            verifier.verify_at(&device, &ctx(false), 1000).unwrap_err(),
            SignatureFailure::DeviceIdMismatch
        );
    }

    #[test]
    fn test_stale_signature_rejected_regardless_of_validity() {
        let (signing, public_b64, device_id) = keypair();
        let verifier = DeviceSignatureVerifier::with_skew_ms(SIGNATURE_SKEW_MS);
        // Too old.
        let device = signed_device(&signing, &public_b64, &device_id, 0, Some(NONCE), PAYLOAD_V2);
        assert_eq!(
            verifier
                .verify_at(&device, &ctx(false), SIGNATURE_SKEW_MS + 1)
                .unwrap_err(),
            SignatureFailure::Stale
        );
        // Too far in the future.
        let device = signed_device(
            &signing,
            &public_b64,
            &device_id,
            SIGNATURE_SKEW_MS + 1,
            Some(NONCE),
            PAYLOAD_V2,
        );
        assert_eq!(
            verifier.verify_at(&device, &ctx(false), 0).unwrap_err(),
            SignatureFailure::Stale
        );
        // Right at the edge is fine.
        let device = signed_device(
            &signing,
            &public_b64,
            &device_id,
            SIGNATURE_SKEW_MS,
            Some(NONCE),
            PAYLOAD_V2,
        );
        assert!(verifier.verify_at(&device, &ctx(false), 0).is_ok());
    }

    #[test]
    fn test_remote_requires_nonce() {
        let (signing, public_b64, device_id) = keypair();
        let device = signed_device(&signing, &public_b64, &device_id, 1000, None, PAYLOAD_V1);
        let verifier = DeviceSignatureVerifier::new();
        assert_eq!(
            verifier.verify_at(&device, &ctx(false), 1000).unwrap_err(),
            SignatureFailure::NonceMissing
        );
        // The same nonce-less signature is fine over loopback.
        assert!(verifier.verify_at(&device, &ctx(true), 1000).is_ok());
    }

    #[test]
    fn test_wrong_nonce_rejected() {
        let (signing, public_b64, device_id) = keypair();
        let device = signed_device(
            &signing,
            &public_b64,
            &device_id,
            1000,
            Some("replayed-nonce"),
            PAYLOAD_V2,
        );
        let verifier = DeviceSignatureVerifier::new();
        assert_eq!(
            verifier.verify_at(&device, &ctx(false), 1000).unwrap_err(),
            SignatureFailure::NonceMismatch
        );
        // Even locally the nonce must match when presented.
        assert_eq!(
            verifier.verify_at(&device, &ctx(true), 1000).unwrap_err(),
            SignatureFailure::NonceMismatch
        );
    }

    #[test]
    fn test_bad_signature_rejected() {
        let (signing, public_b64, device_id) = keypair();
        let mut device =
            signed_device(&signing, &public_b64, &device_id, 1000, Some(NONCE), PAYLOAD_V2);
        device.signature = BASE64.encode([0u8; 64]);
        let verifier = DeviceSignatureVerifier::new();
        assert_eq!(
            verifier.verify_at(&device, &ctx(false), 1000).unwrap_err(),
            SignatureFailure::Invalid
        );
    }

    #[test]
    fn test_payload_context_is_bound() {
        let (signing, public_b64, device_id) = keypair();
        let device = signed_device(&signing, &public_b64, &device_id, 1000, Some(NONCE), PAYLOAD_V2);
        let verifier = DeviceSignatureVerifier::new();
        let mut other = ctx(false);
        other.role = "node";
        // Signature was made for role "operator"; presenting it for "node" fails.
        assert_eq!(
            verifier.verify_at(&device, &other, 1000).unwrap_err(),
            SignatureFailure::Invalid
        );
    }
}
