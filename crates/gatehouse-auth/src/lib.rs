//! Gatehouse Auth - Device identity, pairing and credential resolution
//!
//! Everything the gateway needs to decide whether a connection may proceed:
//!
//! 1. [`identity`] derives device ids from public keys and builds the
//!    canonical payloads devices sign.
//! 2. [`ratelimit`] counts failed attempts per `(ip, auth factor)` and locks
//!    scopes out independently.
//! 3. [`token`] issues and verifies per-(device, role) bearer tokens.
//! 4. [`pairing`] holds the durable trust records and the human-approval
//!    workflow that gates privilege escalation.
//! 5. [`signature`] validates connect-time device signature blocks.
//! 6. [`resolver`] folds both auth factors into a single verdict.
//! 7. [`audit`] records every privilege change and rejection.
//!
//! # Example
//!
//! ```no_run
//! use gatehouse_auth::{AuditLog, PairingCoordinator, PairingStore};
//! use std::sync::Arc;
//!
//! async fn example() {
//!     let store = Arc::new(
//!         PairingStore::with_path("/tmp/paired_devices.json".into())
//!             .await
//!             .unwrap(),
//!     );
//!     let audit = Arc::new(AuditLog::new());
//!     let coordinator = PairingCoordinator::new(store, audit);
//!
//!     // Approve a request surfaced to the operator UI
//!     let record = coordinator.approve("request-id").await.unwrap();
//!     println!("Device {} paired", record.device_id);
//! }
//! ```

pub mod audit;
pub mod identity;
pub mod pairing;
pub mod ratelimit;
pub mod resolver;
pub mod signature;
pub mod token;

pub use audit::{AuditEntry, AuditLog};
pub use identity::{canonical_payload, derive_device_id, verify_signature, PayloadParams};
pub use pairing::{
    ClientMeta, PairedDeviceRecord, PairingCoordinator, PairingError, PairingResult,
    PairingStore, PendingPairingRequest, ReconcileOutcome,
};
pub use ratelimit::{AuthRateLimiter, AuthScope, RateDecision};
pub use resolver::{AuthAttempt, AuthMethod, AuthResolver, AuthVerdict};
pub use signature::{DeviceSignatureVerifier, SignatureContext, SignatureFailure};
pub use token::{DeviceToken, DeviceTokenStore, TokenError, TokenRejection, TokenResult};
