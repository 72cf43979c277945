//! Event id hashing and BIP-340 signature verification.
//!
//! An event id is `SHA-256([0, pubkey, created_at, kind, tags, content])`
//! over the compact JSON serialization; the signature is a Schnorr
//! signature by `pubkey` over that digest. Both checks are pure: no state,
//! no clock.

use crate::event::Event;
use crate::types::{HEX_ID_LEN, HEX_SIG_LEN};
use secp256k1::{schnorr, Keypair, Message, XOnlyPublicKey, SECP256K1};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Reasons an event fails structural or cryptographic validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A hex field has the wrong length or non-hex characters.
    #[error("malformed {field}")]
    BadHex {
        /// Name of the offending field.
        field: &'static str,
    },
    /// The id does not match the canonical hash of the event.
    #[error("event id does not match content")]
    IdMismatch,
    /// The Schnorr signature does not verify.
    #[error("signature verification failed")]
    BadSignature,
}

/// Computes the canonical SHA-256 digest of an event's signed fields.
#[must_use]
pub fn event_hash(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> [u8; 32] {
    let canonical = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    Sha256::digest(canonical.to_string().as_bytes()).into()
}

fn check_hex(value: &str, len: usize, field: &'static str) -> Result<(), ValidationError> {
    if value.len() == len && value.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(ValidationError::BadHex { field })
    }
}

/// Verifies an event's id and signature.
///
/// # Errors
///
/// Returns [`ValidationError`] describing the first check that failed.
///
/// # Examples
///
/// ```
/// use ostrich_common::crypto;
///
/// let keys = crypto::keypair_from_secret(&[7u8; 32]).unwrap();
/// let ev = crypto::sign_event(&keys, 1_700_000_000, 1, vec![], "hi");
/// assert!(crypto::validate_event(&ev).is_ok());
/// ```
pub fn validate_event(event: &Event) -> Result<(), ValidationError> {
    check_hex(&event.id, HEX_ID_LEN, "id")?;
    check_hex(&event.pubkey, HEX_ID_LEN, "pubkey")?;
    check_hex(&event.sig, HEX_SIG_LEN, "sig")?;

    let digest = event_hash(
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    );
    if !hex::encode(digest).eq_ignore_ascii_case(&event.id) {
        return Err(ValidationError::IdMismatch);
    }

    let pubkey_bytes =
        hex::decode(&event.pubkey).map_err(|_| ValidationError::BadHex { field: "pubkey" })?;
    let sig_bytes = hex::decode(&event.sig).map_err(|_| ValidationError::BadHex { field: "sig" })?;
    let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
        .map_err(|_| ValidationError::BadHex { field: "pubkey" })?;
    let sig = schnorr::Signature::from_slice(&sig_bytes)
        .map_err(|_| ValidationError::BadHex { field: "sig" })?;

    SECP256K1
        .verify_schnorr(&sig, &Message::from_digest(digest), &pubkey)
        .map_err(|_| ValidationError::BadSignature)
}

/// Builds a keypair from a 32-byte secret key.
///
/// # Errors
///
/// Returns an error if the bytes are not a valid secp256k1 secret key.
pub fn keypair_from_secret(secret: &[u8; 32]) -> Result<Keypair, secp256k1::Error> {
    Keypair::from_seckey_slice(SECP256K1, secret)
}

/// Hex-encoded x-only public key of `keys`.
#[must_use]
pub fn public_key_hex(keys: &Keypair) -> String {
    hex::encode(keys.x_only_public_key().0.serialize())
}

/// Creates and signs an event. Used by tests and tooling; the relay itself
/// only verifies.
#[must_use]
pub fn sign_event(
    keys: &Keypair,
    created_at: u64,
    kind: u16,
    tags: Vec<Vec<String>>,
    content: &str,
) -> Event {
    let pubkey = public_key_hex(keys);
    let digest = event_hash(&pubkey, created_at, kind, &tags, content);
    let sig = SECP256K1.sign_schnorr_no_aux_rand(&Message::from_digest(digest), keys);
    Event {
        id: hex::encode(digest),
        pubkey,
        created_at,
        kind,
        tags,
        content: content.to_string(),
        sig: sig.to_string(),
    }
}

/// Returns the current Unix timestamp in seconds.
///
/// Returns 0 if the system clock is before the Unix epoch.
///
/// # Examples
///
/// ```
/// let now = ostrich_common::crypto::unix_now();
/// assert!(now > 1_700_000_000);
/// ```
#[must_use]
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
