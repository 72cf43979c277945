use crate::error::AuthError;
use ostrich_common::crypto::validate_event;
use ostrich_common::types::{Pubkey, KIND_AUTH};
use ostrich_common::Event;
use rand::RngCore;

const TIMESTAMP_TOLERANCE: u64 = 600;

/// Generates a fresh NIP-42 challenge.
#[must_use]
pub fn new_challenge() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn normalize_relay(url: &str) -> String {
    url.trim().trim_end_matches('/').to_ascii_lowercase()
}

/// Checks a NIP-42 AUTH event against the challenge issued on this
/// connection. When `relay_url` is configured the `relay` tag must name it.
///
/// # Errors
///
/// Returns the first [`AuthError`] that applies.
pub fn verify_auth(
    event: &Event,
    challenge: &str,
    relay_url: Option<&str>,
    now: u64,
) -> Result<Pubkey, AuthError> {
    if event.kind != KIND_AUTH {
        return Err(AuthError::WrongKind);
    }
    if now.abs_diff(event.created_at) > TIMESTAMP_TOLERANCE {
        return Err(AuthError::TimestampExpired);
    }
    if !event.tag_values("challenge").any(|c| c == challenge) {
        return Err(AuthError::ChallengeMismatch);
    }
    let mut relays = event.tag_values("relay").peekable();
    if relays.peek().is_none() {
        return Err(AuthError::RelayMismatch);
    }
    if let Some(expected) = relay_url {
        let expected = normalize_relay(expected);
        if !relays.any(|r| normalize_relay(r) == expected) {
            return Err(AuthError::RelayMismatch);
        }
    }
    validate_event(event).map_err(|_| AuthError::InvalidSignature)?;
    Ok(event.pubkey.to_ascii_lowercase())
}
