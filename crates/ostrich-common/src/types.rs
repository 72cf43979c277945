//! Protocol constants shared by the relay and its clients.

/// Hex-encoded 32-byte x-only public key.
pub type Pubkey = String;

/// Kind of a user metadata event (NIP-01). Carries the `nip05` claim.
pub const KIND_METADATA: u16 = 0;
/// Kind of a client authentication event (NIP-42).
pub const KIND_AUTH: u16 = 22242;
/// Kinds carrying private messages: NIP-04 DMs, NIP-44 payloads, NIP-59 gift wraps.
pub const PRIVATE_KINDS: [u16; 3] = [4, 44, 1059];

/// Machine-readable prefixes used in `OK` and `CLOSED` messages (NIP-01).
pub mod reason_prefix {
    /// The event or request was malformed or violated a relay limit.
    pub const INVALID: &str = "invalid";
    /// The author or kind is not allowed on this relay.
    pub const BLOCKED: &str = "blocked";
    /// The sender exceeded a rate limit.
    pub const RATE_LIMITED: &str = "rate-limited";
    /// The action requires something the client has not provided (auth, verification).
    pub const RESTRICTED: &str = "restricted";
    /// The author has not paid for access, or cannot cover the event cost.
    pub const PAYMENT_REQUIRED: &str = "payment-required";
    /// The event was already stored.
    pub const DUPLICATE: &str = "duplicate";
    /// The relay failed to process the event.
    pub const ERROR: &str = "error";
}

/// Length of a hex-encoded event id or public key.
pub const HEX_ID_LEN: usize = 64;
/// Length of a hex-encoded Schnorr signature.
pub const HEX_SIG_LEN: usize = 128;
