use thiserror::Error;

/// Errors that end a connection or the relay itself.
#[derive(Error, Debug)]
pub enum RelayError {
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The connection was closed by the remote peer or refused by a limit.
    #[error("connection closed")]
    ConnectionClosed,
    /// The storage engine became unusable; the relay cannot continue.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    /// Opening the store failed at startup.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

/// Errors reported by an [`EventStore`](crate::storage::EventStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The write was refused (constraint violation, bad data). Affects one event.
    #[error("{0}")]
    Rejected(String),
    /// The engine cannot serve any request.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// SQLite primary result codes after which the database cannot take writes.
const FATAL_SQLITE_CODES: &[i32] = &[
    8,  // SQLITE_READONLY
    10, // SQLITE_IOERR
    11, // SQLITE_CORRUPT
    13, // SQLITE_FULL
    14, // SQLITE_CANTOPEN
    26, // SQLITE_NOTADB
];

/// Whether a SQLite result code (primary or extended) means the engine is gone.
fn is_fatal_sqlite_code(code: &str) -> bool {
    code.parse::<i32>()
        .is_ok_and(|c| FATAL_SQLITE_CODES.contains(&(c & 0xff)))
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Database(db) => {
                if db.code().is_some_and(|code| is_fatal_sqlite_code(&code)) {
                    Self::Unavailable(db.to_string())
                } else {
                    Self::Rejected(db.to_string())
                }
            }
            // busy pool under load; the next write may well succeed
            transient @ sqlx::Error::PoolTimedOut => Self::Rejected(transient.to_string()),
            bad @ (sqlx::Error::Decode(_)
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::RowNotFound) => Self::Rejected(bad.to_string()),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// Errors from handing an admitted event to the persistence queue.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The queue stayed full past the enqueue deadline.
    #[error("persistence queue full")]
    Backpressure,
    /// The writers have shut down.
    #[error("persistence queue closed")]
    Closed,
}

/// Errors from resolving a NIP-05 identity.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// Network or HTTP failure.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The domain answered with something other than a `nostr.json` document.
    #[error("malformed response: {0}")]
    BadResponse(String),
}

/// Errors from the Lightning payment processor.
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// Network or HTTP failure.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The processor answered with something unusable.
    #[error("malformed response: {0}")]
    BadResponse(String),
}

/// Reasons a sign-up or payment callback cannot be handled.
#[derive(Error, Debug)]
pub enum SignupError {
    /// The pubkey is not 64 hex characters.
    #[error("invalid pubkey")]
    InvalidPubkey,
    /// A top-up amount of zero was requested.
    #[error("amount must be greater than 0")]
    InvalidAmount,
    /// New sign-ups are turned off.
    #[error("sign-ups are closed")]
    SignupsClosed,
    /// No outstanding invoice has this payment hash.
    #[error("unknown invoice")]
    UnknownInvoice,
    /// The processor reports the invoice as unpaid.
    #[error("invoice not paid")]
    NotPaid,
    /// The processor could not be reached or answered badly.
    #[error("payment processor: {0}")]
    Processor(#[from] ProcessorError),
}

/// Errors from the external admission service.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Network or HTTP failure.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The call exceeded its deadline.
    #[error("timed out")]
    Timeout,
}

/// Reasons a NIP-42 AUTH event is refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    /// AUTH is not enabled on this relay.
    #[error("authentication is not enabled")]
    Disabled,
    /// The event is not kind 22242.
    #[error("wrong event kind")]
    WrongKind,
    /// The `challenge` tag is missing or does not match.
    #[error("challenge mismatch")]
    ChallengeMismatch,
    /// The `relay` tag is missing or names another relay.
    #[error("relay mismatch")]
    RelayMismatch,
    /// `created_at` is too far from now.
    #[error("timestamp expired")]
    TimestampExpired,
    /// The id or signature does not verify.
    #[error("invalid signature")]
    InvalidSignature,
}

/// Reasons a REQ cannot be registered.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The connection already holds the maximum number of subscriptions.
    #[error("too many subscriptions (max {0})")]
    TooManySubscriptions(usize),
    /// The REQ carries more filters than allowed.
    #[error("too many filters (max {0})")]
    TooManyFilters(usize),
}
