//! The ordered admission chain.
//!
//! Every EVENT that passes id and signature validation runs through the chain
//! before it may be queued for persistence. Gates are evaluated in order and
//! the first rejection wins. Only when every gate has accepted does the chain
//! run the gates' `commit` step, so side effects (a balance debit) never apply
//! to an event that a later gate refused.

use crate::config::Policy;
use crate::metrics::{counters, histograms};
use crate::registry::ConnId;
use async_trait::async_trait;
use ostrich_common::types::{reason_prefix, Pubkey};
use ostrich_common::Event;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Connection metadata passed along with a candidate event.
#[derive(Debug, Clone)]
pub struct ConnMeta {
    /// Relay-assigned connection id.
    pub conn_id: ConnId,
    /// Client IP address.
    pub ip: IpAddr,
    /// `Origin` header of the WebSocket upgrade.
    pub origin: Option<String>,
    /// `User-Agent` header of the WebSocket upgrade.
    pub user_agent: Option<String>,
    /// Pubkey authenticated via NIP-42, if any.
    pub auth_pubkey: Option<Pubkey>,
}

/// An event awaiting an admission decision.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The validated event.
    pub event: Arc<Event>,
    /// Length of the raw EVENT message it arrived in.
    pub raw_len: usize,
    /// Originating connection.
    pub meta: Arc<ConnMeta>,
}

/// Why an event was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The EVENT message exceeds the size limit.
    Oversized,
    /// `created_at` is too far in the future.
    FutureTimestamp,
    /// The NIP-40 expiration has passed.
    Expired,
    /// The kind is denied or not allowed.
    KindDenied,
    /// The author is not on the publisher allow-list.
    AuthorNotAllowed,
    /// The author's identity is not currently verified.
    Unverified,
    /// The author has not paid the admission cost.
    PaymentRequired,
    /// The author's balance cannot cover the event cost.
    InsufficientBalance,
    /// The external admission service denied the event.
    ExternallyDenied,
    /// The relay-wide event rate was exceeded.
    RateLimited,
}

impl RejectReason {
    /// NIP-01 machine-readable prefix for `OK` messages.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Oversized | Self::FutureTimestamp | Self::Expired => reason_prefix::INVALID,
            Self::KindDenied | Self::AuthorNotAllowed | Self::ExternallyDenied => {
                reason_prefix::BLOCKED
            }
            Self::Unverified => reason_prefix::RESTRICTED,
            Self::PaymentRequired | Self::InsufficientBalance => reason_prefix::PAYMENT_REQUIRED,
            Self::RateLimited => reason_prefix::RATE_LIMITED,
        }
    }

    /// Metrics label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Oversized => "oversized",
            Self::FutureTimestamp => "future_timestamp",
            Self::Expired => "expired",
            Self::KindDenied => "kind_denied",
            Self::AuthorNotAllowed => "author_not_allowed",
            Self::Unverified => "unverified",
            Self::PaymentRequired => "payment_required",
            Self::InsufficientBalance => "insufficient_balance",
            Self::ExternallyDenied => "externally_denied",
            Self::RateLimited => "rate_limited",
        }
    }
}

/// A rejection with a human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Category.
    pub reason: RejectReason,
    /// Detail shown to the client after the prefix.
    pub message: String,
}

impl Rejection {
    /// Creates a rejection.
    pub fn new(reason: RejectReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason.prefix(), self.message)
    }
}

/// Result of evaluating one gate or the whole chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Proceed.
    Accept,
    /// Stop with a reason.
    Reject(Rejection),
}

impl Decision {
    /// Shorthand for `Decision::Reject(Rejection::new(..))`.
    pub fn reject(reason: RejectReason, message: impl Into<String>) -> Self {
        Self::Reject(Rejection::new(reason, message))
    }

    /// Returns `true` for [`Decision::Accept`].
    #[must_use]
    pub const fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }

    /// The rejection reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            Self::Accept => None,
            Self::Reject(r) => Some(r.reason),
        }
    }
}

/// One policy check in the chain.
#[async_trait]
pub trait AdmissionGate: Send + Sync {
    /// Short name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Decides whether `candidate` may proceed. Must not have side effects
    /// that outlive a rejection by a later gate.
    async fn evaluate(&self, candidate: &Candidate, policy: &Policy, now: u64) -> Decision;

    /// Applies this gate's side effects once every gate has accepted.
    ///
    /// A commit may still fail (a concurrent debit drained the balance), in
    /// which case the event is rejected.
    async fn commit(&self, _candidate: &Candidate, _policy: &Policy) -> Result<(), Rejection> {
        Ok(())
    }
}

/// An ordered collection of admission gates over one policy snapshot.
pub struct AdmissionChain {
    gates: Vec<Box<dyn AdmissionGate>>,
    policy: Arc<Policy>,
}

impl AdmissionChain {
    /// Creates an empty chain (accepts everything).
    #[must_use]
    pub fn new(policy: Arc<Policy>) -> Self {
        Self {
            gates: Vec::new(),
            policy,
        }
    }

    /// Appends a gate to the end of the chain.
    #[must_use]
    pub fn with_gate(mut self, gate: impl AdmissionGate + 'static) -> Self {
        self.gates.push(Box::new(gate));
        self
    }

    /// Names of the gates, in evaluation order.
    #[must_use]
    pub fn gate_names(&self) -> Vec<&'static str> {
        self.gates.iter().map(|g| g.name()).collect()
    }

    /// The policy snapshot every gate sees.
    #[must_use]
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Runs every gate against `candidate` at time `now` (Unix seconds).
    pub async fn admit(&self, candidate: &Candidate, now: u64) -> Decision {
        let start = Instant::now();
        let decision = self.decide(candidate, now).await;
        histograms::admission_latency_seconds(start.elapsed().as_secs_f64());

        match &decision {
            Decision::Accept => counters::admission_decisions_total("accepted"),
            Decision::Reject(r) => {
                counters::admission_decisions_total(r.reason.label());
                debug!(
                    cid = candidate.meta.conn_id,
                    event = candidate.event.id_prefix(),
                    reason = r.reason.label(),
                    "event rejected"
                );
            }
        }
        decision
    }

    async fn decide(&self, candidate: &Candidate, now: u64) -> Decision {
        for gate in &self.gates {
            let decision = gate.evaluate(candidate, &self.policy, now).await;
            if !decision.is_accept() {
                return decision;
            }
        }
        for gate in &self.gates {
            if let Err(rejection) = gate.commit(candidate, &self.policy).await {
                return Decision::Reject(rejection);
            }
        }
        Decision::Accept
    }
}
