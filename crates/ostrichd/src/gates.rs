//! The standard admission gates, in chain order.

use crate::admission::{AdmissionChain, AdmissionGate, Candidate, Decision, RejectReason, Rejection};
use crate::config::{Policy, VerificationMode};
use crate::external::AdmissionService;
use crate::identity::{IdentityStatus, IdentityTable, VerifierHandle};
use crate::metrics::counters;
use crate::payment::{PaymentError, PaymentLedger};
use crate::ratelimit::EventRateLimiter;
use async_trait::async_trait;
use ostrich_common::types::KIND_METADATA;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Rejects EVENT messages larger than the configured maximum.
pub struct SizeGate;

#[async_trait]
impl AdmissionGate for SizeGate {
    fn name(&self) -> &'static str {
        "size"
    }

    async fn evaluate(&self, candidate: &Candidate, policy: &Policy, _now: u64) -> Decision {
        if candidate.raw_len > policy.max_event_bytes {
            return Decision::reject(
                RejectReason::Oversized,
                format!("event exceeds {} bytes", policy.max_event_bytes),
            );
        }
        Decision::Accept
    }
}

/// Rejects future-dated and already-expired events.
pub struct TimestampGate;

#[async_trait]
impl AdmissionGate for TimestampGate {
    fn name(&self) -> &'static str {
        "timestamp"
    }

    async fn evaluate(&self, candidate: &Candidate, policy: &Policy, now: u64) -> Decision {
        let event = &candidate.event;
        if event.created_at > now.saturating_add(policy.reject_future_seconds) {
            return Decision::reject(
                RejectReason::FutureTimestamp,
                "created_at is too far in the future",
            );
        }
        if event.is_expired(now) {
            return Decision::reject(RejectReason::Expired, "event has expired");
        }
        Decision::Accept
    }
}

/// Applies the kind allow and deny lists.
pub struct KindGate;

#[async_trait]
impl AdmissionGate for KindGate {
    fn name(&self) -> &'static str {
        "kind"
    }

    async fn evaluate(&self, candidate: &Candidate, policy: &Policy, _now: u64) -> Decision {
        let kind = candidate.event.kind;
        let allowed = policy
            .kind_allowlist
            .as_ref()
            .map_or(true, |allow| allow.contains(&kind));
        if !allowed || policy.kind_denylist.contains(&kind) {
            return Decision::reject(
                RejectReason::KindDenied,
                format!("kind {kind} is not accepted"),
            );
        }
        Decision::Accept
    }
}

/// Applies the publisher allow-list.
pub struct AuthorGate;

#[async_trait]
impl AdmissionGate for AuthorGate {
    fn name(&self) -> &'static str {
        "author"
    }

    async fn evaluate(&self, candidate: &Candidate, policy: &Policy, _now: u64) -> Decision {
        match &policy.pubkey_whitelist {
            Some(whitelist) if !whitelist.contains(&candidate.event.pubkey.to_ascii_lowercase()) => {
                Decision::reject(RejectReason::AuthorNotAllowed, "author is not allowed to publish")
            }
            _ => Decision::Accept,
        }
    }
}

/// Requires a verified NIP-05 identity when enforcing.
///
/// Never waits on the network. An author the table has never seen is queued
/// for an on-demand lookup and treated as unverified for now. Metadata events
/// pass in enforcing mode so that authors can publish the claim that gets
/// them verified.
pub struct IdentityGate {
    table: Arc<IdentityTable>,
    verifier: Option<VerifierHandle>,
}

impl IdentityGate {
    /// Creates the gate. Without a verifier, unseen authors are not looked up.
    #[must_use]
    pub fn new(table: Arc<IdentityTable>, verifier: Option<VerifierHandle>) -> Self {
        Self { table, verifier }
    }
}

#[async_trait]
impl AdmissionGate for IdentityGate {
    fn name(&self) -> &'static str {
        "identity"
    }

    async fn evaluate(&self, candidate: &Candidate, policy: &Policy, now: u64) -> Decision {
        let mode = policy.identity.mode;
        if mode == VerificationMode::Disabled {
            return Decision::Accept;
        }
        let event = &candidate.event;
        let pubkey = event.pubkey.to_ascii_lowercase();
        let status = self.table.status(&pubkey, now);
        if status == IdentityStatus::Unknown {
            if let Some(verifier) = &self.verifier {
                verifier.lookup(&pubkey);
            }
        }
        if status == IdentityStatus::Verified {
            return Decision::Accept;
        }

        match mode {
            VerificationMode::Enforcing if event.kind != KIND_METADATA => {
                Decision::reject(RejectReason::Unverified, "author identity is not verified")
            }
            VerificationMode::Passive => {
                info!(pubkey = %pubkey, status = ?status, "unverified author (passive)");
                Decision::Accept
            }
            _ => Decision::Accept,
        }
    }
}

/// Requires a paid sign-up and enough balance for the per-event cost.
/// The balance is debited in the commit phase.
pub struct PaymentGate {
    ledger: Arc<PaymentLedger>,
}

impl PaymentGate {
    /// Creates the gate over `ledger`.
    #[must_use]
    pub fn new(ledger: Arc<PaymentLedger>) -> Self {
        Self { ledger }
    }
}

fn payment_rejection(e: PaymentError) -> Rejection {
    match e {
        PaymentError::NotAdmitted => {
            Rejection::new(RejectReason::PaymentRequired, "admission fee not paid")
        }
        PaymentError::InsufficientBalance { .. } => {
            Rejection::new(RejectReason::InsufficientBalance, e.to_string())
        }
    }
}

#[async_trait]
impl AdmissionGate for PaymentGate {
    fn name(&self) -> &'static str {
        "payment"
    }

    async fn evaluate(&self, candidate: &Candidate, policy: &Policy, _now: u64) -> Decision {
        if !policy.payment.enabled {
            return Decision::Accept;
        }
        match self.ledger.check(&candidate.event.pubkey) {
            Ok(()) => Decision::Accept,
            Err(e) => Decision::Reject(payment_rejection(e)),
        }
    }

    async fn commit(&self, candidate: &Candidate, policy: &Policy) -> Result<(), Rejection> {
        if !policy.payment.enabled {
            return Ok(());
        }
        self.ledger
            .debit(&candidate.event.pubkey, &candidate.event.id)
            .map_err(payment_rejection)
    }
}

/// Consults an external admission service under a deadline.
///
/// Fails open: an unreachable, erroring or slow service accepts the event.
/// An explicit deny from the service is always honored.
pub struct ExternalAdmissionGate {
    service: Arc<dyn AdmissionService>,
    timeout: Duration,
}

impl ExternalAdmissionGate {
    /// Creates the gate.
    #[must_use]
    pub fn new(service: Arc<dyn AdmissionService>, timeout: Duration) -> Self {
        Self { service, timeout }
    }
}

#[async_trait]
impl AdmissionGate for ExternalAdmissionGate {
    fn name(&self) -> &'static str {
        "external"
    }

    async fn evaluate(&self, candidate: &Candidate, _policy: &Policy, _now: u64) -> Decision {
        let call = self.service.check(&candidate.event, &candidate.meta);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(verdict)) if verdict.permit => Decision::Accept,
            Ok(Ok(verdict)) => Decision::reject(
                RejectReason::ExternallyDenied,
                verdict.message.unwrap_or_else(|| "denied by admission service".into()),
            ),
            Ok(Err(e)) => {
                counters::admission_service_failures_total("error");
                warn!(event = candidate.event.id_prefix(), "admission service error, accepting: {}", e);
                Decision::Accept
            }
            Err(_) => {
                counters::admission_service_failures_total("timeout");
                warn!(event = candidate.event.id_prefix(), "admission service timed out, accepting");
                Decision::Accept
            }
        }
    }
}

/// Relay-wide events-per-second limit.
pub struct RateLimitGate {
    limiter: EventRateLimiter,
}

impl RateLimitGate {
    /// Creates the gate with `per_second` events allowed. 0 = unlimited.
    #[must_use]
    pub fn new(per_second: u32) -> Self {
        Self {
            limiter: EventRateLimiter::new(per_second),
        }
    }
}

#[async_trait]
impl AdmissionGate for RateLimitGate {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn evaluate(&self, _candidate: &Candidate, _policy: &Policy, _now: u64) -> Decision {
        if self.limiter.check() {
            Decision::Accept
        } else {
            Decision::reject(RejectReason::RateLimited, "relay is receiving too many events")
        }
    }
}

/// Collaborators the standard chain needs beyond the policy.
pub struct GateDeps {
    /// Identity records.
    pub identity: Arc<IdentityTable>,
    /// Handle for on-demand identity lookups.
    pub verifier: Option<VerifierHandle>,
    /// Payment ledger.
    pub ledger: Arc<PaymentLedger>,
    /// External admission service and its deadline.
    pub service: Option<(Arc<dyn AdmissionService>, Duration)>,
}

/// Builds the standard eight-gate chain.
#[must_use]
pub fn standard_chain(policy: Arc<Policy>, deps: GateDeps) -> AdmissionChain {
    let per_second = policy.messages_per_sec;
    let chain = AdmissionChain::new(policy)
        .with_gate(SizeGate)
        .with_gate(TimestampGate)
        .with_gate(KindGate)
        .with_gate(AuthorGate)
        .with_gate(IdentityGate::new(deps.identity, deps.verifier))
        .with_gate(PaymentGate::new(deps.ledger));
    let chain = match deps.service {
        Some((service, timeout)) => chain.with_gate(ExternalAdmissionGate::new(service, timeout)),
        None => chain,
    };
    chain.with_gate(RateLimitGate::new(per_second))
}
