//! NIP-05 identity verification.
//!
//! [`IdentityTable`] holds one record per author who has claimed an identity.
//! It is written only by the [`IdentityVerifier`] task and read by the
//! admission chain, which never waits on the network: an author whose check
//! is still in flight is simply not verified yet.
//!
//! Record lifecycle:
//! - `Unverified` → attempt → `Verified { at }` or `Failed { retry_at }`
//! - `Verified` reads as unverified once the expiration window has passed,
//!   whether or not a re-check has run
//! - `Failed` is retried with exponential backoff whose floor is the update
//!   frequency; after too many consecutive failures it becomes `Abandoned`
//! - claims on a blocked domain become permanently failed without a request
//!
//! A newer metadata event from the author resets any record.

use crate::backoff::ExponentialBackoff;
use crate::config::IdentityPolicy;
use crate::error::ResolveError;
use crate::metrics::counters;
use crate::storage::EventStore;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use lru::LruCache;
use ostrich_common::crypto::unix_now;
use ostrich_common::types::Pubkey;
use ostrich_common::Event;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const REQUEST_QUEUE: usize = 1024;
const LOOKUP_CACHE_SIZE: usize = 100_000;
const CONCURRENT_CHECKS: usize = 8;
const MAX_BACKOFF: Duration = Duration::from_secs(30 * 86_400);

/// A parsed `name@domain` identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nip05 {
    /// Local part.
    pub name: String,
    /// Domain part.
    pub domain: String,
}

impl Nip05 {
    /// Parses an identifier. A bare domain means `_@domain`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_ascii_lowercase();
        let (name, domain) = match raw.split_once('@') {
            Some((name, domain)) => (name.to_string(), domain.to_string()),
            None => ("_".to_string(), raw),
        };
        let name_ok = !name.is_empty()
            && name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
        let domain_ok = domain.contains('.')
            && !domain.starts_with('.')
            && !domain.ends_with('.')
            && domain
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.'));
        (name_ok && domain_ok).then_some(Self { name, domain })
    }
}

/// Externally visible verification state of an author.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityStatus {
    /// No claim on record.
    Unknown,
    /// Claimed but not (or no longer) verified.
    Unverified,
    /// Verified within the expiration window.
    Verified,
    /// The last check failed; a retry is scheduled or the domain is blocked.
    Failed,
    /// Too many consecutive failures; no further automatic retries.
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    Unverified,
    Verified { at: u64 },
    Failed { retry_at: u64 },
    Abandoned,
    Blocked,
}

#[derive(Debug, Clone)]
struct IdentityRecord {
    claim: Nip05,
    claimed_at: u64,
    state: RecordState,
    failures: u32,
}

/// Shared pubkey → identity record table.
pub struct IdentityTable {
    records: DashMap<Pubkey, IdentityRecord>,
    policy: IdentityPolicy,
    backoff: ExponentialBackoff,
}

impl IdentityTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new(policy: IdentityPolicy) -> Self {
        let backoff = ExponentialBackoff::new(policy.update_frequency, MAX_BACKOFF, 2.0);
        Self {
            records: DashMap::new(),
            policy,
            backoff,
        }
    }

    /// The policy this table applies.
    #[must_use]
    pub const fn policy(&self) -> &IdentityPolicy {
        &self.policy
    }

    /// Returns `true` if `pubkey` has any record.
    #[must_use]
    pub fn contains(&self, pubkey: &str) -> bool {
        self.records.contains_key(pubkey)
    }

    /// Status of `pubkey` at time `now`, applying expiration lazily.
    #[must_use]
    pub fn status(&self, pubkey: &str, now: u64) -> IdentityStatus {
        let Some(record) = self.records.get(pubkey) else {
            return IdentityStatus::Unknown;
        };
        match record.state {
            RecordState::Unverified => IdentityStatus::Unverified,
            RecordState::Verified { at } => {
                if now.saturating_sub(at) > self.policy.expiration.as_secs() {
                    IdentityStatus::Unverified
                } else {
                    IdentityStatus::Verified
                }
            }
            RecordState::Failed { .. } | RecordState::Blocked => IdentityStatus::Failed,
            RecordState::Abandoned => IdentityStatus::Abandoned,
        }
    }

    /// Shorthand for `status(..) == Verified`.
    #[must_use]
    pub fn is_verified(&self, pubkey: &str, now: u64) -> bool {
        self.status(pubkey, now) == IdentityStatus::Verified
    }

    /// Consecutive failures recorded for `pubkey`.
    #[must_use]
    pub fn failures(&self, pubkey: &str) -> u32 {
        self.records.get(pubkey).map_or(0, |r| r.failures)
    }

    /// Clears an abandoned or failed record so it is retried on the next sweep.
    pub fn reset(&self, pubkey: &str) {
        if let Some(mut record) = self.records.get_mut(pubkey) {
            record.state = RecordState::Unverified;
            record.failures = 0;
        }
    }

    /// Records a claim from a metadata event created at `claimed_at`.
    /// Returns `true` if the record is new or was reset.
    pub(crate) fn record_claim(&self, pubkey: &str, claim: Nip05, claimed_at: u64) -> bool {
        match self.records.entry(pubkey.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if claimed_at <= record.claimed_at {
                    return false;
                }
                if record.claim == claim
                    && matches!(record.state, RecordState::Verified { .. })
                {
                    record.claimed_at = claimed_at;
                    return false;
                }
                *record = IdentityRecord {
                    claim,
                    claimed_at,
                    state: RecordState::Unverified,
                    failures: 0,
                };
                true
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(IdentityRecord {
                    claim,
                    claimed_at,
                    state: RecordState::Unverified,
                    failures: 0,
                });
                true
            }
        }
    }

    pub(crate) fn record_success(&self, pubkey: &str, now: u64) {
        if let Some(mut record) = self.records.get_mut(pubkey) {
            record.state = RecordState::Verified { at: now };
            record.failures = 0;
        }
    }

    /// Records a failed attempt and returns the resulting status.
    pub(crate) fn record_failure(&self, pubkey: &str, now: u64) -> IdentityStatus {
        let Some(mut record) = self.records.get_mut(pubkey) else {
            return IdentityStatus::Unknown;
        };
        record.failures = record.failures.saturating_add(1);
        if record.failures >= self.policy.max_consecutive_failures {
            record.state = RecordState::Abandoned;
            return IdentityStatus::Abandoned;
        }
        let wait = self.backoff.delay(record.failures).as_secs();
        record.state = RecordState::Failed {
            retry_at: now.saturating_add(wait),
        };
        IdentityStatus::Failed
    }

    pub(crate) fn record_blocked(&self, pubkey: &str) {
        if let Some(mut record) = self.records.get_mut(pubkey) {
            record.state = RecordState::Blocked;
        }
    }

    /// Records that need a check at `now`.
    pub(crate) fn due(&self, now: u64) -> Vec<(Pubkey, Nip05)> {
        let refresh = self.policy.update_frequency.as_secs();
        self.records
            .iter()
            .filter(|entry| match entry.state {
                RecordState::Unverified => true,
                RecordState::Verified { at } => now.saturating_sub(at) >= refresh,
                RecordState::Failed { retry_at } => retry_at <= now,
                RecordState::Abandoned | RecordState::Blocked => false,
            })
            .map(|entry| (entry.key().clone(), entry.claim.clone()))
            .collect()
    }
}

/// Resolves `name@domain` to the pubkey the domain vouches for.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Returns the pubkey listed for `name`, or `None` if the name is absent.
    async fn resolve(&self, claim: &Nip05) -> Result<Option<String>, ResolveError>;
}

/// Fetches `https://<domain>/.well-known/nostr.json?name=<name>`.
pub struct HttpResolver {
    http: reqwest::Client,
}

impl HttpResolver {
    /// Creates a resolver with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, ResolveError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("ostrichd/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl IdentityResolver for HttpResolver {
    async fn resolve(&self, claim: &Nip05) -> Result<Option<String>, ResolveError> {
        let url = format!(
            "https://{}/.well-known/nostr.json?name={}",
            claim.domain, claim.name
        );
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(ResolveError::BadResponse(format!(
                "status {}",
                response.status()
            )));
        }
        let body: serde_json::Value = response.json().await?;
        let names = body
            .get("names")
            .and_then(serde_json::Value::as_object)
            .ok_or_else(|| ResolveError::BadResponse("missing names".into()))?;
        Ok(names
            .get(&claim.name)
            .and_then(serde_json::Value::as_str)
            .map(str::to_ascii_lowercase))
    }
}

#[derive(Debug)]
enum VerifyRequest {
    Claim {
        pubkey: Pubkey,
        nip05: String,
        claimed_at: u64,
    },
    Lookup {
        pubkey: Pubkey,
    },
}

/// Cheap handle for feeding the verifier. Never blocks.
#[derive(Clone, Debug)]
pub struct VerifierHandle {
    tx: mpsc::Sender<VerifyRequest>,
}

impl VerifierHandle {
    /// Forwards the `nip05` claim of a durable metadata event.
    pub fn claim(&self, event: &Event) {
        if let Some(nip05) = event.metadata_nip05() {
            self.send(VerifyRequest::Claim {
                pubkey: event.pubkey.to_ascii_lowercase(),
                nip05,
                claimed_at: event.created_at,
            });
        }
    }

    /// Asks the verifier to look up the latest claim of an unseen author.
    pub fn lookup(&self, pubkey: &str) {
        self.send(VerifyRequest::Lookup {
            pubkey: pubkey.to_ascii_lowercase(),
        });
    }

    fn send(&self, request: VerifyRequest) {
        if let Err(e) = self.tx.try_send(request) {
            debug!("identity request dropped: {}", e);
        }
    }
}

/// Background task that resolves identity claims into the [`IdentityTable`].
pub struct IdentityVerifier {
    table: Arc<IdentityTable>,
    resolver: Arc<dyn IdentityResolver>,
    store: Arc<dyn EventStore>,
    looked_up: LruCache<Pubkey, ()>,
}

impl IdentityVerifier {
    /// Spawns the verifier. It runs until `shutdown` changes or every
    /// [`VerifierHandle`] is dropped.
    pub fn spawn(
        table: Arc<IdentityTable>,
        resolver: Arc<dyn IdentityResolver>,
        store: Arc<dyn EventStore>,
        shutdown: watch::Receiver<bool>,
    ) -> (VerifierHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
        let cap = NonZeroUsize::new(LOOKUP_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        let verifier = Self {
            table,
            resolver,
            store,
            looked_up: LruCache::new(cap),
        };
        let handle = tokio::spawn(verifier.run(rx, shutdown));
        (VerifierHandle { tx }, handle)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<VerifyRequest>, mut shutdown: watch::Receiver<bool>) {
        let period = self
            .table
            .policy()
            .update_frequency
            .clamp(Duration::from_secs(1), Duration::from_secs(60));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(mode = ?self.table.policy().mode, "identity verifier started");

        loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
                _ = tick.tick() => self.sweep(unix_now()).await,
                _ = shutdown.changed() => break,
            }
        }
        info!("identity verifier stopped");
    }

    async fn handle(&mut self, request: VerifyRequest) {
        match request {
            VerifyRequest::Claim {
                pubkey,
                nip05,
                claimed_at,
            } => self.claim(&pubkey, &nip05, claimed_at).await,
            VerifyRequest::Lookup { pubkey } => {
                if self.table.contains(&pubkey) || self.looked_up.put(pubkey.clone(), ()).is_some() {
                    return;
                }
                match self.store.latest_metadata(&pubkey).await {
                    Ok(Some(event)) => {
                        if let Some(nip05) = event.metadata_nip05() {
                            self.claim(&pubkey, &nip05, event.created_at).await;
                        }
                    }
                    Ok(None) => debug!(pubkey = %pubkey, "no metadata on file"),
                    Err(e) => warn!(pubkey = %pubkey, "metadata lookup failed: {}", e),
                }
            }
        }
    }

    async fn claim(&self, pubkey: &str, raw: &str, claimed_at: u64) {
        let Some(claim) = Nip05::parse(raw) else {
            debug!(pubkey = %pubkey, nip05 = %raw, "unparseable nip05");
            return;
        };
        let domain_allowed = self.table.policy().domain_allowed(&claim.domain);
        if !self.table.record_claim(pubkey, claim.clone(), claimed_at) {
            return;
        }
        if !domain_allowed {
            self.table.record_blocked(pubkey);
            counters::identity_checks_total("blocked");
            debug!(pubkey = %pubkey, domain = %claim.domain, "identity domain not allowed");
            return;
        }
        self.check(pubkey, &claim, unix_now()).await;
    }

    async fn sweep(&self, now: u64) {
        let due = self.table.due(now);
        if due.is_empty() {
            return;
        }
        debug!(count = due.len(), "re-checking identities");
        futures_util::stream::iter(due)
            .for_each_concurrent(CONCURRENT_CHECKS, |(pubkey, claim)| async move {
                self.check(&pubkey, &claim, now).await;
            })
            .await;
    }

    async fn check(&self, pubkey: &str, claim: &Nip05, now: u64) {
        match self.resolver.resolve(claim).await {
            Ok(Some(listed)) if listed.eq_ignore_ascii_case(pubkey) => {
                self.table.record_success(pubkey, now);
                counters::identity_checks_total("verified");
                debug!(pubkey = %pubkey, domain = %claim.domain, "identity verified");
            }
            outcome => {
                if let Err(e) = &outcome {
                    debug!(pubkey = %pubkey, domain = %claim.domain, "identity check failed: {}", e);
                }
                let status = self.table.record_failure(pubkey, now);
                counters::identity_checks_total(if status == IdentityStatus::Abandoned {
                    "abandoned"
                } else {
                    "failed"
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VerificationMode;
    use crate::storage::MemoryStore;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    fn policy() -> IdentityPolicy {
        IdentityPolicy {
            mode: VerificationMode::Enforcing,
            expiration: Duration::from_secs(1000),
            update_frequency: Duration::from_secs(100),
            max_consecutive_failures: 3,
            domain_whitelist: None,
            domain_blacklist: HashSet::new(),
        }
    }

    fn claim(s: &str) -> Nip05 {
        Nip05::parse(s).unwrap()
    }

    #[test]
    fn parse_nip05() {
        assert_eq!(
            Nip05::parse("Bob@Example.com"),
            Some(Nip05 {
                name: "bob".into(),
                domain: "example.com".into()
            })
        );
        assert_eq!(Nip05::parse("example.com").unwrap().name, "_");
        assert!(Nip05::parse("bob@localhost").is_none());
        assert!(Nip05::parse("bob@evil.com/path").is_none());
        assert!(Nip05::parse("b b@example.com").is_none());
        assert!(Nip05::parse("@example.com").is_none());
    }

    #[test]
    fn verified_expires_lazily() {
        let table = IdentityTable::new(policy());
        table.record_claim("pk", claim("bob@example.com"), 1);
        assert_eq!(table.status("pk", 0), IdentityStatus::Unverified);
        table.record_success("pk", 5000);
        assert!(table.is_verified("pk", 5000));
        assert!(table.is_verified("pk", 6000));
        assert_eq!(table.status("pk", 6001), IdentityStatus::Unverified);
    }

    #[test]
    fn unknown_pubkey() {
        let table = IdentityTable::new(policy());
        assert_eq!(table.status("nobody", 0), IdentityStatus::Unknown);
        assert!(!table.contains("nobody"));
    }

    #[test]
    fn failures_back_off_then_abandon() {
        let table = IdentityTable::new(policy());
        table.record_claim("pk", claim("bob@example.com"), 1);
        assert_eq!(table.record_failure("pk", 1000), IdentityStatus::Failed);
        // never sooner than the update frequency
        assert!(table.due(1099).is_empty());
        assert_eq!(table.record_failure("pk", 2000), IdentityStatus::Failed);
        assert!(table.due(2199).is_empty());
        assert_eq!(table.record_failure("pk", 3000), IdentityStatus::Abandoned);
        assert!(table.due(u64::MAX).is_empty());
        assert_eq!(table.failures("pk"), 3);

        table.reset("pk");
        assert_eq!(table.status("pk", 0), IdentityStatus::Unverified);
        assert_eq!(table.due(0).len(), 1);
    }

    #[test]
    fn newer_claim_resets_abandoned() {
        let table = IdentityTable::new(policy());
        table.record_claim("pk", claim("bob@example.com"), 10);
        for _ in 0..3 {
            table.record_failure("pk", 0);
        }
        assert_eq!(table.status("pk", 0), IdentityStatus::Abandoned);
        assert!(!table.record_claim("pk", claim("bob@example.com"), 10));
        assert!(table.record_claim("pk", claim("bob@example.com"), 11));
        assert_eq!(table.status("pk", 0), IdentityStatus::Unverified);
    }

    #[test]
    fn verified_is_rechecked_after_update_frequency() {
        let table = IdentityTable::new(policy());
        table.record_claim("pk", claim("bob@example.com"), 1);
        table.record_success("pk", 1000);
        assert!(table.due(1099).is_empty());
        assert_eq!(table.due(1100).len(), 1);
    }

    struct StaticResolver {
        names: HashMap<String, String>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl IdentityResolver for StaticResolver {
        async fn resolve(&self, claim: &Nip05) -> Result<Option<String>, ResolveError> {
            self.calls.lock().unwrap().push(claim.domain.clone());
            if claim.domain == "down.example" {
                return Err(ResolveError::BadResponse("status 503".into()));
            }
            Ok(self.names.get(&format!("{}@{}", claim.name, claim.domain)).cloned())
        }
    }

    fn metadata(pubkey: &str, nip05: &str, created_at: u64) -> Event {
        Event {
            id: "0".repeat(64),
            pubkey: pubkey.to_string(),
            created_at,
            kind: 0,
            tags: vec![],
            content: format!(r#"{{"nip05":"{nip05}"}}"#),
            sig: "0".repeat(128),
        }
    }

    async fn wait_for(table: &IdentityTable, pubkey: &str, status: IdentityStatus) {
        for _ in 0..100 {
            if table.status(pubkey, unix_now()) == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{pubkey} never reached {status:?}");
    }

    #[tokio::test]
    async fn verifier_resolves_claims() {
        let good = "a".repeat(64);
        let bad = "b".repeat(64);
        let flaky = "c".repeat(64);
        let resolver = Arc::new(StaticResolver {
            names: [("bob@example.com".to_string(), good.clone())].into_iter().collect(),
            calls: Mutex::new(Vec::new()),
        });
        let table = Arc::new(IdentityTable::new(policy()));
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (handle, _task) = IdentityVerifier::spawn(
            table.clone(),
            resolver.clone(),
            Arc::new(MemoryStore::new()),
            stop_rx,
        );

        handle.claim(&metadata(&good, "bob@example.com", 1));
        handle.claim(&metadata(&bad, "mallory@example.com", 1));
        handle.claim(&metadata(&flaky, "carol@down.example", 1));

        wait_for(&table, &good, IdentityStatus::Verified).await;
        wait_for(&table, &bad, IdentityStatus::Failed).await;
        wait_for(&table, &flaky, IdentityStatus::Failed).await;
    }

    #[tokio::test]
    async fn blacklisted_domain_fails_without_request() {
        let mut p = policy();
        p.domain_blacklist.insert("spam.example".into());
        let resolver = Arc::new(StaticResolver {
            names: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        });
        let table = Arc::new(IdentityTable::new(p));
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (handle, _task) = IdentityVerifier::spawn(
            table.clone(),
            resolver.clone(),
            Arc::new(MemoryStore::new()),
            stop_rx,
        );
        let pk = "d".repeat(64);
        handle.claim(&metadata(&pk, "eve@spam.example", 1));
        wait_for(&table, &pk, IdentityStatus::Failed).await;
        assert!(resolver.calls.lock().unwrap().is_empty());
        assert!(table.due(u64::MAX).is_empty());
    }

    #[tokio::test]
    async fn lookup_reads_latest_metadata_from_store() {
        let pk = "e".repeat(64);
        let store = Arc::new(MemoryStore::new());
        store
            .write(&metadata(&pk, "frank@example.com", 5))
            .await
            .unwrap();
        let resolver = Arc::new(StaticResolver {
            names: [("frank@example.com".to_string(), pk.clone())].into_iter().collect(),
            calls: Mutex::new(Vec::new()),
        });
        let table = Arc::new(IdentityTable::new(policy()));
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (handle, _task) = IdentityVerifier::spawn(table.clone(), resolver, store, stop_rx);

        handle.lookup(&pk);
        wait_for(&table, &pk, IdentityStatus::Verified).await;
    }
}
