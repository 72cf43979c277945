use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

/// CLI arguments for the relay daemon.
#[derive(Parser, Debug, Clone)]
#[command(name = "ostrichd")]
#[command(about = "Nostr relay daemon")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:7777", env = "OSTRICH_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics and health endpoints.
    #[arg(long, default_value = "127.0.0.1:9090", env = "OSTRICH_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Header carrying the client IP when running behind a trusted proxy.
    #[arg(long, env = "OSTRICH_REMOTE_IP_HEADER")]
    pub remote_ip_header: Option<String>,
    /// Public WebSocket URL of this relay, checked against NIP-42 `relay` tags.
    #[arg(long, env = "OSTRICH_RELAY_URL")]
    pub relay_url: Option<String>,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "10000", env = "OSTRICH_MAX_CONNS")]
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    #[arg(long, default_value = "32", env = "OSTRICH_MAX_CONNS_IP")]
    pub max_conns_ip: usize,
    /// Interval between WebSocket pings in seconds.
    #[arg(long, default_value = "30", env = "OSTRICH_PING_INTERVAL")]
    pub ping_interval: u64,
    /// Connection idle timeout in seconds.
    #[arg(long, default_value = "300", env = "OSTRICH_IDLE_TIMEOUT")]
    pub idle_timeout: u64,

    /// Maximum serialized size of an EVENT message in bytes.
    #[arg(long, default_value = "131072", env = "OSTRICH_MAX_EVENT_BYTES")]
    pub max_event_bytes: usize,
    /// Maximum size of any WebSocket message in bytes.
    #[arg(long, default_value = "524288", env = "OSTRICH_MAX_MESSAGE_BYTES")]
    pub max_message_bytes: usize,
    /// Reject events dated more than this many seconds in the future.
    #[arg(long, default_value = "900", env = "OSTRICH_REJECT_FUTURE_SECONDS")]
    pub reject_future_seconds: u64,
    /// Relay-wide event admissions per second. 0 = unlimited.
    #[arg(long, default_value = "0", env = "OSTRICH_MESSAGES_PER_SEC")]
    pub messages_per_sec: u32,
    /// Subscriptions a connection may create per minute. 0 = unlimited.
    #[arg(long, default_value = "0", env = "OSTRICH_SUBSCRIPTIONS_PER_MIN")]
    pub subscriptions_per_min: u32,
    /// Maximum open subscriptions per connection.
    #[arg(long, default_value = "32", env = "OSTRICH_MAX_SUBSCRIPTIONS")]
    pub max_subscriptions: usize,
    /// Maximum filters in a single REQ.
    #[arg(long, default_value = "10", env = "OSTRICH_MAX_FILTERS")]
    pub max_filters: usize,
    /// Capacity of each connection's delivery queue, in events.
    #[arg(long, default_value = "4096", env = "OSTRICH_DELIVERY_QUEUE")]
    pub delivery_queue: usize,
    /// Close a connection after this many dropped deliveries. 0 = never.
    #[arg(long, default_value = "0", env = "OSTRICH_MAX_DELIVERY_DROPS")]
    pub max_delivery_drops: u64,
    /// Upper bound on stored events returned per filter.
    #[arg(long, default_value = "500", env = "OSTRICH_QUERY_LIMIT")]
    pub query_limit: u64,

    /// SQLite database path or URL, or `memory` for a non-durable store.
    #[arg(long, default_value = "ostrich.db", env = "OSTRICH_DATABASE")]
    pub database: String,
    /// Connections in the read-only query pool.
    #[arg(long, default_value = "8", env = "OSTRICH_READER_POOL_SIZE")]
    pub reader_pool_size: u32,
    /// Capacity of the persistence queue, in events.
    #[arg(long, default_value = "4096", env = "OSTRICH_PERSIST_BUFFER")]
    pub persist_buffer: usize,
    /// How long a connection waits for persistence queue space, in milliseconds.
    #[arg(long, default_value = "5000", env = "OSTRICH_PERSIST_DEADLINE_MS")]
    pub persist_deadline_ms: u64,
    /// Number of writer workers. Events are sharded by connection.
    #[arg(long, default_value = "1", env = "OSTRICH_WRITER_WORKERS")]
    pub writer_workers: usize,

    /// Only these kinds are accepted (empty = all).
    #[arg(long, value_delimiter = ',', env = "OSTRICH_KIND_ALLOWLIST")]
    pub kind_allowlist: Vec<u16>,
    /// These kinds are always rejected.
    #[arg(long, value_delimiter = ',', env = "OSTRICH_KIND_DENYLIST")]
    pub kind_denylist: Vec<u16>,
    /// Only these authors may publish (empty = anyone).
    #[arg(long, value_delimiter = ',', env = "OSTRICH_PUBKEY_WHITELIST")]
    pub pubkey_whitelist: Vec<String>,
    /// Send NIP-42 AUTH challenges and accept AUTH responses.
    #[arg(long, env = "OSTRICH_NIP42_AUTH")]
    pub nip42_auth: bool,
    /// Deliver private messages only to an authenticated author or recipient.
    #[arg(long, env = "OSTRICH_NIP42_DMS")]
    pub nip42_dms: bool,
    /// Answer crawler-style REQs (too few constraints) with an immediate EOSE.
    #[arg(long, env = "OSTRICH_LIMIT_SCRAPERS")]
    pub limit_scrapers: bool,

    /// NIP-05 identity verification mode.
    #[arg(long, value_enum, default_value = "disabled", env = "OSTRICH_VERIFICATION_MODE")]
    pub verification_mode: VerificationMode,
    /// Seconds a successful verification stays valid.
    #[arg(long, default_value = "604800", env = "OSTRICH_VERIFY_EXPIRATION")]
    pub verify_expiration: u64,
    /// Minimum seconds between verification attempts for one author.
    #[arg(long, default_value = "86400", env = "OSTRICH_VERIFY_UPDATE_FREQUENCY")]
    pub verify_update_frequency: u64,
    /// Consecutive failures before an identity is abandoned.
    #[arg(long, default_value = "20", env = "OSTRICH_MAX_CONSECUTIVE_FAILURES")]
    pub max_consecutive_failures: u32,
    /// Only identities on these domains can verify (empty = any).
    #[arg(long, value_delimiter = ',', env = "OSTRICH_DOMAIN_WHITELIST")]
    pub domain_whitelist: Vec<String>,
    /// Identities on these domains never verify.
    #[arg(long, value_delimiter = ',', env = "OSTRICH_DOMAIN_BLACKLIST")]
    pub domain_blacklist: Vec<String>,

    /// Require authors to pay before publishing.
    #[arg(long, env = "OSTRICH_PAY_TO_RELAY")]
    pub pay_to_relay: bool,
    /// One-time sign-up cost.
    #[arg(long, default_value = "0", env = "OSTRICH_ADMISSION_COST")]
    pub admission_cost: u64,
    /// Cost debited per accepted event.
    #[arg(long, default_value = "0", env = "OSTRICH_COST_PER_EVENT")]
    pub cost_per_event: u64,
    /// Accept new sign-ups on the invoice endpoint.
    #[arg(long, default_value = "true", action = clap::ArgAction::Set, env = "OSTRICH_SIGN_UPS")]
    pub sign_ups: bool,
    /// Base URL of the LNbits instance issuing invoices.
    #[arg(long, env = "OSTRICH_LNBITS_URL")]
    pub lnbits_url: Option<String>,
    /// LNbits invoice key.
    #[arg(long, env = "OSTRICH_LNBITS_API_KEY", hide_env_values = true)]
    pub lnbits_api_key: Option<String>,
    /// Public URL LNbits calls when an invoice is paid (the relay's `/lnbits`).
    #[arg(long, env = "OSTRICH_PAYMENT_WEBHOOK_URL")]
    pub payment_webhook_url: Option<String>,

    /// URL of an external admission service.
    #[arg(long, env = "OSTRICH_ADMISSION_URL")]
    pub admission_url: Option<String>,
    /// Timeout for the external admission service, in milliseconds.
    #[arg(long, default_value = "500", env = "OSTRICH_ADMISSION_TIMEOUT_MS")]
    pub admission_timeout_ms: u64,
    /// Advertise that the admission service may restrict writes.
    #[arg(long, env = "OSTRICH_ADMISSION_RESTRICTS_WRITE")]
    pub admission_restricts_write: bool,
}

/// How the identity gate treats unverified authors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationMode {
    /// No verification is performed.
    Disabled,
    /// Authors are verified and failures logged, but never rejected.
    Passive,
    /// Unverified authors are rejected.
    Enforcing,
}

/// Identity verification settings.
#[derive(Debug, Clone)]
pub struct IdentityPolicy {
    /// Gate mode.
    pub mode: VerificationMode,
    /// How long a verification stays valid.
    pub expiration: Duration,
    /// Minimum interval between attempts for one author.
    pub update_frequency: Duration,
    /// Failures before a record is abandoned.
    pub max_consecutive_failures: u32,
    /// If set, only these domains can verify.
    pub domain_whitelist: Option<HashSet<String>>,
    /// Domains that never verify.
    pub domain_blacklist: HashSet<String>,
}

impl IdentityPolicy {
    /// Returns `true` if `domain` may be checked at all.
    #[must_use]
    pub fn domain_allowed(&self, domain: &str) -> bool {
        if self.domain_blacklist.contains(domain) {
            return false;
        }
        self.domain_whitelist
            .as_ref()
            .map_or(true, |allowed| allowed.contains(domain))
    }
}

/// Pay-to-relay settings.
#[derive(Debug, Clone)]
pub struct PaymentPolicy {
    /// Whether the payment gate is active.
    pub enabled: bool,
    /// One-time sign-up cost.
    pub admission_cost: u64,
    /// Cost per accepted event.
    pub cost_per_event: u64,
    /// Whether new authors may request a sign-up invoice.
    pub sign_ups: bool,
}

impl Default for PaymentPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            admission_cost: 0,
            cost_per_event: 0,
            sign_ups: true,
        }
    }
}

/// Connection to the Lightning payment processor.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// LNbits base URL.
    pub url: String,
    /// LNbits invoice key.
    pub api_key: String,
    /// Callback URL handed to LNbits with each invoice.
    pub webhook_url: Option<String>,
}

/// Immutable admission policy snapshot, shared by every gate.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Maximum serialized EVENT message size.
    pub max_event_bytes: usize,
    /// Future timestamp tolerance in seconds.
    pub reject_future_seconds: u64,
    /// Relay-wide events per second. 0 = unlimited.
    pub messages_per_sec: u32,
    /// If set, only these kinds are accepted.
    pub kind_allowlist: Option<HashSet<u16>>,
    /// Kinds that are always rejected.
    pub kind_denylist: HashSet<u16>,
    /// If set, only these authors may publish.
    pub pubkey_whitelist: Option<HashSet<String>>,
    /// Identity verification.
    pub identity: IdentityPolicy,
    /// Pay-to-relay.
    pub payment: PaymentPolicy,
    /// Whether the external admission service may deny writes.
    pub admission_restricts_write: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_event_bytes: 131_072,
            reject_future_seconds: 900,
            messages_per_sec: 0,
            kind_allowlist: None,
            kind_denylist: HashSet::new(),
            pubkey_whitelist: None,
            identity: IdentityPolicy {
                mode: VerificationMode::Disabled,
                expiration: Duration::from_secs(604_800),
                update_frequency: Duration::from_secs(86_400),
                max_consecutive_failures: 20,
                domain_whitelist: None,
                domain_blacklist: HashSet::new(),
            },
            payment: PaymentPolicy::default(),
            admission_restricts_write: false,
        }
    }
}

/// Write restrictions a client can discover before publishing.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Limitation {
    /// Maximum EVENT message size.
    pub max_message_length: usize,
    /// Maximum subscriptions per connection.
    pub max_subscriptions: usize,
    /// Maximum filters per REQ.
    pub max_filters: usize,
    /// Whether NIP-42 auth is offered.
    pub auth_required: bool,
    /// Whether publishing requires payment.
    pub payment_required: bool,
    /// Whether some well-formed events may be refused for policy reasons.
    pub restricted_writes: bool,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: SocketAddr,
    /// Trusted client-IP header, if behind a proxy.
    pub remote_ip_header: Option<String>,
    /// Public relay URL for NIP-42.
    pub relay_url: Option<String>,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    pub max_conns_ip: usize,
    /// Interval between WebSocket pings in seconds.
    pub ping_interval: u64,
    /// Connection idle timeout in seconds.
    pub idle_timeout: u64,
    /// Maximum WebSocket message size.
    pub max_message_bytes: usize,
    /// Subscriptions per minute per connection. 0 = unlimited.
    pub subscriptions_per_min: u32,
    /// Maximum open subscriptions per connection.
    pub max_subscriptions: usize,
    /// Maximum filters per REQ.
    pub max_filters: usize,
    /// Delivery queue capacity per connection.
    pub delivery_queue: usize,
    /// Dropped deliveries before a connection is closed. 0 = never.
    pub max_delivery_drops: u64,
    /// Upper bound on stored events per filter.
    pub query_limit: u64,
    /// Database location or `memory`.
    pub database: String,
    /// Reader pool size.
    pub reader_pool_size: u32,
    /// Persistence queue capacity.
    pub persist_buffer: usize,
    /// Enqueue deadline in milliseconds.
    pub persist_deadline_ms: u64,
    /// Number of writer workers.
    pub writer_workers: usize,
    /// Whether NIP-42 auth is enabled.
    pub nip42_auth: bool,
    /// Restrict private-message delivery to authenticated parties.
    pub nip42_dms: bool,
    /// Answer broad REQs with an immediate EOSE.
    pub limit_scrapers: bool,
    /// Payment processor, when pay-to-relay is backed by LNbits.
    pub processor: Option<ProcessorConfig>,
    /// External admission service URL.
    pub admission_url: Option<String>,
    /// External admission service timeout in milliseconds.
    pub admission_timeout_ms: u64,
    /// Admission policy snapshot.
    pub policy: Policy,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }
        if self.max_conns_ip == 0 {
            return Err("max_conns_ip must be greater than 0".to_string());
        }
        if self.max_conns_ip > self.max_conns {
            return Err("max_conns_ip cannot exceed max_conns".to_string());
        }

        if self.ping_interval == 0 || self.ping_interval > 3600 {
            return Err("ping_interval must be between 1 and 3600 seconds".to_string());
        }
        if self.idle_timeout < self.ping_interval {
            return Err("idle_timeout cannot be shorter than ping_interval".to_string());
        }

        if self.policy.max_event_bytes == 0 {
            return Err("max_event_bytes must be greater than 0".to_string());
        }
        if self.max_message_bytes < self.policy.max_event_bytes {
            return Err("max_message_bytes cannot be smaller than max_event_bytes".to_string());
        }
        if self.max_subscriptions == 0 {
            return Err("max_subscriptions must be greater than 0".to_string());
        }
        if self.max_filters == 0 {
            return Err("max_filters must be greater than 0".to_string());
        }
        if self.delivery_queue == 0 {
            return Err("delivery_queue must be greater than 0".to_string());
        }
        if self.query_limit == 0 {
            return Err("query_limit must be greater than 0".to_string());
        }

        if self.persist_buffer == 0 {
            return Err("persist_buffer must be greater than 0".to_string());
        }
        if self.persist_deadline_ms == 0 {
            return Err("persist_deadline_ms must be greater than 0".to_string());
        }
        if self.writer_workers == 0 || self.writer_workers > 64 {
            return Err("writer_workers must be between 1 and 64".to_string());
        }
        if self.reader_pool_size == 0 {
            return Err("reader_pool_size must be greater than 0".to_string());
        }

        if let Some(allow) = &self.policy.kind_allowlist {
            if let Some(kind) = allow.iter().find(|k| self.policy.kind_denylist.contains(k)) {
                return Err(format!("kind {kind} is in both kind_allowlist and kind_denylist"));
            }
        }
        if let Some(whitelist) = &self.policy.pubkey_whitelist {
            if let Some(bad) = whitelist
                .iter()
                .find(|pk| pk.len() != 64 || !pk.bytes().all(|b| b.is_ascii_hexdigit()))
            {
                return Err(format!("pubkey_whitelist entry is not a hex pubkey: {bad}"));
            }
        }

        let identity = &self.policy.identity;
        if identity.mode != VerificationMode::Disabled {
            if identity.update_frequency.is_zero() {
                return Err("verify_update_frequency must be greater than 0".to_string());
            }
            if identity.expiration < identity.update_frequency {
                return Err("verify_expiration cannot be shorter than verify_update_frequency".to_string());
            }
            if identity.max_consecutive_failures == 0 {
                return Err("max_consecutive_failures must be greater than 0".to_string());
            }
        }

        if self.nip42_dms && !self.nip42_auth {
            return Err("nip42_dms requires nip42_auth".to_string());
        }
        if self.policy.payment.enabled && self.processor.is_none() {
            return Err("pay_to_relay requires lnbits_url and lnbits_api_key".to_string());
        }

        if self.admission_url.is_some()
            && (self.admission_timeout_ms == 0 || self.admission_timeout_ms > 30_000)
        {
            return Err("admission_timeout_ms must be between 1 and 30000".to_string());
        }
        Ok(())
    }

    /// Write restrictions implied by this configuration.
    #[must_use]
    pub fn limitation(&self) -> Limitation {
        let policy = &self.policy;
        Limitation {
            max_message_length: policy.max_event_bytes,
            max_subscriptions: self.max_subscriptions,
            max_filters: self.max_filters,
            auth_required: self.nip42_auth,
            payment_required: policy.payment.enabled,
            restricted_writes: policy.admission_restricts_write
                || policy.pubkey_whitelist.is_some()
                || policy.payment.enabled
                || policy.identity.mode == VerificationMode::Enforcing,
        }
    }
}

fn non_empty<T: std::hash::Hash + Eq>(items: Vec<T>) -> Option<HashSet<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items.into_iter().collect())
    }
}

fn lowercase_set(items: Vec<String>) -> Vec<String> {
    items.into_iter().map(|s| s.trim().to_ascii_lowercase()).collect()
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        let policy = Policy {
            max_event_bytes: args.max_event_bytes,
            reject_future_seconds: args.reject_future_seconds,
            messages_per_sec: args.messages_per_sec,
            kind_allowlist: non_empty(args.kind_allowlist),
            kind_denylist: args.kind_denylist.into_iter().collect(),
            pubkey_whitelist: non_empty(lowercase_set(args.pubkey_whitelist)),
            identity: IdentityPolicy {
                mode: args.verification_mode,
                expiration: Duration::from_secs(args.verify_expiration),
                update_frequency: Duration::from_secs(args.verify_update_frequency),
                max_consecutive_failures: args.max_consecutive_failures,
                domain_whitelist: non_empty(lowercase_set(args.domain_whitelist)),
                domain_blacklist: lowercase_set(args.domain_blacklist).into_iter().collect(),
            },
            payment: PaymentPolicy {
                enabled: args.pay_to_relay,
                admission_cost: args.admission_cost,
                cost_per_event: args.cost_per_event,
                sign_ups: args.sign_ups,
            },
            admission_restricts_write: args.admission_restricts_write,
        };
        let processor = match (args.lnbits_url, args.lnbits_api_key) {
            (Some(url), Some(api_key)) => Some(ProcessorConfig {
                url,
                api_key,
                webhook_url: args.payment_webhook_url,
            }),
            _ => None,
        };
        Self {
            listen: args.listen,
            metrics_addr: args.metrics_addr,
            remote_ip_header: args.remote_ip_header.map(|h| h.to_ascii_lowercase()),
            relay_url: args.relay_url,
            max_conns: args.max_conns,
            max_conns_ip: args.max_conns_ip,
            ping_interval: args.ping_interval,
            idle_timeout: args.idle_timeout,
            max_message_bytes: args.max_message_bytes,
            subscriptions_per_min: args.subscriptions_per_min,
            max_subscriptions: args.max_subscriptions,
            max_filters: args.max_filters,
            delivery_queue: args.delivery_queue,
            max_delivery_drops: args.max_delivery_drops,
            query_limit: args.query_limit,
            database: args.database,
            reader_pool_size: args.reader_pool_size,
            persist_buffer: args.persist_buffer,
            persist_deadline_ms: args.persist_deadline_ms,
            writer_workers: args.writer_workers,
            nip42_auth: args.nip42_auth,
            nip42_dms: args.nip42_dms,
            limit_scrapers: args.limit_scrapers,
            processor,
            admission_url: args.admission_url,
            admission_timeout_ms: args.admission_timeout_ms,
            policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ServerConfig {
        ServerConfig::from(Args::parse_from(["ostrichd"]))
    }

    #[test]
    fn defaults_are_valid() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn lists_parse_comma_delimited() {
        let config = ServerConfig::from(Args::parse_from([
            "ostrichd",
            "--kind-denylist",
            "1984,4",
            "--domain-blacklist",
            "Spam.Example",
        ]));
        assert!(config.policy.kind_denylist.contains(&1984));
        assert!(config.policy.kind_denylist.contains(&4));
        assert!(config.policy.kind_allowlist.is_none());
        assert!(config.policy.identity.domain_blacklist.contains("spam.example"));
    }

    #[test]
    fn verification_mode_parses() {
        let config = ServerConfig::from(Args::parse_from([
            "ostrichd",
            "--verification-mode",
            "enforcing",
        ]));
        assert_eq!(config.policy.identity.mode, VerificationMode::Enforcing);
    }

    #[test]
    fn max_conns_zero() {
        let mut c = valid_config();
        c.max_conns = 0;
        assert!(c.validate().unwrap_err().contains("max_conns"));
    }

    #[test]
    fn max_conns_ip_exceeds_max_conns() {
        let mut c = valid_config();
        c.max_conns_ip = c.max_conns + 1;
        assert!(c.validate().unwrap_err().contains("max_conns_ip"));
    }

    #[test]
    fn idle_shorter_than_ping() {
        let mut c = valid_config();
        c.idle_timeout = 10;
        c.ping_interval = 30;
        assert!(c.validate().unwrap_err().contains("idle_timeout"));
    }

    #[test]
    fn message_smaller_than_event() {
        let mut c = valid_config();
        c.max_message_bytes = c.policy.max_event_bytes - 1;
        assert!(c.validate().unwrap_err().contains("max_message_bytes"));
    }

    #[test]
    fn writer_workers_bounds() {
        let mut c = valid_config();
        c.writer_workers = 0;
        assert!(c.validate().unwrap_err().contains("writer_workers"));
        c.writer_workers = 65;
        assert!(c.validate().unwrap_err().contains("writer_workers"));
    }

    #[test]
    fn persist_buffer_zero() {
        let mut c = valid_config();
        c.persist_buffer = 0;
        assert!(c.validate().unwrap_err().contains("persist_buffer"));
    }

    #[test]
    fn kind_in_both_lists() {
        let mut c = valid_config();
        c.policy.kind_allowlist = Some([1, 7].into_iter().collect());
        c.policy.kind_denylist.insert(7);
        assert!(c.validate().unwrap_err().contains("kind 7"));
    }

    #[test]
    fn whitelist_entry_must_be_hex() {
        let mut c = valid_config();
        c.policy.pubkey_whitelist = Some(["npub1xyz".to_string()].into_iter().collect());
        assert!(c.validate().unwrap_err().contains("pubkey_whitelist"));
    }

    #[test]
    fn identity_expiration_shorter_than_frequency() {
        let mut c = valid_config();
        c.policy.identity.mode = VerificationMode::Passive;
        c.policy.identity.expiration = Duration::from_secs(10);
        c.policy.identity.update_frequency = Duration::from_secs(60);
        assert!(c.validate().unwrap_err().contains("verify_expiration"));
    }

    #[test]
    fn identity_settings_ignored_when_disabled() {
        let mut c = valid_config();
        c.policy.identity.update_frequency = Duration::ZERO;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn admission_timeout_bounds() {
        let mut c = valid_config();
        c.admission_url = Some("http://127.0.0.1:1/admit".into());
        c.admission_timeout_ms = 0;
        assert!(c.validate().unwrap_err().contains("admission_timeout_ms"));
    }

    #[test]
    fn private_delivery_needs_auth() {
        let mut c = valid_config();
        c.nip42_dms = true;
        assert!(c.validate().unwrap_err().contains("nip42_dms"));
        c.nip42_auth = true;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn pay_to_relay_needs_a_processor() {
        let c = ServerConfig::from(Args::parse_from(["ostrichd", "--pay-to-relay"]));
        assert!(c.validate().unwrap_err().contains("lnbits_url"));

        let c = ServerConfig::from(Args::parse_from([
            "ostrichd",
            "--pay-to-relay",
            "--lnbits-url",
            "https://lnbits.example",
            "--lnbits-api-key",
            "key",
        ]));
        assert!(c.validate().is_ok());
        assert!(c.policy.payment.sign_ups);
        assert_eq!(c.processor.unwrap().url, "https://lnbits.example");
    }

    #[test]
    fn limitation_reflects_restrictions() {
        let mut c = valid_config();
        assert!(!c.limitation().restricted_writes);
        c.policy.admission_restricts_write = true;
        assert!(c.limitation().restricted_writes);
    }

    #[test]
    fn domain_allowed_checks_both_lists() {
        let mut identity = Policy::default().identity;
        identity.domain_blacklist.insert("bad.example".into());
        assert!(identity.domain_allowed("good.example"));
        assert!(!identity.domain_allowed("bad.example"));
        identity.domain_whitelist = Some(["only.example".to_string()].into_iter().collect());
        assert!(!identity.domain_allowed("good.example"));
        assert!(identity.domain_allowed("only.example"));
    }
}
