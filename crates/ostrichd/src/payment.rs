use crate::config::{PaymentPolicy, ProcessorConfig};
use crate::error::ProcessorError;
use async_trait::async_trait;
use dashmap::DashMap;
use lru::LruCache;
use ostrich_common::types::Pubkey;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

const CHARGED_CACHE_SIZE: usize = 65_536;

/// Why an author cannot be charged.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PaymentError {
    /// No admission payment on file.
    #[error("admission fee not paid")]
    NotAdmitted,
    /// The balance is below the event cost.
    #[error("balance {balance} is below cost {cost}")]
    InsufficientBalance {
        /// Current balance.
        balance: u64,
        /// Required amount.
        cost: u64,
    },
}

#[derive(Debug, Default, Clone, Copy)]
struct Account {
    admitted: bool,
    balance: u64,
}

/// Per-author admission status and balance.
///
/// Credits come from the payment processor; debits come from the admission
/// chain's payment gate. Debits are keyed by event id so that re-submitting
/// the same event after a timeout does not charge twice.
pub struct PaymentLedger {
    policy: PaymentPolicy,
    accounts: DashMap<Pubkey, Account>,
    charged: Mutex<LruCache<String, ()>>,
}

impl PaymentLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new(policy: PaymentPolicy) -> Self {
        let cap = NonZeroUsize::new(CHARGED_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            policy,
            accounts: DashMap::new(),
            charged: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Records a sign-up payment of `amount`.
    ///
    /// Returns `false` (and records nothing) if `amount` is below the admission
    /// cost. Any excess is credited to the balance.
    pub fn pay_admission(&self, pubkey: &str, amount: u64) -> bool {
        if amount < self.policy.admission_cost {
            return false;
        }
        let mut account = self.accounts.entry(pubkey.to_ascii_lowercase()).or_default();
        if !account.admitted {
            account.admitted = true;
            account.balance = account
                .balance
                .saturating_add(amount - self.policy.admission_cost);
            info!(pubkey = %pubkey, "author admitted");
        } else {
            account.balance = account.balance.saturating_add(amount);
        }
        true
    }

    /// Adds `amount` to an author's balance.
    pub fn credit(&self, pubkey: &str, amount: u64) {
        let mut account = self.accounts.entry(pubkey.to_ascii_lowercase()).or_default();
        account.balance = account.balance.saturating_add(amount);
    }

    /// Whether `pubkey` has paid the admission fee.
    #[must_use]
    pub fn is_admitted(&self, pubkey: &str) -> bool {
        self.accounts
            .get(&pubkey.to_ascii_lowercase())
            .is_some_and(|a| a.admitted)
    }

    /// Current balance, or `None` for an unknown author.
    #[must_use]
    pub fn balance(&self, pubkey: &str) -> Option<u64> {
        self.accounts
            .get(&pubkey.to_ascii_lowercase())
            .map(|a| a.balance)
    }

    /// Checks, without charging, whether `pubkey` can publish an event.
    ///
    /// # Errors
    ///
    /// Returns [`PaymentError`] if the author is not admitted or is short.
    pub fn check(&self, pubkey: &str) -> Result<(), PaymentError> {
        let account = self
            .accounts
            .get(&pubkey.to_ascii_lowercase())
            .map(|a| *a)
            .unwrap_or_default();
        if !account.admitted {
            return Err(PaymentError::NotAdmitted);
        }
        let cost = self.policy.cost_per_event;
        if account.balance < cost {
            return Err(PaymentError::InsufficientBalance {
                balance: account.balance,
                cost,
            });
        }
        Ok(())
    }

    fn already_charged(&self, event_id: &str) -> bool {
        self.charged
            .lock()
            .map(|mut c| c.get(event_id).is_some())
            .unwrap_or(false)
    }

    /// Charges the per-event cost for `event_id`. Charging the same event
    /// twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`PaymentError`] if the balance cannot cover the cost.
    pub fn debit(&self, pubkey: &str, event_id: &str) -> Result<(), PaymentError> {
        let cost = self.policy.cost_per_event;
        if cost == 0 || self.already_charged(event_id) {
            return Ok(());
        }
        {
            let mut account = self
                .accounts
                .get_mut(&pubkey.to_ascii_lowercase())
                .ok_or(PaymentError::NotAdmitted)?;
            if !account.admitted {
                return Err(PaymentError::NotAdmitted);
            }
            if account.balance < cost {
                return Err(PaymentError::InsufficientBalance {
                    balance: account.balance,
                    cost,
                });
            }
            account.balance -= cost;
        }
        if let Ok(mut charged) = self.charged.lock() {
            charged.put(event_id.to_string(), ());
        }
        Ok(())
    }
}

/// A Lightning invoice waiting to be paid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invoice {
    /// Processor-side identifier, echoed back by the paid-invoice callback.
    pub payment_hash: String,
    /// BOLT11 payment request shown to the payer.
    pub bolt11: String,
    /// Amount in sats.
    pub amount: u64,
}

/// Lightning backend that issues and settles invoices.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Issues an invoice for `amount` sats.
    async fn create_invoice(&self, amount: u64, memo: &str) -> Result<Invoice, ProcessorError>;

    /// Whether the invoice identified by `payment_hash` has been paid.
    async fn is_paid(&self, payment_hash: &str) -> Result<bool, ProcessorError>;
}

#[derive(Serialize)]
struct CreateInvoiceRequest<'a> {
    out: bool,
    amount: u64,
    memo: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    webhook: Option<&'a str>,
}

#[derive(Deserialize)]
struct CreatedInvoice {
    payment_hash: String,
    #[serde(alias = "bolt11")]
    payment_request: String,
}

#[derive(Deserialize)]
struct PaymentStatus {
    paid: bool,
}

/// LNbits wallet API client.
///
/// Invoices are created with `POST /api/v1/payments` and checked with
/// `GET /api/v1/payments/<hash>`, both authenticated by the invoice key.
pub struct LnbitsProcessor {
    http: Client,
    url: String,
    api_key: String,
    webhook_url: Option<String>,
}

impl LnbitsProcessor {
    /// Creates a client for the configured LNbits wallet.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is not http(s) or the client cannot be built.
    pub fn new(config: &ProcessorConfig, timeout: Duration) -> anyhow::Result<Self> {
        let parsed = config.url.parse::<reqwest::Url>()?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            anyhow::bail!("LNbits URL scheme must be http or https, got: {}", parsed.scheme());
        }
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            webhook_url: config.webhook_url.clone(),
        })
    }
}

#[async_trait]
impl PaymentProcessor for LnbitsProcessor {
    async fn create_invoice(&self, amount: u64, memo: &str) -> Result<Invoice, ProcessorError> {
        let created = self
            .http
            .post(format!("{}/api/v1/payments", self.url))
            .header("X-Api-Key", &self.api_key)
            .json(&CreateInvoiceRequest {
                out: false,
                amount,
                memo,
                webhook: self.webhook_url.as_deref(),
            })
            .send()
            .await?
            .error_for_status()?
            .json::<CreatedInvoice>()
            .await?;
        if created.payment_hash.is_empty() {
            return Err(ProcessorError::BadResponse("empty payment hash".into()));
        }
        Ok(Invoice {
            payment_hash: created.payment_hash,
            bolt11: created.payment_request,
            amount,
        })
    }

    async fn is_paid(&self, payment_hash: &str) -> Result<bool, ProcessorError> {
        if !payment_hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ProcessorError::BadResponse("payment hash is not hex".into()));
        }
        let status = self
            .http
            .get(format!("{}/api/v1/payments/{payment_hash}", self.url))
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json::<PaymentStatus>()
            .await?;
        Ok(status.paid)
    }
}
