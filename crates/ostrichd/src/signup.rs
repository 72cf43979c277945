//! Pay-to-relay sign-up: invoice issuance and the paid-invoice callback.
//!
//! A client asks `GET /invoice?pubkey=<hex>` for an admission invoice (or,
//! once admitted, `&amount=<sats>` for a top-up). The processor later calls
//! `POST /lnbits` with the payment hash; the relay confirms the payment with
//! the processor before touching the ledger, so a forged callback credits
//! nothing. Each invoice settles at most once.

use crate::config::PaymentPolicy;
use crate::error::SignupError;
use crate::payment::{Invoice, PaymentLedger, PaymentProcessor};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use ostrich_common::types::{Pubkey, HEX_ID_LEN};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    Admission,
    TopUp,
}

#[derive(Debug, Clone)]
struct Pending {
    pubkey: Pubkey,
    amount: u64,
    purpose: Purpose,
}

/// Answer to an invoice request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvoiceReply {
    /// Pay this invoice.
    Invoice(Invoice),
    /// Nothing to pay: the author is admitted.
    Admitted {
        /// Current balance.
        balance: u64,
    },
}

/// Account state reported by `/account`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccountStatus {
    /// Whether the admission fee is paid.
    pub admitted: bool,
    /// Current balance.
    pub balance: u64,
}

/// Issues sign-up and top-up invoices and settles them into the ledger.
pub struct SignupDesk {
    policy: PaymentPolicy,
    ledger: Arc<PaymentLedger>,
    processor: Arc<dyn PaymentProcessor>,
    pending: DashMap<String, Pending>,
}

fn normalize_pubkey(pubkey: &str) -> Result<Pubkey, SignupError> {
    if pubkey.len() != HEX_ID_LEN || !pubkey.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(SignupError::InvalidPubkey);
    }
    Ok(pubkey.to_ascii_lowercase())
}

impl SignupDesk {
    /// Creates a desk crediting `ledger` through `processor`.
    #[must_use]
    pub fn new(
        policy: PaymentPolicy,
        ledger: Arc<PaymentLedger>,
        processor: Arc<dyn PaymentProcessor>,
    ) -> Self {
        Self {
            policy,
            ledger,
            processor,
            pending: DashMap::new(),
        }
    }

    /// Issues an admission invoice for a new author, or a top-up invoice of
    /// `top_up` sats for an admitted one.
    ///
    /// A zero admission cost admits the author on the spot.
    ///
    /// # Errors
    ///
    /// Returns [`SignupError`] for a bad pubkey or amount, closed sign-ups, or
    /// a processor failure.
    pub async fn request_invoice(
        &self,
        pubkey: &str,
        top_up: Option<u64>,
    ) -> Result<InvoiceReply, SignupError> {
        let pubkey = normalize_pubkey(pubkey)?;
        let (amount, purpose) = if self.ledger.is_admitted(&pubkey) {
            match top_up {
                None => {
                    return Ok(InvoiceReply::Admitted {
                        balance: self.ledger.balance(&pubkey).unwrap_or(0),
                    })
                }
                Some(0) => return Err(SignupError::InvalidAmount),
                Some(amount) => (amount, Purpose::TopUp),
            }
        } else {
            if !self.policy.sign_ups {
                return Err(SignupError::SignupsClosed);
            }
            if self.policy.admission_cost == 0 {
                self.ledger.pay_admission(&pubkey, 0);
                return Ok(InvoiceReply::Admitted { balance: 0 });
            }
            (self.policy.admission_cost, Purpose::Admission)
        };

        let memo = match purpose {
            Purpose::Admission => format!("relay admission for {pubkey}"),
            Purpose::TopUp => format!("relay balance for {pubkey}"),
        };
        let invoice = self.processor.create_invoice(amount, &memo).await?;
        debug!(pubkey = %pubkey, hash = %invoice.payment_hash, amount, "invoice issued");
        self.pending.insert(
            invoice.payment_hash.clone(),
            Pending {
                pubkey,
                amount,
                purpose,
            },
        );
        Ok(InvoiceReply::Invoice(invoice))
    }

    /// Settles a paid invoice into the ledger.
    ///
    /// # Errors
    ///
    /// [`SignupError::UnknownInvoice`] if the hash is not outstanding (or was
    /// already settled); [`SignupError::NotPaid`] if the processor has not
    /// seen the payment.
    pub async fn settle(&self, payment_hash: &str) -> Result<AccountStatus, SignupError> {
        if !self.pending.contains_key(payment_hash) {
            return Err(SignupError::UnknownInvoice);
        }
        if !self.processor.is_paid(payment_hash).await? {
            return Err(SignupError::NotPaid);
        }
        // a concurrent callback for the same hash may have settled it meanwhile
        let (_, pending) = self
            .pending
            .remove(payment_hash)
            .ok_or(SignupError::UnknownInvoice)?;
        match pending.purpose {
            Purpose::Admission => {
                self.ledger.pay_admission(&pending.pubkey, pending.amount);
            }
            Purpose::TopUp => self.ledger.credit(&pending.pubkey, pending.amount),
        }
        info!(pubkey = %pending.pubkey, amount = pending.amount, "invoice settled");
        Ok(self.account(&pending.pubkey))
    }

    /// Admission state and balance of `pubkey`.
    #[must_use]
    pub fn account(&self, pubkey: &str) -> AccountStatus {
        AccountStatus {
            admitted: self.ledger.is_admitted(pubkey),
            balance: self.ledger.balance(pubkey).unwrap_or(0),
        }
    }

    /// Invoices issued but not yet settled.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for SignupError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::InvalidPubkey | Self::InvalidAmount => StatusCode::BAD_REQUEST,
            Self::SignupsClosed => StatusCode::FORBIDDEN,
            Self::UnknownInvoice => StatusCode::NOT_FOUND,
            Self::NotPaid => StatusCode::PAYMENT_REQUIRED,
            Self::Processor(e) => {
                warn!("payment processor error: {}", e);
                StatusCode::BAD_GATEWAY
            }
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

#[derive(Deserialize)]
struct InvoiceParams {
    pubkey: String,
    amount: Option<u64>,
}

#[derive(Deserialize)]
struct AccountParams {
    pubkey: String,
}

/// Body of the processor's paid-invoice callback.
#[derive(Deserialize)]
struct PaidCallback {
    payment_hash: String,
}

async fn invoice_handler(
    State(desk): State<Arc<SignupDesk>>,
    Query(params): Query<InvoiceParams>,
) -> Result<Json<InvoiceReply>, SignupError> {
    desk.request_invoice(&params.pubkey, params.amount)
        .await
        .map(Json)
}

async fn callback_handler(
    State(desk): State<Arc<SignupDesk>>,
    Json(callback): Json<PaidCallback>,
) -> Result<Json<AccountStatus>, SignupError> {
    desk.settle(&callback.payment_hash).await.map(Json)
}

async fn account_handler(
    State(desk): State<Arc<SignupDesk>>,
    Query(params): Query<AccountParams>,
) -> Result<Json<AccountStatus>, SignupError> {
    let pubkey = normalize_pubkey(&params.pubkey)?;
    Ok(Json(desk.account(&pubkey)))
}

/// `/invoice`, `/lnbits` and `/account`, served next to the metrics endpoints.
pub fn routes(desk: Arc<SignupDesk>) -> Router {
    Router::new()
        .route("/invoice", get(invoice_handler))
        .route("/lnbits", post(callback_handler))
        .route("/account", get(account_handler))
        .with_state(desk)
}
