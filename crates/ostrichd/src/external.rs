use crate::admission::ConnMeta;
use crate::error::ServiceError;
use async_trait::async_trait;
use ostrich_common::Event;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Verdict returned by an external admission service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Verdict {
    /// Whether the event may be stored.
    pub permit: bool,
    /// Optional reason shown to the client on denial.
    #[serde(default)]
    pub message: Option<String>,
}

/// A remote predicate consulted before an event is stored.
#[async_trait]
pub trait AdmissionService: Send + Sync {
    /// Asks whether `event`, received on the connection described by `meta`,
    /// may be stored.
    async fn check(&self, event: &Event, meta: &ConnMeta) -> Result<Verdict, ServiceError>;
}

#[derive(Serialize)]
struct CheckRequest<'a> {
    event: &'a Event,
    origin: Option<&'a str>,
    user_agent: Option<&'a str>,
    ip: String,
    auth_pubkey: Option<&'a str>,
}

/// JSON-over-HTTP admission service.
///
/// POSTs `{event, origin, user_agent, ip, auth_pubkey}` to the configured URL
/// and expects `{"permit": bool, "message": string?}`.
#[derive(Clone)]
pub struct HttpAdmissionService {
    http: Client,
    url: String,
}

/// Validates that the service URL has an http(s) scheme and a host.
fn validate_service_url(url: &str) -> anyhow::Result<()> {
    let parsed = url.parse::<reqwest::Url>()?;

    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        anyhow::bail!("admission URL scheme must be http or https, got: {}", scheme);
    }
    if parsed.host_str().is_none() {
        anyhow::bail!("admission URL must have a host");
    }
    Ok(())
}

impl HttpAdmissionService {
    /// Creates a client for `url`. `timeout` bounds each request at the HTTP
    /// layer; the gate applies its own deadline on top.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the client cannot be built.
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        validate_service_url(url)?;
        let http = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(2))
            .build()?;
        Ok(Self {
            http,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl AdmissionService for HttpAdmissionService {
    async fn check(&self, event: &Event, meta: &ConnMeta) -> Result<Verdict, ServiceError> {
        let body = CheckRequest {
            event,
            origin: meta.origin.as_deref(),
            user_agent: meta.user_agent.as_deref(),
            ip: meta.ip.to_string(),
            auth_pubkey: meta.auth_pubkey.as_deref(),
        };
        let verdict = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<Verdict>()
            .await?;
        Ok(verdict)
    }
}
