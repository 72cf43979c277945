use crate::admission::AdmissionChain;
use crate::config::{ServerConfig, VerificationMode};
use crate::connection::handle_connection;
use crate::error::RelayError;
use crate::external::AdmissionService;
use crate::fanout::BroadcastFanout;
use crate::gates::{standard_chain, GateDeps};
use crate::identity::{IdentityResolver, IdentityTable, IdentityVerifier};
use crate::metrics::HealthState;
use crate::payment::{PaymentLedger, PaymentProcessor};
use crate::queue::{PersistenceQueue, QueueConfig, WriterContext};
use crate::registry::SubscriptionRegistry;
use crate::signup::SignupDesk;
use crate::storage::EventStore;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

/// Maximum number of connections still in the WebSocket handshake.
const MAX_PRE_AUTH_CONNECTIONS: usize = 1000;

/// Shared state for the relay server.
pub struct ServerState {
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Live subscriptions.
    pub registry: Arc<SubscriptionRegistry>,
    /// Delivery of durable events to subscriptions.
    pub fanout: Arc<BroadcastFanout>,
    /// Ordered admission gates.
    pub chain: AdmissionChain,
    /// Hand-off to the writer workers.
    pub queue: PersistenceQueue,
    /// Storage, used here for historical queries.
    pub store: Arc<dyn EventStore>,
    /// NIP-05 identity records.
    pub identity: Arc<IdentityTable>,
    /// Pay-to-relay balances.
    pub ledger: Arc<PaymentLedger>,
    /// Sign-up and top-up invoices, when pay-to-relay has a processor.
    pub signups: Option<Arc<SignupDesk>>,
    /// Readiness reported on `/ready`.
    pub health: HealthState,
    /// Per-IP connection counter for enforcing connection limits.
    pub ip_connections: DashMap<IpAddr, usize>,
    /// Active WebSocket connections.
    pub active_connections: AtomicUsize,
    /// Semaphore bounding connections still in the handshake.
    pub pre_auth_semaphore: Semaphore,
    /// Source of connection ids.
    pub next_conn_id: AtomicU64,
    fatal: watch::Receiver<bool>,
}

/// External collaborators the relay is built around.
#[derive(Default)]
pub struct Collaborators {
    /// NIP-05 resolver. Without one, no identity is ever verified.
    pub resolver: Option<Arc<dyn IdentityResolver>>,
    /// Remote admission predicate, if configured.
    pub admission_service: Option<Arc<dyn AdmissionService>>,
    /// Lightning backend for pay-to-relay sign-ups and top-ups.
    pub payment_processor: Option<Arc<dyn PaymentProcessor>>,
    /// Readiness shared with the metrics endpoint.
    pub health: HealthState,
}

/// Background tasks started alongside the server state.
pub struct Background {
    /// Writer workers. They exit once the state is dropped.
    pub writers: Vec<JoinHandle<()>>,
    /// Identity verifier, when verification is enabled.
    pub verifier: Option<JoinHandle<()>>,
    stop: watch::Sender<bool>,
}

impl Background {
    /// Stops the identity verifier and waits for it.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Some(verifier) = self.verifier {
            let _ = verifier.await;
        }
    }
}

impl ServerState {
    /// Wires the pipeline together and starts its background tasks.
    pub fn build(
        config: ServerConfig,
        store: Arc<dyn EventStore>,
        collaborators: Collaborators,
    ) -> (Arc<Self>, Background) {
        let policy = Arc::new(config.policy.clone());
        let registry = Arc::new(SubscriptionRegistry::new(
            config.max_subscriptions,
            config.max_filters,
        ));
        let fanout = Arc::new(BroadcastFanout::new(
            Arc::clone(&registry),
            config.max_delivery_drops,
        ));
        let identity = Arc::new(IdentityTable::new(policy.identity.clone()));
        let ledger = Arc::new(PaymentLedger::new(policy.payment.clone()));
        let signups = match collaborators.payment_processor {
            Some(processor) if policy.payment.enabled => Some(Arc::new(SignupDesk::new(
                policy.payment.clone(),
                Arc::clone(&ledger),
                processor,
            ))),
            _ => None,
        };
        if policy.payment.enabled && signups.is_none() {
            warn!("pay-to-relay enabled without a payment processor; nobody can sign up");
        }
        let health = collaborators.health;
        let (stop, stop_rx) = watch::channel(false);

        let (verifier, verifier_task) = match (policy.identity.mode, collaborators.resolver) {
            (VerificationMode::Disabled, _) | (_, None) => (None, None),
            (_, Some(resolver)) => {
                let (handle, task) = IdentityVerifier::spawn(
                    Arc::clone(&identity),
                    resolver,
                    Arc::clone(&store),
                    stop_rx,
                );
                (Some(handle), Some(task))
            }
        };

        let (fatal_tx, fatal) = watch::channel(false);
        let (queue, writers) = PersistenceQueue::spawn(
            QueueConfig {
                capacity: config.persist_buffer,
                workers: config.writer_workers,
                deadline: Duration::from_millis(config.persist_deadline_ms),
            },
            Arc::new(WriterContext {
                store: Arc::clone(&store),
                fanout: Arc::clone(&fanout),
                verifier: verifier.clone(),
                health: health.clone(),
                fatal: fatal_tx,
            }),
        );

        let service = collaborators
            .admission_service
            .map(|s| (s, Duration::from_millis(config.admission_timeout_ms)));
        let chain = standard_chain(
            policy,
            GateDeps {
                identity: Arc::clone(&identity),
                verifier,
                ledger: Arc::clone(&ledger),
                service,
            },
        );
        info!(gates = ?chain.gate_names(), "admission chain ready");

        let state = Arc::new(Self {
            config,
            registry,
            fanout,
            chain,
            queue,
            store,
            identity,
            ledger,
            signups,
            health,
            ip_connections: DashMap::new(),
            active_connections: AtomicUsize::new(0),
            pre_auth_semaphore: Semaphore::new(MAX_PRE_AUTH_CONNECTIONS),
            next_conn_id: AtomicU64::new(1),
            fatal,
        });
        (
            state,
            Background {
                writers,
                verifier: verifier_task,
                stop,
            },
        )
    }

    /// Whether storage has become unavailable.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        *self.fatal.borrow()
    }
}

/// # Errors
///
/// Returns an error if the listener fails or storage becomes unavailable.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), RelayError> {
    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    run_with_shutdown(listener, state, shutdown_rx).await
}

/// Run the server accept loop with an externally-controlled shutdown signal.
///
/// When the sender behind `shutdown_rx` sends or is dropped, the accept loop
/// stops, open connections are told to close, and the loop waits up to 30
/// seconds for them to finish.
///
/// # Errors
///
/// Returns [`RelayError::StorageUnavailable`] if the writers report that
/// storage can no longer be used, or an I/O error from the listener.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown_rx: watch::Receiver<()>,
) -> Result<(), RelayError> {
    let local_addr = listener.local_addr().map_err(RelayError::Io)?;
    info!("relay listening on {}", local_addr);
    let (close_tx, _) = watch::channel(());
    let mut fatal = state.fatal.clone();
    let mut tasks = JoinSet::new();
    let mut outcome = Ok(());

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        if state.active_connections.load(Ordering::Relaxed) >= state.config.max_conns {
                            warn!("max connections reached, rejecting {}", addr);
                            drop(stream);
                            continue;
                        }
                        let state = Arc::clone(&state);
                        let shutdown = close_tx.subscribe();
                        tasks.spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, state, shutdown).await {
                                tracing::debug!("connection from {} closed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            changed = fatal.changed() => {
                if changed.is_ok() && !*fatal.borrow() {
                    continue;
                }
                error!("storage unavailable, shutting down");
                outcome = Err(RelayError::StorageUnavailable(
                    "writer reported an unrecoverable storage error".into(),
                ));
                break;
            }
            _ = shutdown_rx.changed() => {
                info!("shutdown signal received, draining {} connections", tasks.len());
                break;
            }
        }
    }

    close_tx.send_replace(());

    let drain_timeout = Duration::from_secs(30);
    let deadline = tokio::time::Instant::now() + drain_timeout;
    while !tasks.is_empty() {
        if tokio::time::timeout_at(deadline, tasks.join_next())
            .await
            .is_err()
        {
            warn!(
                "drain timeout reached with {} connections still active",
                tasks.len()
            );
            tasks.abort_all();
            break;
        }
    }

    info!("server shut down");
    outcome
}
