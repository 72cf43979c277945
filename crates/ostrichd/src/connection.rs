use crate::admission::{Candidate, ConnMeta, Decision};
use crate::auth::{new_challenge, verify_auth};
use crate::error::{AuthError, RelayError, SubmitError};
use crate::fanout::{self, DeliveryReceiver};
use crate::metrics::{counters, gauges, histograms};
use crate::queue::Ack;
use crate::ratelimit::RateLimiter;
use crate::registry::ConnId;
use crate::server::ServerState;
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesOrdered, SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use ostrich_common::crypto::{unix_now, validate_event};
use ostrich_common::types::reason_prefix;
use ostrich_common::{ClientMessage, Event, Filter, RelayMessage};
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::oneshot::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tokio_tungstenite::tungstenite::http::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;
type PendingAck = BoxFuture<'static, (String, Result<Ack, RecvError>)>;

const QUERY_OUTBOX: usize = 256;
const SUBSCRIPTION_JITTER_MS: u64 = 100;
/// Messages read while a REQ waits on the subscription limiter.
const BACKLOG_LIMIT: usize = 64;

/// Whether `event` may be delivered to a connection authenticated as `reader`.
///
/// With `private_delivery` on, private messages only go to their author or
/// first recipient, and never to an unauthenticated connection.
fn visible_to(event: &Event, reader: Option<&str>, private_delivery: bool) -> bool {
    if !private_delivery || !event.is_private() {
        return true;
    }
    reader.is_some_and(|pubkey| event.is_party(pubkey))
}

/// Client IP for a WebSocket upgrade.
///
/// `trusted_header` names a proxy header (`x-forwarded-for`, `x-real-ip`) to
/// read the client address from; its first entry wins. Without it, or when
/// the header is missing or unparsable, the peer address is used.
fn extract_client_ip(
    request: &Request<()>,
    peer_addr: &SocketAddr,
    trusted_header: Option<&str>,
) -> IpAddr {
    trusted_header
        .and_then(|name| request.headers().get(name))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok())
        .unwrap_or_else(|| peer_addr.ip())
}

fn header(request: &Request<()>, name: &str) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Registry handles of a connection's live subscriptions.
///
/// A delivery is only sent while its handle is still the current one for its
/// subscription id, so events queued before a CLOSE or a replacing REQ are
/// dropped.
#[derive(Debug, Default)]
struct LiveSubscriptions(HashMap<String, Arc<str>>);

impl LiveSubscriptions {
    fn insert(&mut self, sub_id: String, handle: Arc<str>) {
        self.0.insert(sub_id, handle);
    }

    fn remove(&mut self, sub_id: &str) {
        self.0.remove(sub_id);
    }

    fn is_current(&self, handle: &Arc<str>) -> bool {
        self.0
            .get(&**handle)
            .is_some_and(|current| Arc::ptr_eq(current, handle))
    }
}

struct IpGuard {
    state: Arc<ServerState>,
    ip: IpAddr,
}

impl Drop for IpGuard {
    fn drop(&mut self) {
        let mut remove = false;
        if let Some(mut entry) = self.state.ip_connections.get_mut(&self.ip) {
            *entry = entry.saturating_sub(1);
            if *entry == 0 {
                remove = true;
            }
        }
        if remove {
            self.state
                .ip_connections
                .remove_if(&self.ip, |_, v| *v == 0);
        }
    }
}

struct ActiveGuard {
    state: Arc<ServerState>,
    conn_id: ConnId,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.state.registry.disconnect(self.conn_id);
        self.state.active_connections.fetch_sub(1, Ordering::Relaxed);
        gauges::dec_connections_active();
    }
}

/// Per-connection protocol state.
struct Session {
    state: Arc<ServerState>,
    ws_tx: WsSink,
    ws_rx: WsRecv,
    backlog: VecDeque<String>,
    meta: Arc<ConnMeta>,
    challenge: Option<String>,
    sub_limiter: RateLimiter,
    queries: HashMap<String, JoinHandle<()>>,
    live: LiveSubscriptions,
    outbox_tx: mpsc::Sender<String>,
    outbox_rx: mpsc::Receiver<String>,
    pending: FuturesOrdered<PendingAck>,
    shutdown: watch::Receiver<()>,
}

impl Session {
    async fn send(&mut self, message: &RelayMessage) -> Result<(), RelayError> {
        self.ws_tx
            .send(Message::Text(message.to_json()))
            .await
            .map_err(RelayError::WebSocket)
    }

    async fn reply_ok(
        &mut self,
        event_id: &str,
        accepted: bool,
        prefix: &str,
        detail: &str,
    ) -> Result<(), RelayError> {
        self.send(&RelayMessage::ok(event_id, accepted, prefix, detail))
            .await
    }

    async fn on_text(&mut self, text: &str) -> Result<(), RelayError> {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                counters::commands_total("malformed");
                debug!(cid = self.meta.conn_id, "malformed message: {}", e);
                return self
                    .send(&RelayMessage::Notice(format!("{}: {e}", reason_prefix::INVALID)))
                    .await;
            }
        };
        counters::commands_total(message.command());

        match message {
            ClientMessage::Event(event) => self.on_event(Arc::from(event), text.len()).await,
            ClientMessage::Req { sub_id, filters } => self.on_req(sub_id, filters).await,
            ClientMessage::Close { sub_id } => {
                self.on_close(&sub_id);
                Ok(())
            }
            ClientMessage::Auth(event) => self.on_auth(&event).await,
        }
    }

    async fn on_event(&mut self, event: Arc<Event>, raw_len: usize) -> Result<(), RelayError> {
        if let Err(e) = validate_event(&event) {
            return self
                .reply_ok(&event.id, false, reason_prefix::INVALID, &e.to_string())
                .await;
        }

        let candidate = Candidate {
            event: Arc::clone(&event),
            raw_len,
            meta: Arc::clone(&self.meta),
        };
        if let Decision::Reject(rejection) = self.state.chain.admit(&candidate, unix_now()).await {
            return self
                .reply_ok(&event.id, false, rejection.reason.prefix(), &rejection.message)
                .await;
        }

        match self.state.queue.submit(self.meta.conn_id, Arc::clone(&event)).await {
            Ok(ack) => {
                let id = event.id.clone();
                self.pending.push_back(async move { (id, ack.await) }.boxed());
                Ok(())
            }
            Err(SubmitError::Backpressure) => {
                self.reply_ok(&event.id, false, reason_prefix::ERROR, "relay is busy, try again later")
                    .await
            }
            Err(SubmitError::Closed) => {
                self.reply_ok(&event.id, false, reason_prefix::ERROR, "relay is shutting down")
                    .await
            }
        }
    }

    async fn on_ack(&mut self, event_id: &str, ack: Result<Ack, RecvError>) -> Result<(), RelayError> {
        match ack {
            Ok(Ack::Stored | Ack::Ephemeral) => self.reply_ok(event_id, true, "", "").await,
            Ok(Ack::Duplicate) => {
                self.reply_ok(event_id, true, reason_prefix::DUPLICATE, "already have this event")
                    .await
            }
            Ok(Ack::Failed(reason)) => {
                self.reply_ok(event_id, false, reason_prefix::ERROR, &reason)
                    .await
            }
            Err(_) => {
                self.reply_ok(event_id, false, reason_prefix::ERROR, "write was abandoned")
                    .await
            }
        }
    }

    /// Waits out the subscription limiter, with jitter.
    ///
    /// The socket is still read during the wait: a disconnect cancels the
    /// pending REQ, and text messages are held in the backlog (up to
    /// [`BACKLOG_LIMIT`]) to be handled once the wait is over.
    async fn throttle_subscriptions(&mut self) -> Result<(), RelayError> {
        while let Err(wait) = self.sub_limiter.check_and_record() {
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..SUBSCRIPTION_JITTER_MS));
            debug!(cid = self.meta.conn_id, ?wait, "subscription rate limited");
            let sleep = tokio::time::sleep(wait + jitter);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    () = &mut sleep => break,
                    _ = self.shutdown.changed() => return Err(RelayError::ConnectionClosed),
                    msg = self.ws_rx.next(), if self.backlog.len() < BACKLOG_LIMIT => match msg {
                        Some(Ok(Message::Text(text))) => self.backlog.push_back(text),
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = self.ws_tx.send(Message::Pong(data)).await {
                                debug!("failed to send pong: {}", e);
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(cid = self.meta.conn_id, "closed while a subscription was waiting");
                            return Err(RelayError::ConnectionClosed);
                        }
                        Some(Err(e)) => return Err(RelayError::WebSocket(e)),
                        Some(Ok(_)) => {}
                    },
                }
            }
        }
        Ok(())
    }

    async fn on_req(&mut self, sub_id: String, filters: Vec<Filter>) -> Result<(), RelayError> {
        self.throttle_subscriptions().await?;

        if self.state.config.limit_scrapers && filters.iter().any(Filter::is_broad) {
            debug!(cid = self.meta.conn_id, sub = %sub_id, "broad subscription answered with EOSE");
            self.on_close(&sub_id);
            return self.send(&RelayMessage::Eose { sub_id }).await;
        }

        let handle = match self
            .state
            .registry
            .register(self.meta.conn_id, &sub_id, filters.clone())
        {
            Ok(handle) => handle,
            Err(e) => {
                return self
                    .send(&RelayMessage::Closed {
                        sub_id,
                        message: format!("{}: {e}", reason_prefix::ERROR),
                    })
                    .await;
            }
        };
        self.live.insert(sub_id.clone(), handle);

        if let Some(previous) = self.queries.remove(&sub_id) {
            previous.abort();
        }
        let task = spawn_query(
            Arc::clone(&self.state),
            sub_id.clone(),
            filters,
            self.meta.auth_pubkey.clone(),
            self.outbox_tx.clone(),
        );
        self.queries.insert(sub_id, task);
        Ok(())
    }

    fn on_close(&mut self, sub_id: &str) {
        if let Some(query) = self.queries.remove(sub_id) {
            query.abort();
        }
        self.live.remove(sub_id);
        self.state.registry.unregister(self.meta.conn_id, sub_id);
    }

    async fn on_auth(&mut self, event: &Event) -> Result<(), RelayError> {
        let result = match &self.challenge {
            Some(challenge) => verify_auth(
                event,
                challenge,
                self.state.config.relay_url.as_deref(),
                unix_now(),
            ),
            None => Err(AuthError::Disabled),
        };
        match result {
            Ok(pubkey) => {
                debug!(cid = self.meta.conn_id, pubkey = %pubkey, "client authenticated");
                let mut meta = (*self.meta).clone();
                meta.auth_pubkey = Some(pubkey);
                self.meta = Arc::new(meta);
                self.reply_ok(&event.id, true, "", "").await
            }
            Err(e) => {
                self.reply_ok(&event.id, false, reason_prefix::RESTRICTED, &e.to_string())
                    .await
            }
        }
    }

    async fn on_delivery(
        &mut self,
        deliveries: &DeliveryReceiver,
        delivery: fanout::Delivery,
    ) -> Result<(), RelayError> {
        let gap = deliveries.take_gap();
        if gap > 0 {
            self.send(&RelayMessage::Notice(format!(
                "{gap} events were not delivered because this connection is reading too slowly"
            )))
            .await?;
        }
        // closed or replaced after this delivery was queued
        if !self.live.is_current(&delivery.sub_id) {
            return Ok(());
        }
        let private_delivery = self.state.config.nip42_dms;
        if !visible_to(&delivery.event, self.meta.auth_pubkey.as_deref(), private_delivery) {
            return Ok(());
        }
        self.send(&RelayMessage::Event {
            sub_id: delivery.sub_id.to_string(),
            event: delivery.event,
        })
        .await
    }

    fn abort_queries(&mut self) {
        for (_, query) in self.queries.drain() {
            query.abort();
        }
    }
}

/// Answers the stored-events part of a REQ, then EOSE.
fn spawn_query(
    state: Arc<ServerState>,
    sub_id: String,
    filters: Vec<Filter>,
    reader: Option<String>,
    outbox: mpsc::Sender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = Instant::now();
        let cap = state.config.query_limit;
        let private_delivery = state.config.nip42_dms;
        let mut sent = HashSet::new();
        for filter in &filters {
            let limit = filter.limit.map_or(cap, |l| l.min(cap));
            if limit == 0 {
                continue;
            }
            let events = match state.store.query(filter, limit).await {
                Ok(events) => events,
                Err(e) => {
                    warn!(sub = %sub_id, "query failed: {}", e);
                    let closed = RelayMessage::Closed {
                        sub_id,
                        message: format!("{}: query failed", reason_prefix::ERROR),
                    };
                    let _ = outbox.send(closed.to_json()).await;
                    return;
                }
            };
            for event in events {
                if !visible_to(&event, reader.as_deref(), private_delivery) {
                    continue;
                }
                if !sent.insert(event.id.clone()) {
                    continue;
                }
                let message = RelayMessage::Event {
                    sub_id: sub_id.clone(),
                    event: Arc::new(event),
                };
                if outbox.send(message.to_json()).await.is_err() {
                    return;
                }
            }
        }
        histograms::query_latency_seconds(start.elapsed().as_secs_f64());
        let _ = outbox.send(RelayMessage::Eose { sub_id }.to_json()).await;
    })
}

/// Drive the select loop for one connection until it closes.
async fn run_message_loop(
    session: &mut Session,
    deliveries: &mut DeliveryReceiver,
) -> Result<(), RelayError> {
    let mut ping_interval = interval(Duration::from_secs(session.state.config.ping_interval));
    let idle_timeout = Duration::from_secs(session.state.config.idle_timeout);
    let mut last_activity = Instant::now();
    let close = deliveries.close_signal();

    loop {
        if let Some(text) = session.backlog.pop_front() {
            session.on_text(&text).await?;
            continue;
        }
        tokio::select! {
            msg = session.ws_rx.next() => {
                last_activity = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => session.on_text(&text).await?,
                    Some(Ok(Message::Binary(_))) => {
                        session
                            .send(&RelayMessage::Notice(format!(
                                "{}: binary messages are not supported",
                                reason_prefix::INVALID
                            )))
                            .await?;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = session.ws_tx.send(Message::Pong(data)).await {
                            debug!("failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(RelayError::WebSocket(e)),
                    _ => {}
                }
            }
            Some((event_id, ack)) = session.pending.next(), if !session.pending.is_empty() => {
                session.on_ack(&event_id, ack).await?;
            }
            delivery = deliveries.recv() => {
                match delivery {
                    Some(delivery) => session.on_delivery(deliveries, delivery).await?,
                    None => return Ok(()),
                }
            }
            Some(text) = session.outbox_rx.recv() => {
                session.ws_tx.send(Message::Text(text)).await.map_err(RelayError::WebSocket)?;
            }
            _ = close.notified() => {
                debug!(cid = session.meta.conn_id, "closing slow connection");
                let _ = session
                    .send(&RelayMessage::Notice("closing: connection is reading too slowly".into()))
                    .await;
                return Ok(());
            }
            _ = ping_interval.tick() => {
                if last_activity.elapsed() >= idle_timeout {
                    debug!("idle timeout reached, closing connection");
                    return Ok(());
                }
                if let Err(e) = session.ws_tx.send(Message::Ping(vec![])).await {
                    debug!("failed to send ping: {}", e);
                }
            }
            _ = session.shutdown.changed() => {
                // writers outlive the accept loop, so queued events still get their OK
                while let Some((event_id, ack)) = session.pending.next().await {
                    session.on_ack(&event_id, ack).await?;
                }
                let _ = session.ws_tx.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
}

/// Serve one client from WebSocket upgrade to close.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: watch::Receiver<()>,
) -> Result<(), RelayError> {
    // bounds connections still in the upgrade handshake
    let permit = state.pre_auth_semaphore.acquire().await.map_err(|_| {
        debug!("pre-auth semaphore closed");
        RelayError::ConnectionClosed
    })?;

    let ws_config = WebSocketConfig {
        max_message_size: Some(state.config.max_message_bytes),
        max_frame_size: Some(state.config.max_message_bytes),
        ..WebSocketConfig::default()
    };

    let client_ip = Arc::new(OnceLock::new());
    let origin = Arc::new(OnceLock::new());
    let user_agent = Arc::new(OnceLock::new());
    let (ip_cell, origin_cell, ua_cell) = (client_ip.clone(), origin.clone(), user_agent.clone());
    let trusted_header = state.config.remote_ip_header.clone();
    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        move |req: &Request<()>, resp: Response<()>| {
            let _ = ip_cell.set(extract_client_ip(req, &peer_addr, trusted_header.as_deref()));
            if let Some(o) = header(req, "origin") {
                let _ = origin_cell.set(o);
            }
            if let Some(ua) = header(req, "user-agent") {
                let _ = ua_cell.set(ua);
            }
            Ok(resp)
        },
        Some(ws_config),
    )
    .await
    .map_err(RelayError::WebSocket)?;
    drop(permit);

    let client_ip = client_ip.get().copied().unwrap_or_else(|| peer_addr.ip());

    let mut should_reject = false;
    match state.ip_connections.entry(client_ip) {
        dashmap::mapref::entry::Entry::Occupied(mut entry) => {
            if *entry.get() >= state.config.max_conns_ip {
                should_reject = true;
            } else {
                *entry.get_mut() += 1;
            }
        }
        dashmap::mapref::entry::Entry::Vacant(entry) => {
            entry.insert(1);
        }
    }
    if should_reject {
        debug!(ip = %client_ip, limit = state.config.max_conns_ip, "per-IP connection limit exceeded");
        return Err(RelayError::ConnectionClosed);
    }
    let _ip_guard = IpGuard {
        state: state.clone(),
        ip: client_ip,
    };

    let conn_id = state.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let (queue, mut deliveries) = fanout::channel(state.config.delivery_queue);
    state.registry.connect(conn_id, queue);
    state.active_connections.fetch_add(1, Ordering::Relaxed);
    gauges::inc_connections_active();
    let _active = ActiveGuard {
        state: state.clone(),
        conn_id,
    };
    debug!(cid = conn_id, ip = %client_ip, "connection opened");

    let (ws_tx, ws_rx) = ws_stream.split();
    let (outbox_tx, outbox_rx) = mpsc::channel(QUERY_OUTBOX);
    let mut session = Session {
        state: state.clone(),
        ws_tx,
        ws_rx,
        backlog: VecDeque::new(),
        meta: Arc::new(ConnMeta {
            conn_id,
            ip: client_ip,
            origin: origin.get().cloned(),
            user_agent: user_agent.get().cloned(),
            auth_pubkey: None,
        }),
        challenge: state.config.nip42_auth.then(new_challenge),
        sub_limiter: RateLimiter::new(state.config.subscriptions_per_min),
        queries: HashMap::new(),
        live: LiveSubscriptions::default(),
        outbox_tx,
        outbox_rx,
        pending: FuturesOrdered::new(),
        shutdown,
    };

    if let Some(challenge) = session.challenge.clone() {
        session.send(&RelayMessage::Auth { challenge }).await?;
    }

    let result = run_message_loop(&mut session, &mut deliveries).await;

    session.abort_queries();
    let discarded = deliveries.drain();
    debug!(cid = conn_id, discarded, "connection closed");
    result
}
