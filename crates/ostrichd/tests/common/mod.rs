#![allow(dead_code)]

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use ostrich_common::crypto::{keypair_from_secret, sign_event, unix_now};
use ostrich_common::{Event, Filter};
use ostrichd::config::{Args, ServerConfig};
use ostrichd::error::RelayError;
use ostrichd::server::{Background, Collaborators, ServerState};
use ostrichd::storage::{EventStore, MemoryStore};
use secp256k1::Keypair;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

pub fn test_config() -> ServerConfig {
    let mut config: ServerConfig = Args::parse_from(["ostrichd"]).into();
    config.listen = "127.0.0.1:0".parse().unwrap();
    config.metrics_addr = "127.0.0.1:0".parse().unwrap();
    config.database = "memory".into();
    config.max_conns_ip = 100;
    config
}

pub struct TestRelay {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
    pub server: JoinHandle<Result<(), RelayError>>,
    shutdown: watch::Sender<()>,
    background: Background,
}

impl TestRelay {
    pub async fn stop(self) -> Result<(), RelayError> {
        let _ = self.shutdown.send(());
        let result = self.server.await.unwrap();
        self.background.shutdown().await;
        result
    }
}

pub async fn start_relay(config: ServerConfig) -> (TestRelay, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let relay = start_relay_with(config, store.clone(), Collaborators::default()).await;
    (relay, store)
}

pub async fn start_relay_with(
    config: ServerConfig,
    store: Arc<dyn EventStore>,
    collaborators: Collaborators,
) -> TestRelay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (state, background) = ServerState::build(config, store, collaborators);

    let (shutdown, shutdown_rx) = watch::channel(());
    let server = tokio::spawn(ostrichd::run_with_shutdown(
        listener,
        state.clone(),
        shutdown_rx,
    ));

    tokio::time::sleep(Duration::from_millis(50)).await;

    TestRelay {
        addr,
        state,
        server,
        shutdown,
        background,
    }
}

pub fn keys(seed: u8) -> Keypair {
    keypair_from_secret(&[seed; 32]).unwrap()
}

pub fn note(keys: &Keypair, kind: u16, content: &str) -> Event {
    sign_event(keys, unix_now(), kind, vec![], content)
}

pub fn note_at(keys: &Keypair, created_at: u64, kind: u16, content: &str) -> Event {
    sign_event(keys, created_at, kind, vec![], content)
}

pub struct TestClient {
    pub ws_tx: futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        Message,
    >,
    pub ws_rx: futures_util::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    >,
}

impl TestClient {
    pub async fn connect(addr: &SocketAddr) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        let (ws_tx, ws_rx) = ws.split();
        Self { ws_tx, ws_rx }
    }

    pub async fn send_json(&mut self, value: Value) {
        self.ws_tx
            .send(Message::Text(value.to_string()))
            .await
            .unwrap();
    }

    pub async fn publish(&mut self, event: &Event) {
        self.send_json(json!(["EVENT", event])).await;
    }

    pub async fn req(&mut self, sub_id: &str, filters: Vec<Filter>) {
        let mut msg = vec![json!("REQ"), json!(sub_id)];
        msg.extend(filters.iter().map(|f| serde_json::to_value(f).unwrap()));
        self.send_json(Value::Array(msg)).await;
    }

    pub async fn close(&mut self, sub_id: &str) {
        self.send_json(json!(["CLOSE", sub_id])).await;
    }

    /// Next relay message, skipping control frames.
    pub async fn recv(&mut self) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws_rx.next())
                .await
                .expect("timeout waiting for message")
                .unwrap()
                .unwrap();
            match msg {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("expected text message, got {other:?}"),
            }
        }
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Value> {
        tokio::time::timeout(timeout, self.recv()).await.ok()
    }

    /// Waits for the `OK` answering `event_id`, returning `(accepted, message)`.
    pub async fn expect_ok(&mut self, event_id: &str) -> (bool, String) {
        loop {
            let msg = self.recv().await;
            if msg[0] == "OK" && msg[1] == event_id {
                return (
                    msg[2].as_bool().unwrap(),
                    msg[3].as_str().unwrap().to_string(),
                );
            }
        }
    }

    /// Collects `EVENT` messages for `sub_id` up to its `EOSE`.
    pub async fn stored_events(&mut self, sub_id: &str) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            let msg = self.recv().await;
            match msg[0].as_str() {
                Some("EVENT") if msg[1] == sub_id => {
                    events.push(serde_json::from_value(msg[2].clone()).unwrap());
                }
                Some("EOSE") if msg[1] == sub_id => return events,
                _ => {}
            }
        }
    }

    /// Answers the connection's AUTH challenge as `keys`.
    pub async fn authenticate(&mut self, keys: &Keypair) {
        let msg = self.recv().await;
        assert_eq!(msg[0], "AUTH", "expected a challenge, got {msg}");
        let challenge = msg[1].as_str().unwrap().to_string();
        let auth = sign_event(
            keys,
            unix_now(),
            22242,
            vec![
                vec!["relay".into(), "ws://relay.example".into()],
                vec!["challenge".into(), challenge],
            ],
            "",
        );
        self.send_json(json!(["AUTH", auth])).await;
        assert_eq!(self.expect_ok(&auth.id).await, (true, String::new()));
    }

    /// Next live `EVENT` for `sub_id`.
    pub async fn next_event(&mut self, sub_id: &str) -> Event {
        loop {
            let msg = self.recv().await;
            if msg[0] == "EVENT" && msg[1] == sub_id {
                return serde_json::from_value(msg[2].clone()).unwrap();
            }
        }
    }
}
