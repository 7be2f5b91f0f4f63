//! In-process relay used by the integration tests.
//!
//! Accepts any number of push-channel connections on `127.0.0.1`, records
//! every text frame a client sends and counts keepalive pings. Test-injected
//! frames are broadcast to all connected clients.

#![allow(dead_code, clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use fleetlink_core::{AccountDevice, DeviceIndex, HealthMonitor};
use fleetlink_daemon::channel::ChannelOptions;
use fleetlink_daemon::fleet::FleetOrchestrator;
use fleetlink_daemon::session::{AuthError, TokenSource};

pub const RELAY_HOST: &str = "127.0.0.1";
pub const TOKEN: &str = "test token";

#[derive(Debug, Clone)]
enum Outbound {
    Text(String),
    Close,
}

pub struct TestRelay {
    pub port: u16,
    received: Arc<Mutex<Vec<Value>>>,
    queries: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
    pings: Arc<AtomicUsize>,
    outbound: broadcast::Sender<Outbound>,
}

impl TestRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind((RELAY_HOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let queries = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let pings = Arc::new(AtomicUsize::new(0));
        let (outbound, _) = broadcast::channel(64);

        let relay = Self {
            port,
            received: Arc::clone(&received),
            queries: Arc::clone(&queries),
            connections: Arc::clone(&connections),
            pings: Arc::clone(&pings),
            outbound: outbound.clone(),
        };

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                // Subscribe before the handshake completes so frames pushed
                // right after the client's connect returns are not missed.
                let mut rx = outbound.subscribe();
                let received = Arc::clone(&received);
                let queries = Arc::clone(&queries);
                let connections = Arc::clone(&connections);
                let pings = Arc::clone(&pings);
                tokio::spawn(async move {
                    let ws = tokio_tungstenite::accept_hdr_async(
                        stream,
                        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                            queries
                                .lock()
                                .push(req.uri().query().unwrap_or_default().to_string());
                            Ok(resp)
                        },
                    )
                    .await;
                    let Ok(ws) = ws else { return };
                    connections.fetch_add(1, Ordering::SeqCst);
                    let (mut sink, mut source) = ws.split();
                    loop {
                        tokio::select! {
                            frame = source.next() => match frame {
                                Some(Ok(Message::Text(text))) => {
                                    if let Ok(value) = serde_json::from_str(&text) {
                                        received.lock().push(value);
                                    }
                                }
                                Some(Ok(Message::Ping(_))) => {
                                    pings.fetch_add(1, Ordering::SeqCst);
                                }
                                Some(Ok(_)) => {}
                                _ => break,
                            },
                            out = rx.recv() => match out {
                                Ok(Outbound::Text(text)) => {
                                    if sink.send(Message::Text(text)).await.is_err() {
                                        break;
                                    }
                                }
                                Ok(Outbound::Close) | Err(_) => {
                                    let _ = sink.send(Message::Close(None)).await;
                                    break;
                                }
                            },
                        }
                    }
                });
            }
        });

        relay
    }

    pub fn options(&self) -> ChannelOptions {
        ChannelOptions {
            port: self.port,
            path: "/shelly/wss/hk_sock".to_string(),
            secure: false,
            ..ChannelOptions::default()
        }
    }

    /// Send a JSON event to every connected client.
    pub fn push(&self, event: &Value) {
        let _ = self.outbound.send(Outbound::Text(event.to_string()));
    }

    /// Send a raw text frame to every connected client.
    pub fn push_raw(&self, text: &str) {
        let _ = self.outbound.send(Outbound::Text(text.to_string()));
    }

    /// Close every connected client from the relay side.
    pub fn drop_clients(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().clone()
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Keepalive pings received across all connections.
    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

/// Hands out the same token for every host.
pub struct StaticTokens;

#[async_trait]
impl TokenSource for StaticTokens {
    async fn token_for_host(&self, _host: &str) -> Result<String, AuthError> {
        Ok(TOKEN.to_string())
    }
}

pub fn device(id: &str, device_type: &str, access_groups: &str) -> AccountDevice {
    AccountDevice::new(id, device_type, RELAY_HOST, access_groups)
}

/// Fleet over a fresh index pointed at `relay`.
pub fn fleet_for(relay: &TestRelay, devices: Vec<AccountDevice>) -> Arc<FleetOrchestrator> {
    let index = Arc::new(DeviceIndex::new());
    for device in devices {
        index.upsert_device("user-1", device).unwrap();
    }
    Arc::new(FleetOrchestrator::new(
        index,
        Arc::new(HealthMonitor::new()),
        Arc::new(StaticTokens),
        relay.options(),
    ))
}

/// Poll `cond` until it holds, failing the test after five seconds.
pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
