//! One persistent push channel to a relay host.
//!
//! A connected channel runs two background tasks: the inbound pump, which
//! decodes and dispatches events strictly in arrival order, and the keepalive
//! loop, which pings the relay on a fixed period. Both exit when the channel
//! is closed or the transport fails. Reconnecting is the caller's business.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};

use super::config::ChannelOptions;
use super::error::ChannelError;
use super::event::{ActionRequest, ChannelEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Receives `(device_id, payload, timestamp)` for status and settings events.
pub type PayloadHandler = Arc<dyn Fn(&str, &Value, DateTime<Utc>) + Send + Sync>;
/// Receives `(device_id, online, timestamp)`.
pub type OnlineHandler = Arc<dyn Fn(&str, bool, DateTime<Utc>) + Send + Sync>;
/// Sees every inbound message that parsed as JSON, before typed dispatch.
pub type RawHandler = Arc<dyn Fn(&Value) + Send + Sync>;
/// Called once when the inbound pump hits a transport failure.
pub type ErrorHandler = Arc<dyn Fn(&ChannelError) + Send + Sync>;

/// Event observers for one channel.
///
/// Handlers run on the channel's inbound task, one message at a time. They
/// must not block.
#[derive(Clone, Default)]
pub struct ChannelHandlers {
    pub on_status: Option<PayloadHandler>,
    pub on_settings: Option<PayloadHandler>,
    pub on_online: Option<OnlineHandler>,
    pub on_raw: Option<RawHandler>,
    pub on_error: Option<ErrorHandler>,
}

impl ChannelHandlers {
    #[must_use]
    pub fn with_status(
        mut self,
        f: impl Fn(&str, &Value, DateTime<Utc>) + Send + Sync + 'static,
    ) -> Self {
        self.on_status = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn with_settings(
        mut self,
        f: impl Fn(&str, &Value, DateTime<Utc>) + Send + Sync + 'static,
    ) -> Self {
        self.on_settings = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn with_online(
        mut self,
        f: impl Fn(&str, bool, DateTime<Utc>) + Send + Sync + 'static,
    ) -> Self {
        self.on_online = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn with_raw(mut self, f: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_raw = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn with_error(mut self, f: impl Fn(&ChannelError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

struct Shared {
    host: String,
    /// Write half; `None` once closed or after a read failure.
    sink: Mutex<Option<WsSink>>,
    closed: AtomicBool,
    alive: AtomicBool,
    close_tx: watch::Sender<bool>,
    handlers: RwLock<ChannelHandlers>,
}

/// Handle to a connected push channel. Clones share the same connection.
#[derive(Clone)]
pub struct PushChannel {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for PushChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushChannel")
            .field("host", &self.shared.host)
            .field("closed", &self.is_closed())
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl PushChannel {
    /// Dial `host` and start the inbound and keepalive tasks.
    pub async fn connect(
        host: &str,
        token: &str,
        options: &ChannelOptions,
        handlers: ChannelHandlers,
    ) -> Result<Self, ChannelError> {
        let url = options.url(host, token);
        let (ws, _response) = connect_async(url.as_str()).await.map_err(|e| ChannelError::Connect {
            host: host.to_string(),
            reason: e.to_string(),
        })?;
        let (sink, source) = ws.split();
        let (close_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            host: host.to_string(),
            sink: Mutex::new(Some(sink)),
            closed: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            close_tx,
            handlers: RwLock::new(handlers),
        });

        tokio::spawn(inbound_loop(
            Arc::clone(&shared),
            source,
            shared.close_tx.subscribe(),
        ));
        tokio::spawn(keepalive_loop(
            Arc::clone(&shared),
            options.keepalive_interval,
            options.ping_timeout,
            shared.close_tx.subscribe(),
        ));

        info!(host = %host, secure = options.secure, "Push channel connected");
        Ok(Self { shared })
    }

    pub fn host(&self) -> &str {
        &self.shared.host
    }

    /// Explicitly closed via [`close`](Self::close).
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Not closed and the transport has not failed.
    pub fn is_alive(&self) -> bool {
        !self.is_closed() && self.shared.alive.load(Ordering::SeqCst)
    }

    pub fn on_status_change(
        &self,
        f: impl Fn(&str, &Value, DateTime<Utc>) + Send + Sync + 'static,
    ) {
        self.shared.handlers.write().on_status = Some(Arc::new(f));
    }

    pub fn on_settings_change(
        &self,
        f: impl Fn(&str, &Value, DateTime<Utc>) + Send + Sync + 'static,
    ) {
        self.shared.handlers.write().on_settings = Some(Arc::new(f));
    }

    pub fn on_online_change(&self, f: impl Fn(&str, bool, DateTime<Utc>) + Send + Sync + 'static) {
        self.shared.handlers.write().on_online = Some(Arc::new(f));
    }

    pub fn on_raw_message(&self, f: impl Fn(&Value) + Send + Sync + 'static) {
        self.shared.handlers.write().on_raw = Some(Arc::new(f));
    }

    pub fn on_error(&self, f: impl Fn(&ChannelError) + Send + Sync + 'static) {
        self.shared.handlers.write().on_error = Some(Arc::new(f));
    }

    /// Send an action request for `device_id`.
    pub async fn send_command(
        &self,
        device_id: &str,
        action: &str,
        params: &Value,
    ) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let payload = serde_json::to_string(&ActionRequest::new(device_id, action, params))
            .map_err(|e| ChannelError::Encode(e.to_string()))?;

        let mut guard = self.shared.sink.lock().await;
        let sink = guard.as_mut().ok_or(ChannelError::Closed)?;
        sink.send(Message::Text(payload))
            .await
            .map_err(|e| ChannelError::Send(e.to_string()))?;
        debug!(host = %self.shared.host, device_id, action, "Command sent");
        Ok(())
    }

    /// Close the channel. Only the first call has any effect; later calls
    /// return `Ok(())`.
    pub async fn close(&self) -> Result<(), ChannelError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.close_tx.send_replace(true);

        let sink = self.shared.sink.lock().await.take();
        info!(host = %self.shared.host, "Push channel closed");
        let Some(mut sink) = sink else {
            return Ok(());
        };
        match sink.close().await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Ok(())
            }
            Err(e) => Err(ChannelError::Send(e.to_string())),
        }
    }
}

impl Shared {
    fn handlers(&self) -> ChannelHandlers {
        self.handlers.read().clone()
    }

    /// Decode one message and hand it to the registered observers.
    fn dispatch(&self, bytes: &[u8]) {
        let value: Value = match serde_json::from_slice(bytes) {
            Ok(v) => v,
            Err(e) => {
                warn!(host = %self.host, error = %e, "Dropping malformed message");
                return;
            }
        };
        let handlers = self.handlers();
        if let Some(raw) = &handlers.on_raw {
            raw(&value);
        }

        match ChannelEvent::decode(&value) {
            Ok(ChannelEvent::StatusChanged {
                device_id,
                status,
                timestamp,
            }) => {
                if let Some(f) = &handlers.on_status {
                    f(&device_id, &status, timestamp);
                }
            }
            Ok(ChannelEvent::SettingsChanged {
                device_id,
                settings,
                timestamp,
            }) => {
                if let Some(f) = &handlers.on_settings {
                    f(&device_id, &settings, timestamp);
                }
            }
            Ok(ChannelEvent::OnlineChanged {
                device_id,
                online,
                timestamp,
            }) => {
                if let Some(f) = &handlers.on_online {
                    f(&device_id, online, timestamp);
                }
            }
            Ok(ChannelEvent::Unrecognized { event }) => {
                debug!(host = %self.host, event = %event, "Ignoring unrecognized event");
            }
            Err(e) => {
                warn!(host = %self.host, error = %e, "Dropping undecodable event");
            }
        }
    }

    /// Record a transport failure unless the channel was closed on purpose.
    async fn fail(&self, error: ChannelError) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.alive.store(false, Ordering::SeqCst);
        self.sink.lock().await.take();
        warn!(host = %self.host, error = %error, "Push channel transport failed");
        if let Some(f) = self.handlers().on_error {
            f(&error);
        }
    }
}

async fn inbound_loop(
    shared: Arc<Shared>,
    mut source: WsSource,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            _ = close_rx.changed() => break,
            next = source.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => shared.dispatch(text.as_bytes()),
            Some(Ok(Message::Binary(data))) => shared.dispatch(&data),
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                trace!(host = %shared.host, "Control frame");
            }
            Some(Ok(Message::Close(frame))) => {
                let reason = frame.map_or_else(
                    || "closed by relay".to_string(),
                    |f| format!("closed by relay: {} {}", f.code, f.reason),
                );
                shared.fail(ChannelError::Read(reason)).await;
                break;
            }
            Some(Err(e)) => {
                shared.fail(ChannelError::Read(e.to_string())).await;
                break;
            }
            None => {
                shared.fail(ChannelError::Read("stream ended".to_string())).await;
                break;
            }
        }
    }
    debug!(host = %shared.host, "Inbound loop exited");
}

async fn keepalive_loop(
    shared: Arc<Shared>,
    period: Duration,
    ping_timeout: Duration,
    mut close_rx: watch::Receiver<bool>,
) {
    let mut timer = tokio::time::interval(period);
    timer.tick().await; // Skip first immediate tick

    loop {
        tokio::select! {
            _ = close_rx.changed() => break,
            _ = timer.tick() => {
                let mut guard = shared.sink.lock().await;
                let Some(sink) = guard.as_mut() else { break };
                let ping = sink.send(Message::Ping(Vec::new()));
                match tokio::time::timeout(ping_timeout, ping).await {
                    Ok(Ok(())) => trace!(host = %shared.host, "Ping sent"),
                    Ok(Err(e)) => {
                        debug!(host = %shared.host, error = %e, "Ping failed");
                        break;
                    }
                    Err(_) => {
                        warn!(host = %shared.host, "Ping timed out");
                        break;
                    }
                }
            }
        }
    }
    debug!(host = %shared.host, "Keepalive loop exited");
}
