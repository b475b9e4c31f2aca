//! JSON-RPC client over a WebSocket to the printer host daemon.
//!
//! One background task owns the socket: it connects, pumps frames, and
//! reconnects with exponential backoff on abnormal close. Callers never
//! block; every request returns immediately and completion arrives on a
//! callback or the async [`RpcClient::call`] wrapper.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use helix_core::error::{Result, TransportError};
use helix_core::TransportConfig;

use crate::jsonrpc::{parse_frame, status_update_payload, InboundFrame, RpcRequest};

/// Moonraker's status-delta notification method
pub const NOTIFY_STATUS_UPDATE: &str = "notify_status_update";
/// Sent when the firmware becomes ready
pub const NOTIFY_KLIPPY_READY: &str = "notify_klippy_ready";
/// Sent when the firmware shuts down
pub const NOTIFY_KLIPPY_SHUTDOWN: &str = "notify_klippy_shutdown";

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal; the retry budget is exhausted
    Failed,
}

/// One-shot reply callback
pub type SuccessCallback = Box<dyn FnOnce(Value) + Send + 'static>;
/// One-shot error callback
pub type ErrorCallback = Box<dyn FnOnce(helix_core::Error) + Send + 'static>;
/// Persistent notification handler
pub type NotificationHandler = Arc<dyn Fn(&Value) + Send + Sync>;
/// Handler for every status delta; receives the status object and the
/// host event time.
pub type StatusHandler = Arc<dyn Fn(&Value, f64) + Send + Sync>;
/// Connection lifecycle observer
pub type LifecycleCallback = Arc<dyn Fn() + Send + Sync>;

struct Pending {
    method: String,
    deadline: Instant,
    timeout_ms: u64,
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
}

struct ClientInner {
    config: TransportConfig,
    state: Mutex<ConnectionState>,
    next_id: AtomicU64,
    reconnect_attempt: AtomicU32,
    pending: Mutex<HashMap<u64, Pending>>,
    /// (method, handler key) -> handler, so handlers can be replaced
    handlers: Mutex<HashMap<String, HashMap<String, NotificationHandler>>>,
    status_handlers: Mutex<Vec<StatusHandler>>,
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    on_connected: Mutex<Option<LifecycleCallback>>,
    on_disconnected: Mutex<Option<LifecycleCallback>>,
    cancel: CancellationToken,
}

/// Client handle, cheaply cloneable
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                state: Mutex::new(ConnectionState::Disconnected),
                next_id: AtomicU64::new(1),
                reconnect_attempt: AtomicU32::new(0),
                pending: Mutex::new(HashMap::new()),
                handlers: Mutex::new(HashMap::new()),
                status_handlers: Mutex::new(Vec::new()),
                writer: Mutex::new(None),
                on_connected: Mutex::new(None),
                on_disconnected: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Start the connection loop
    ///
    /// Idempotent: a second call while connecting or connected is a
    /// no-op. `on_connected` fires after every successful (re)open, so
    /// discovery re-runs on reconnect.
    pub fn connect(
        &self,
        url: &str,
        on_connected: Option<LifecycleCallback>,
        on_disconnected: Option<LifecycleCallback>,
    ) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                ConnectionState::Connecting | ConnectionState::Connected => return Ok(()),
                _ => *state = ConnectionState::Connecting,
            }
        }
        let url = Url::parse(url).map_err(|e| TransportError::WebSocket {
            reason: format!("bad url: {e}"),
        })?;
        *self.inner.on_connected.lock() = on_connected;
        *self.inner.on_disconnected.lock() = on_disconnected;
        self.inner.reconnect_attempt.store(0, Ordering::SeqCst);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            connection_loop(inner, url).await;
        });

        // Per-request deadlines are swept once a second.
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = interval.tick() => inner.sweep_timeouts(),
                }
            }
        });
        Ok(())
    }

    /// Tear the connection down and stop reconnecting
    pub fn disconnect(&self) {
        self.inner.cancel.cancel();
        *self.inner.state.lock() = ConnectionState::Disconnected;
        self.inner.writer.lock().take();
        self.inner
            .fail_all_pending(|| TransportError::NotConnected.into());
    }

    /// Send a request with one-shot callbacks
    ///
    /// Returns the allocated request id. Fails fast with NOT_CONNECTED
    /// outside the CONNECTED state; never queues while down.
    pub fn send(
        &self,
        method: &str,
        params: Option<Value>,
        on_success: Option<SuccessCallback>,
        on_error: Option<ErrorCallback>,
        timeout_ms: Option<u64>,
    ) -> Result<u64> {
        if !self.is_connected() {
            if let Some(on_error) = on_error {
                on_error(TransportError::NotConnected.into());
            }
            return Err(TransportError::NotConnected.into());
        }
        let timeout_ms = timeout_ms.unwrap_or(self.inner.config.default_timeout_ms);
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let request = RpcRequest::call(id, method, params);
        let text = serde_json::to_string(&request).map_err(|e| TransportError::Parse {
            reason: e.to_string(),
        })?;

        self.inner.pending.lock().insert(
            id,
            Pending {
                method: method.to_string(),
                deadline: Instant::now() + Duration::from_millis(timeout_ms),
                timeout_ms,
                on_success,
                on_error,
            },
        );

        let writer = self.inner.writer.lock().clone();
        match writer {
            Some(writer) if writer.send(text).is_ok() => {
                trace!(id, method, "RPC sent");
                Ok(id)
            }
            _ => {
                // Socket died between the state check and the send.
                if let Some(pending) = self.inner.pending.lock().remove(&id) {
                    if let Some(on_error) = pending.on_error {
                        on_error(TransportError::NotConnected.into());
                    }
                }
                Err(TransportError::NotConnected.into())
            }
        }
    }

    /// Send a request and await the reply
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout_ms: Option<u64>,
    ) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        let tx_err = Arc::new(Mutex::new(Some(tx)));
        let tx_ok = tx_err.clone();
        self.send(
            method,
            params,
            Some(Box::new(move |result| {
                if let Some(tx) = tx_ok.lock().take() {
                    let _ = tx.send(Ok(result));
                }
            })),
            Some(Box::new(move |err| {
                if let Some(tx) = tx_err.lock().take() {
                    let _ = tx.send(Err(err));
                }
            })),
            timeout_ms,
        )?;
        rx.await
            .map_err(|_| helix_core::Error::from(TransportError::NotConnected))?
    }

    /// Run a G-code script on the host
    pub async fn gcode_script(&self, script: &str) -> Result<()> {
        self.call(
            "printer.gcode.script",
            Some(json!({ "script": script })),
            None,
        )
        .await
        .map(|_| ())
    }

    /// Register a persistent notification handler
    ///
    /// Keyed by (method, key); registering under the same pair replaces
    /// the previous handler.
    pub fn register_notification(&self, method: &str, key: &str, handler: NotificationHandler) {
        self.inner
            .handlers
            .lock()
            .entry(method.to_string())
            .or_default()
            .insert(key.to_string(), handler);
    }

    /// Remove a persistent handler
    pub fn unregister_notification(&self, method: &str, key: &str) {
        if let Some(map) = self.inner.handlers.lock().get_mut(method) {
            map.remove(key);
        }
    }

    /// Register a handler for every status-update notification
    pub fn register_status_handler(&self, handler: StatusHandler) {
        self.inner.status_handlers.lock().push(handler);
    }

    /// Expire pending requests past their deadline
    ///
    /// Driven internally once per second; exposed for hosts that run
    /// their own scheduler.
    pub fn tick(&self) {
        self.inner.sweep_timeouts();
    }

    #[cfg(test)]
    fn test_connect(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.writer.lock() = Some(tx);
        *self.inner.state.lock() = ConnectionState::Connected;
        rx
    }

    #[cfg(test)]
    fn test_feed(&self, text: &str) {
        self.inner.handle_text(text);
    }
}

impl ClientInner {
    fn handle_text(&self, text: &str) {
        match parse_frame(text) {
            Ok(InboundFrame::Result { id, result }) => {
                if let Some(pending) = self.pending.lock().remove(&id) {
                    trace!(id, method = %pending.method, "RPC reply");
                    if let Some(on_success) = pending.on_success {
                        on_success(result);
                    }
                } else {
                    debug!(id, "Reply for unknown request id");
                }
            }
            Ok(InboundFrame::Error { id, error }) => {
                if let Some(pending) = self.pending.lock().remove(&id) {
                    warn!(id, method = %pending.method, code = error.code, "RPC error reply");
                    if let Some(on_error) = pending.on_error {
                        on_error(TransportError::from(error).into());
                    }
                }
            }
            Ok(InboundFrame::Notification { method, params }) => {
                self.dispatch_notification(&method, &params);
            }
            Err(e) => {
                // Framing errors never terminate the connection.
                debug!(error = %e, "Dropping unparseable frame");
            }
        }
    }

    fn dispatch_notification(&self, method: &str, params: &Value) {
        if method == NOTIFY_STATUS_UPDATE {
            if let Some(status) = status_update_payload(params) {
                let eventtime = params
                    .as_array()
                    .and_then(|a| a.get(1))
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
                let handlers = self.status_handlers.lock().clone();
                for handler in handlers {
                    handler(status, eventtime);
                }
            }
        } else if method == NOTIFY_KLIPPY_SHUTDOWN {
            warn!("Host firmware reports shutdown");
        }

        let handlers: Vec<NotificationHandler> = self
            .handlers
            .lock()
            .get(method)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(params);
        }
    }

    fn sweep_timeouts(&self) {
        let now = Instant::now();
        let expired: Vec<(u64, Pending)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };
        for (id, pending) in expired {
            warn!(id, method = %pending.method, "RPC timed out");
            if let Some(on_error) = pending.on_error {
                on_error(
                    TransportError::Timeout {
                        method: pending.method,
                        timeout_ms: pending.timeout_ms,
                    }
                    .into(),
                );
            }
        }
    }

    fn fail_all_pending(&self, make_err: impl Fn() -> helix_core::Error) {
        let drained: Vec<Pending> = self.pending.lock().drain().map(|(_, p)| p).collect();
        for pending in drained {
            if let Some(on_error) = pending.on_error {
                on_error(make_err());
            }
        }
    }
}

/// Reconnecting connection loop
///
/// delay = min(max, base × 2^attempt); attempt budget of 0 retries
/// forever. The attempt counter resets after every successful open.
async fn connection_loop(inner: Arc<ClientInner>, url: Url) {
    loop {
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            result = run_connection(&inner, &url) => {
                *inner.state.lock() = ConnectionState::Disconnected;
                inner.writer.lock().take();
                inner.fail_all_pending(|| TransportError::NotConnected.into());
                let on_disconnected = inner.on_disconnected.lock().clone();
                if let Some(cb) = on_disconnected {
                    cb();
                }

                match result {
                    Ok(()) => info!("Connection closed, reconnecting"),
                    Err(e) => warn!(error = %e, "Connection failed"),
                }

                let attempt = inner.reconnect_attempt.fetch_add(1, Ordering::SeqCst);
                let max = inner.config.reconnect_max_attempts;
                if max != 0 && attempt + 1 >= max {
                    error!(attempts = attempt + 1, "Reconnect budget exhausted");
                    *inner.state.lock() = ConnectionState::Failed;
                    break;
                }

                let delay = backoff_delay(attempt, &inner.config);
                debug!(delay_ms = delay.as_millis() as u64, attempt, "Backing off");
                tokio::select! {
                    biased;
                    _ = inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                *inner.state.lock() = ConnectionState::Connecting;
            }
        }
    }
}

/// One connection: open, pump frames until the socket drops
async fn run_connection(inner: &Arc<ClientInner>, url: &Url) -> std::result::Result<(), String> {
    info!(url = %url, "Connecting to host");
    let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| e.to_string())?;
    info!("Connected");

    let (mut sink, mut read) = stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    *inner.writer.lock() = Some(tx);
    *inner.state.lock() = ConnectionState::Connected;
    inner.reconnect_attempt.store(0, Ordering::SeqCst);

    let on_connected = inner.on_connected.lock().clone();
    if let Some(cb) = on_connected {
        cb();
    }

    loop {
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => return Ok(()),
            outbound = rx.recv() => {
                match outbound {
                    Some(text) => {
                        sink.send(Message::Text(text.into()))
                            .await
                            .map_err(|e| e.to_string())?;
                    }
                    None => return Ok(()),
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => inner.handle_text(text.as_str()),
                    Some(Ok(Message::Ping(_))) => trace!("ping"),
                    Some(Ok(Message::Close(_))) => {
                        info!("Close frame received");
                        return Ok(());
                    }
                    Some(Err(e)) => return Err(e.to_string()),
                    None => return Ok(()),
                    _ => {}
                }
            }
        }
    }
}

fn backoff_delay(attempt: u32, config: &TransportConfig) -> Duration {
    let exp = 2u64.saturating_pow(attempt.min(16));
    let ms = config
        .reconnect_base_ms
        .saturating_mul(exp)
        .min(config.reconnect_max_ms);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn client() -> RpcClient {
        RpcClient::new(TransportConfig::default())
    }

    #[tokio::test]
    async fn test_send_fails_fast_when_disconnected() {
        let c = client();
        let err = c.send("printer.info", None, None, None, None).unwrap_err();
        assert_eq!(err.label(), "NOT_CONNECTED");
    }

    #[tokio::test]
    async fn test_reply_correlation() {
        let c = client();
        let mut outbound = c.test_connect();

        let got = Arc::new(Mutex::new(None));
        let sink = got.clone();
        let id = c
            .send(
                "printer.info",
                None,
                Some(Box::new(move |v| *sink.lock() = Some(v))),
                None,
                None,
            )
            .unwrap();

        let sent: Value = serde_json::from_str(&outbound.recv().await.unwrap()).unwrap();
        assert_eq!(sent["method"], "printer.info");
        assert_eq!(sent["id"], id);

        c.test_feed(&format!(
            r#"{{"jsonrpc":"2.0","result":{{"state":"ready"}},"id":{id}}}"#
        ));
        assert_eq!(got.lock().as_ref().unwrap()["state"], "ready");
    }

    #[tokio::test]
    async fn test_error_envelope_reaches_error_callback() {
        let c = client();
        let _outbound = c.test_connect();
        let got = Arc::new(Mutex::new(None));
        let sink = got.clone();
        let id = c
            .send(
                "printer.gcode.script",
                None,
                None,
                Some(Box::new(move |e| *sink.lock() = Some(e))),
                None,
            )
            .unwrap();
        c.test_feed(&format!(
            r#"{{"jsonrpc":"2.0","error":{{"code":400,"message":"bad"}},"id":{id}}}"#
        ));
        assert_eq!(got.lock().as_ref().unwrap().label(), "RPC_ERROR");
    }

    #[tokio::test]
    async fn test_timeout_sweep() {
        let c = client();
        let _outbound = c.test_connect();
        let timed_out = Arc::new(AtomicBool::new(false));
        let flag = timed_out.clone();
        c.send(
            "server.info",
            None,
            None,
            Some(Box::new(move |e| {
                flag.store(e.is_timeout(), Ordering::SeqCst);
            })),
            Some(0),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        c.tick();
        assert!(timed_out.load(Ordering::SeqCst));
        // The pending record is gone; a late reply is ignored.
        assert!(c.inner.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_status_handler_receives_delta() {
        let c = client();
        let got = Arc::new(Mutex::new(None));
        let sink = got.clone();
        c.register_status_handler(Arc::new(move |status, eventtime| {
            *sink.lock() = Some((status.clone(), eventtime));
        }));
        c.test_feed(
            r#"{"jsonrpc":"2.0","method":"notify_status_update","params":[{"extruder":{"temperature":42.0}},99.5]}"#,
        );
        let (status, eventtime) = got.lock().clone().unwrap();
        assert_eq!(status["extruder"]["temperature"], 42.0);
        assert_eq!(eventtime, 99.5);
    }

    #[tokio::test]
    async fn test_notification_handler_replaced_by_key() {
        let c = client();
        let hits = Arc::new(AtomicU64::new(0));
        let first = hits.clone();
        c.register_notification(
            "notify_klippy_ready",
            "ui",
            Arc::new(move |_| {
                first.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let second = hits.clone();
        c.register_notification(
            "notify_klippy_ready",
            "ui",
            Arc::new(move |_| {
                second.fetch_add(10, Ordering::SeqCst);
            }),
        );
        c.test_feed(r#"{"jsonrpc":"2.0","method":"notify_klippy_ready"}"#);
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_backoff_caps() {
        let config = TransportConfig {
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            ..Default::default()
        };
        assert_eq!(backoff_delay(0, &config), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(1, &config), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(4, &config), Duration::from_millis(16_000));
        assert_eq!(backoff_delay(10, &config), Duration::from_millis(30_000));
        // Huge attempt counts must not overflow.
        assert_eq!(backoff_delay(100_000, &config), Duration::from_millis(30_000));
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let c = client();
        let mut outbound = c.test_connect();
        let c2 = c.clone();
        let task = tokio::spawn(async move { c2.call("server.info", None, None).await });

        let sent: Value = serde_json::from_str(&outbound.recv().await.unwrap()).unwrap();
        let id = sent["id"].as_u64().unwrap();
        c.test_feed(&format!(
            r#"{{"jsonrpc":"2.0","result":{{"klippy_state":"ready"}},"id":{id}}}"#
        ));

        let result = task.await.unwrap().unwrap();
        assert_eq!(result["klippy_state"], "ready");
    }
}
