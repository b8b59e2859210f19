//! Delivery of queued log entries to the remote log socket.
//!
//! The shipper is the single consumer of the bus. It serialises batches
//! into the remote wire format and sends them over a persistent
//! authenticated WebSocket, reconnecting with exponential backoff and
//! jitter. After a reconnect it resumes with the batch at hand; the server
//! accepts idempotent activity records, plain line appends may duplicate.

use super::{Level, LogBus, LogEntry};
use crate::error::chain;
use crate::protocol::{encode_batch, LogSettings};
use crate::retry::RetryPolicy;
use anyhow::{Context, Result};
use derive_builder::Builder;
use futures_util::SinkExt;
use getset::{CopyGetters, Getters};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Path component of the log socket endpoint on the log service.
pub const LOG_SOCKET_PATH: &str = "/api/v1/logs/build/socket";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Builder, CopyGetters, Getters)]
#[builder(pattern = "owned", setter(into))]
/// Streams logger bus entries to the remote log endpoint identified by
/// `(host, path, token)`.
pub struct LogShipper {
    #[get]
    /// The bus drained by this shipper.
    bus: Arc<LogBus>,

    #[get]
    /// Endpoint and credentials of the log socket.
    settings: LogSettings,

    #[get]
    #[builder(default)]
    /// Backoff parameters for reconnect attempts.
    policy: RetryPolicy,

    #[get_copy = "pub"]
    #[builder(default = "256")]
    /// Upper bound of entries per delivered batch.
    batch_size: usize,

    #[get_copy = "pub"]
    #[builder(default = "true")]
    /// Whether to connect via TLS. Only tests disable this.
    tls: bool,
}

impl LogShipper {
    /// Spawn the shipping task.
    pub fn spawn(self) -> ShipperHandle {
        ShipperHandle {
            handle: tokio::spawn(self.run()),
        }
    }

    async fn run(self) {
        let mut conn: Option<WsStream> = None;
        let mut last_ms = 0;

        loop {
            let batch = self.bus().pop_many(self.batch_size()).await;
            if batch.is_empty() {
                break;
            }
            last_ms = batch.last().map(LogEntry::ms).unwrap_or(last_ms);
            self.deliver(&mut conn, encode_batch(&batch)).await;
        }

        let dropped = self.bus().dropped();
        if dropped > 0 {
            let note = LogEntry::Msg {
                level: Level::Notice,
                ms: last_ms,
                text: format!("{} log entries dropped by the agent", dropped),
            };
            self.deliver(&mut conn, encode_batch(&[note])).await;
        }

        if let Some(mut ws) = conn {
            if let Err(e) = ws.close(None).await {
                debug!("closing log socket: {}", e);
            }
        }
    }

    /// Send one encoded batch, reconnecting until it went out.
    async fn deliver(&self, conn: &mut Option<WsStream>, payload: Vec<u8>) {
        loop {
            if conn.is_none() {
                *conn = Some(self.connect().await);
            }
            if let Some(ws) = conn.as_mut() {
                match ws.send(Message::Binary(payload.clone())).await {
                    Ok(()) => return,
                    Err(e) => {
                        warn!("log socket send failed, reconnecting: {}", e);
                        *conn = None;
                    }
                }
            }
        }
    }

    /// Connect to the log socket, backing off between attempts until it
    /// succeeds. Draining after close is bounded by the caller's grace
    /// timeout, not by an attempt budget.
    async fn connect(&self) -> WsStream {
        let mut attempt = 0u32;
        loop {
            match self.try_connect().await {
                Ok(ws) => {
                    debug!("log socket connected to {}", self.settings().host());
                    return ws;
                }
                Err(e) => {
                    let delay = self.policy().delay(attempt);
                    warn!(
                        "log socket connect failed, retrying in {}ms: {}",
                        delay.as_millis(),
                        chain(e)
                    );
                    time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn try_connect(&self) -> Result<WsStream> {
        let scheme = if self.tls() { "wss" } else { "ws" };
        let url = format!(
            "{}://{}{}",
            scheme,
            self.settings().host(),
            self.settings().path()
        );
        let mut request = url
            .clone()
            .into_client_request()
            .with_context(|| format!("build log socket request for {}", url))?;
        request.headers_mut().insert(
            AUTHORIZATION,
            format!("Bearer {}", self.settings().token())
                .parse()
                .context("encode log socket bearer token")?,
        );
        let (ws, _) = connect_async(request)
            .await
            .with_context(|| format!("connect log socket {}", url))?;
        Ok(ws)
    }
}

/// Handle of a spawned shipper.
pub struct ShipperHandle {
    handle: JoinHandle<()>,
}

impl ShipperHandle {
    /// Wait for the shipper to drain and exit, bounded by the grace
    /// timeout. A shipper still stuck afterwards is aborted.
    pub async fn shutdown(mut self, grace: Duration) {
        if time::timeout(grace, &mut self.handle).await.is_err() {
            warn!("log shipper did not drain within the grace period, aborting");
            self.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_batch, LogSettingsBuilder};
    use crate::retry::RetryPolicyBuilder;
    use anyhow::Result;
    use futures_util::StreamExt;
    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn quick_policy() -> RetryPolicy {
        RetryPolicyBuilder::default()
            .max_attempts(3u32)
            .base(Duration::from_millis(1))
            .cap(Duration::from_millis(5))
            .build()
            .expect("retry policy")
    }

    fn shipper(bus: Arc<LogBus>, host: String) -> LogShipper {
        LogShipperBuilder::default()
            .bus(bus)
            .settings(
                LogSettingsBuilder::default()
                    .token("secret")
                    .path("/logs")
                    .host(host)
                    .build()
                    .expect("log settings"),
            )
            .policy(quick_policy())
            .tls(false)
            .build()
            .expect("log shipper")
    }

    fn msg(ms: u64) -> LogEntry {
        LogEntry::Msg {
            level: Level::Info,
            ms,
            text: format!("line {}", ms),
        }
    }

    /// Accept websocket connections and record every binary payload.
    async fn record_connection(
        listener: &TcpListener,
        received: &Arc<Mutex<Vec<Vec<u8>>>>,
    ) -> Result<()> {
        let (stream, _) = listener.accept().await?;
        let mut ws = accept_async(stream).await?;
        while let Some(message) = ws.next().await {
            match message {
                Ok(Message::Binary(payload)) => {
                    received.lock().expect("received").push(payload);
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn shipper_success_delivers_batches() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let host = format!("127.0.0.1:{}", listener.local_addr()?.port());
        let received = Arc::new(Mutex::new(Vec::new()));

        let server = {
            let received = received.clone();
            tokio::spawn(async move { record_connection(&listener, &received).await })
        };

        let bus = LogBus::new(64);
        bus.push(msg(1));
        bus.push(msg(2));
        let handle = shipper(bus.clone(), host).spawn();

        tokio::time::sleep(Duration::from_millis(100)).await;
        bus.close();
        handle.shutdown(Duration::from_secs(2)).await;
        server.await??;

        let payloads = received.lock().expect("received").clone();
        assert!(!payloads.is_empty());
        let entries: Vec<LogEntry> = payloads
            .iter()
            .map(|payload| decode_batch(payload).expect("decode batch"))
            .flatten()
            .collect();
        assert_eq!(entries, vec![msg(1), msg(2)]);
        Ok(())
    }

    #[tokio::test]
    async fn shipper_success_reconnects_after_failed_handshake() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let host = format!("127.0.0.1:{}", listener.local_addr()?.port());
        let received = Arc::new(Mutex::new(Vec::new()));

        let server = {
            let received = received.clone();
            tokio::spawn(async move {
                // First connection dies before the websocket handshake, the
                // shipper has to come back.
                let (stream, _) = listener.accept().await?;
                drop(stream);
                record_connection(&listener, &received).await
            })
        };

        let bus = LogBus::new(64);
        bus.push(msg(7));
        let handle = shipper(bus.clone(), host).spawn();

        tokio::time::sleep(Duration::from_millis(200)).await;
        bus.close();
        handle.shutdown(Duration::from_secs(2)).await;
        server.await??;

        let payloads = received.lock().expect("received").clone();
        assert_eq!(payloads.len(), 1);
        assert_eq!(decode_batch(&payloads[0])?, vec![msg(7)]);
        Ok(())
    }

    #[tokio::test]
    async fn shipper_success_appends_drop_note() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let host = format!("127.0.0.1:{}", listener.local_addr()?.port());
        let received = Arc::new(Mutex::new(Vec::new()));

        let server = {
            let received = received.clone();
            tokio::spawn(async move { record_connection(&listener, &received).await })
        };

        // Capacity one: the second message sheds the first.
        let bus = LogBus::new(1);
        bus.push(msg(1));
        bus.push(msg(2));
        assert_eq!(bus.dropped(), 1);

        let handle = shipper(bus.clone(), host).spawn();
        tokio::time::sleep(Duration::from_millis(100)).await;
        bus.close();
        handle.shutdown(Duration::from_secs(2)).await;
        server.await??;

        let payloads = received.lock().expect("received").clone();
        let entries: Vec<LogEntry> = payloads
            .iter()
            .map(|payload| decode_batch(payload).expect("decode batch"))
            .flatten()
            .collect();
        let texts: Vec<String> = entries
            .iter()
            .filter_map(|entry| match entry {
                LogEntry::Msg { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert!(texts
            .iter()
            .any(|text| text.contains("1 log entries dropped")));
        Ok(())
    }

    #[tokio::test]
    async fn shipper_shutdown_failure_aborts_unreachable_socket() -> Result<()> {
        // No server listening: the shipper keeps retrying until the grace
        // timeout cuts it off.
        let bus = LogBus::new(8);
        bus.push(msg(1));
        bus.close();

        let handle = shipper(bus, "127.0.0.1:1".to_string()).spawn();
        handle.shutdown(Duration::from_millis(200)).await;
        Ok(())
    }
}
