//! Stream connection manager with bounded auto-reconnect.
//!
//! Owns the single WebSocket to the service. Inbound text frames are
//! forwarded, in arrival order, to the receiver returned by
//! [`WebSocketHandle::spawn`]; outbound frames are queued through the
//! handle and written by the background task. Connection state is
//! published on a [`tokio::sync::watch`] channel.
//!
//! # Example
//!
//! ```rust,ignore
//! use wapp_api::websocket::{ReconnectConfig, WebSocketHandle};
//! use tokio_util::sync::CancellationToken;
//! use url::Url;
//!
//! let url = Url::parse("wss://wappsto.com/services/2.0/websocket/open")?;
//! let (handle, mut inbound) =
//!     WebSocketHandle::spawn(url, ReconnectConfig::default(), None, CancellationToken::new());
//! handle.wait_connected().await?;
//!
//! while let Some(text) = inbound.recv().await {
//!     println!("{text}");
//! }
//! ```

use std::fmt;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;
use crate::transport::SESSION_HEADER;

// ── ConnectionState ──────────────────────────────────────────────────

/// Lifecycle of the stream connection.
///
/// `Closed` is terminal: it is entered only when the reconnect budget is
/// spent, and nothing leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting {
        attempt: u32,
    },
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Exponential backoff configuration for stream reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Consecutive failed reconnect attempts tolerated before the
    /// connection is declared `Closed`. Default: 10.
    pub max_retries: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: 10,
        }
    }
}

// ── FrameSink ────────────────────────────────────────────────────────

/// Something that accepts outbound text frames.
///
/// The request correlator sends through this seam, so it never depends on
/// a concrete socket.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: String) -> Result<(), Error>;
}

// ── WebSocketHandle ──────────────────────────────────────────────────

/// Handle to the running connection task.
///
/// Cloning is cheap; every clone shares the same socket. Call
/// [`shutdown`](Self::shutdown) (or cancel the token passed to
/// [`spawn`](Self::spawn)) to tear the task down.
#[derive(Clone)]
pub struct WebSocketHandle {
    outbound: mpsc::UnboundedSender<String>,
    state: watch::Receiver<ConnectionState>,
    max_retries: u32,
    cancel: CancellationToken,
}

impl WebSocketHandle {
    /// Spawn the connection loop.
    ///
    /// Returns immediately; the first connection attempt happens on the
    /// background task. Use [`wait_connected`](Self::wait_connected) to
    /// block until the socket is up.
    pub fn spawn(
        url: Url,
        reconnect: ReconnectConfig,
        session: Option<SecretString>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let handle = Self {
            outbound: outbound_tx,
            state: state_rx,
            max_retries: reconnect.max_retries,
            cancel: cancel.clone(),
        };

        let link = Link {
            url,
            session,
            state_tx,
            inbound_tx,
            outbound_rx,
            cancel,
        };
        tokio::spawn(ws_loop(link, reconnect));

        (handle, inbound_rx)
    }

    /// Queue a text frame for sending.
    ///
    /// Fails with [`Error::NotConnected`] unless the connection is
    /// currently `Connected`.
    pub fn send(&self, frame: String) -> Result<(), Error> {
        if *self.state.borrow() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        self.outbound.send(frame).map_err(|_| Error::NotConnected)
    }

    /// Current connection state.
    pub fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribe to connection state changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the connection is `Connected`.
    ///
    /// Returns [`Error::ReconnectExhausted`] if the connection reaches
    /// `Closed` first, and [`Error::NotConnected`] if the task was shut down.
    pub async fn wait_connected(&self) -> Result<(), Error> {
        let mut rx = self.state.clone();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closed => {
                    return Err(Error::ReconnectExhausted {
                        attempts: self.max_retries,
                    });
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(Error::NotConnected);
            }
        }
    }

    /// Signal the background task to shut down gracefully.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl FrameSink for WebSocketHandle {
    fn send_frame(&self, frame: String) -> Result<(), Error> {
        self.send(frame)
    }
}

impl fmt::Debug for WebSocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketHandle")
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

// ── Background reconnection loop ─────────────────────────────────────

/// Everything the background task owns.
struct Link {
    url: Url,
    session: Option<SecretString>,
    state_tx: watch::Sender<ConnectionState>,
    inbound_tx: mpsc::UnboundedSender<String>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
}

impl Link {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Stream state changed");
        }
    }

    /// Drop frames queued for a socket that no longer exists.
    fn discard_queued(&mut self) {
        let mut dropped = 0_usize;
        while self.outbound_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            tracing::warn!(dropped, "Discarding outbound frames queued before connection loss");
        }
    }
}

/// Main loop: connect → run → on error, backoff → reconnect.
///
/// `attempt` counts consecutive failed reconnects. After `max_retries` of
/// them the state becomes `Closed` and the task exits.
async fn ws_loop(mut link: Link, reconnect: ReconnectConfig) {
    let mut attempt: u32 = 0;

    loop {
        if link.cancel.is_cancelled() {
            break;
        }
        if attempt == 0 {
            link.set_state(ConnectionState::Connecting);
        }

        let cancel = link.cancel.clone();
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = connect_and_run(&mut link) => result,
        };

        let was_connected = *link.state_tx.borrow() == ConnectionState::Connected;
        link.discard_queued();
        if was_connected {
            attempt = 0;
        }

        let delay = match result {
            // Clean disconnect (server close frame or stream ended): the
            // budget resets, but the next dial still waits the base delay.
            Ok(()) => {
                tracing::info!("Stream disconnected cleanly, reconnecting");
                attempt = 0;
                calculate_backoff(0, &reconnect)
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt, "Stream connection error");

                if attempt >= reconnect.max_retries {
                    tracing::error!(
                        max_retries = reconnect.max_retries,
                        "Stream reconnection limit reached, giving up"
                    );
                    link.set_state(ConnectionState::Closed);
                    return;
                }

                let delay = calculate_backoff(attempt, &reconnect);
                attempt += 1;
                link.set_state(ConnectionState::Reconnecting { attempt });
                delay
            }
        };

        tracing::info!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            attempt,
            "Waiting before reconnect"
        );
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    link.set_state(ConnectionState::Disconnected);
    tracing::debug!("Stream loop exiting");
}

// ── Single connection lifecycle ──────────────────────────────────────

/// Establish one connection and pump frames until it drops.
///
/// The session token, when present, rides on the upgrade request as the
/// `X-Session` header.
async fn connect_and_run(link: &mut Link) -> Result<(), Error> {
    tracing::info!(url = %link.url, "Connecting to stream");

    let uri: tungstenite::http::Uri = link
        .url
        .as_str()
        .parse()
        .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()))?;

    let mut request = ClientRequestBuilder::new(uri);
    if let Some(ref session) = link.session {
        request = request.with_header(SESSION_HEADER, session.expose_secret());
    }

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

    link.set_state(ConnectionState::Connected);
    tracing::info!("Stream connected");

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            biased;
            () = link.cancel.cancelled() => {
                let _ = write.send(tungstenite::Message::Close(None)).await;
                return Ok(());
            }
            Some(frame) = link.outbound_rx.recv() => {
                tracing::trace!(len = frame.len(), "Stream send");
                write
                    .send(tungstenite::Message::Text(frame.into()))
                    .await
                    .map_err(|e| Error::WebSocketConnect(e.to_string()))?;
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        if link.inbound_tx.send(text.as_str().to_owned()).is_err() {
                            // Nobody is consuming frames any more.
                            link.cancel.cancel();
                            return Ok(());
                        }
                    }
                    Some(Ok(tungstenite::Message::Ping(_))) => {
                        // tungstenite handles pong replies automatically
                        tracing::trace!("Stream ping");
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        if let Some(ref cf) = frame {
                            tracing::info!(
                                code = %cf.code,
                                reason = %cf.reason,
                                "Stream close frame received"
                            );
                        } else {
                            tracing::info!("Stream close frame received (no payload)");
                        }
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        return Err(Error::WebSocketConnect(e.to_string()));
                    }
                    None => {
                        tracing::info!("Stream ended");
                        return Ok(());
                    }
                    _ => {
                        // Binary, Pong, Frame -- ignore
                    }
                }
            }
        }
    }
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) + jitter`
///
/// Jitter is +-25% to spread out reconnection storms from multiple clients.
fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
    let capped = base.min(config.max_delay.as_secs_f64());

    // Deterministic "jitter" seeded from the attempt number.
    let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    let with_jitter = (capped * jitter_factor).max(0.0);

    Duration::from_secs_f64(with_jitter)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_reconnect_config() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.max_retries, 10);
    }

    #[test]
    fn backoff_increases_exponentially() {
        let config = ReconnectConfig::default();

        let d0 = calculate_backoff(0, &config);
        let d1 = calculate_backoff(1, &config);
        let d2 = calculate_backoff(2, &config);

        assert!(d1 > d0, "d1 ({d1:?}) should be greater than d0 ({d0:?})");
        assert!(d2 > d1, "d2 ({d2:?}) should be greater than d1 ({d1:?})");
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_retries: 10,
        };

        let d10 = calculate_backoff(10, &config);
        // With jitter factor up to 1.25, max effective is 12.5s
        assert!(
            d10 <= Duration::from_millis(12_500),
            "delay at attempt 10 ({d10:?}) should be capped near max_delay"
        );
    }

    #[test]
    fn state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(
            ConnectionState::Reconnecting { attempt: 3 }.to_string(),
            "reconnecting (attempt 3)"
        );
    }

    #[tokio::test]
    async fn send_before_connect_is_rejected() {
        // Port 9 (discard) on localhost is never a WebSocket server.
        let url = Url::parse("ws://127.0.0.1:9/stream").unwrap();
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
            max_retries: 0,
        };
        let (handle, _inbound) = WebSocketHandle::spawn(url, config, None, CancellationToken::new());

        assert!(matches!(handle.send("{}".into()), Err(Error::NotConnected)));
        let err = handle.wait_connected().await.unwrap_err();
        assert!(matches!(err, Error::ReconnectExhausted { attempts: 0 }));
        assert_eq!(handle.current_state(), ConnectionState::Closed);
    }
}
