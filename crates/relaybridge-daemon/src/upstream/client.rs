//! Reconnecting WebSocket client to the upstream aggregator.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use relaybridge_core::Event;
use relaybridge_core::event::{Inbound, parse_inbound};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

use super::config::UpstreamConfig;
use super::error::UpstreamError;
use crate::registry::ConnectionRegistry;

/// Events buffered for the socket writer. Overflow drops the event.
const OUTBOUND_BUFFER: usize = 128;

/// Connection state of the upstream link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl LinkState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single outbound connection that mirrors every event upstream.
///
/// Only one connection attempt is ever in flight: [`UpstreamLink::run`] is a
/// single loop that connects, serves the socket, then sleeps out the
/// reconnect delay before trying again.
pub struct UpstreamLink {
    config: UpstreamConfig,
    registry: ConnectionRegistry,
    state: watch::Sender<LinkState>,
    outbound: RwLock<Option<mpsc::Sender<String>>>,
    command_sink: Option<mpsc::Sender<Value>>,
    attempts: AtomicU64,
}

impl UpstreamLink {
    pub fn new(config: UpstreamConfig, registry: ConnectionRegistry) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            config,
            registry,
            state,
            outbound: RwLock::new(None),
            command_sink: None,
            attempts: AtomicU64::new(0),
        }
    }

    /// Also hand upstream `command` payloads to `sink`.
    #[must_use]
    pub fn with_command_sink(mut self, sink: mpsc::Sender<Value>) -> Self {
        self.command_sink = Some(sink);
        self
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Total connection attempts made so far.
    pub fn connection_attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Forward an event upstream.
    ///
    /// Best effort: returns `false` and drops the event unless the link is
    /// connected. Events are never queued across reconnects.
    pub async fn send(&self, event: &Event) -> bool {
        if self.state() != LinkState::Connected {
            return false;
        }
        let Some(tx) = self.outbound.read().await.clone() else {
            return false;
        };
        let json = match event.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, kind = %event.kind(), "Failed to serialize event");
                return false;
            }
        };
        match tx.try_send(json) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Upstream link is lagging, event dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Upstream connection is closing, event dropped");
                false
            }
        }
    }

    /// Run the link with automatic reconnection until `shutdown` fires or
    /// the retry budget is exhausted.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                info!("Upstream link shutting down");
                return;
            }

            let mut connected = false;
            let result = self.connect_and_run(&mut shutdown, &mut connected).await;
            self.teardown().await;

            match result {
                Ok(()) => {
                    info!("Upstream link closed for shutdown");
                    return;
                }
                Err(e) => {
                    // A connection that got through resets the backoff.
                    if connected {
                        attempt = 0;
                    }

                    if !self.config.reconnect.should_retry(attempt) {
                        error!(error = %e, attempt, "Max reconnect attempts reached");
                        return;
                    }

                    let delay = self.config.reconnect.delay_for_attempt(attempt);
                    warn!(error = %e, attempt, delay_ms = delay.as_millis(), "Reconnecting to upstream");

                    tokio::select! {
                        () = sleep(delay) => {}
                        _ = shutdown.changed() => {
                            info!("Upstream link shutting down during reconnect wait");
                            return;
                        }
                    }

                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Connect and serve one upstream connection until it fails or shutdown.
    async fn connect_and_run(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        connected: &mut bool,
    ) -> Result<(), UpstreamError> {
        self.state.send_replace(LinkState::Connecting);
        self.attempts.fetch_add(1, Ordering::Relaxed);
        debug!(url = %self.config.url, "Connecting to upstream");

        let connecting = connect_async(self.config.url.as_str());
        let (socket, _response) = tokio::select! {
            result = connecting => result.map_err(|e| match e {
                tungstenite::Error::Url(e) => UpstreamError::InvalidUrl(e.to_string()),
                other => UpstreamError::Connection(other.to_string()),
            })?,
            _ = shutdown.changed() => return Ok(()),
        };

        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
        *self.outbound.write().await = Some(tx);
        self.state.send_replace(LinkState::Connected);
        *connected = true;
        info!(url = %self.config.url, "Upstream link connected");

        loop {
            tokio::select! {
                Some(text) = rx.recv() => {
                    sink.send(Message::Text(text.into()))
                        .await
                        .map_err(|e| UpstreamError::Stream(e.to_string()))?;
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_inbound(text.as_str()).await,
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => self.handle_inbound(text).await,
                        Err(_) => debug!(len = bytes.len(), "Ignoring non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        info!(frame = ?frame, "Upstream sent close frame");
                        return Err(UpstreamError::Closed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(UpstreamError::Stream(e.to_string())),
                    None => return Err(UpstreamError::Closed),
                },
                _ = shutdown.changed() => {
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        debug!(error = %e, "Failed to send close frame upstream");
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn teardown(&self) {
        *self.outbound.write().await = None;
        self.state.send_replace(LinkState::Disconnected);
    }

    async fn handle_inbound(&self, text: &str) {
        match parse_inbound(text) {
            Inbound::Command { command } => {
                info!(command = %command, "Received command from upstream");
                if let Some(sink) = &self.command_sink
                    && let Err(e) = sink.try_send(command)
                {
                    warn!(error = %e, "Dropping upstream command");
                }
            }
            Inbound::Forward(message) => {
                self.registry.route_to_controller(message).await;
            }
        }
    }
}
