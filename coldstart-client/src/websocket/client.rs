use super::messages::Signal;
use crate::error::ClientError;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex as TokioMutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const EVENT_BUFFER: usize = 256;

/// Internal message type for the write channel
enum WriteMessage {
    Data(String),
    Close,
}

/// Live channel connection with automatic reconnect.
///
/// Every incoming signal is fanned out to subscribers; `join` is re-sent
/// after each reconnect so presence comes back on its own.
pub struct LiveClient {
    server_url: String,
    reconnect_delay: Duration,
    /// Sync mutex so `send` can be called from non-async code
    write_tx: Arc<StdMutex<Option<mpsc::UnboundedSender<WriteMessage>>>>,
    connected: Arc<TokioMutex<bool>>,
    events_tx: broadcast::Sender<Signal>,
    /// Shutdown signal broadcaster
    shutdown_tx: broadcast::Sender<()>,
}

impl LiveClient {
    pub fn new(server_url: impl Into<String>, reconnect_delay: Duration) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            server_url: server_url.into(),
            reconnect_delay,
            write_tx: Arc::new(StdMutex::new(None)),
            connected: Arc::new(TokioMutex::new(false)),
            events_tx,
            shutdown_tx,
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Check if connected to server
    pub async fn is_connected(&self) -> bool {
        *self.connected.lock().await
    }

    /// Receive every signal the server pushes from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.events_tx.subscribe()
    }

    /// Start the connect/join/reconnect loop in the background.
    pub fn connect(&self, user_id: &str, token: Option<String>) {
        let server_url = self.server_url.clone();
        let reconnect_delay = self.reconnect_delay;
        let user_id = user_id.to_string();
        let write_tx = self.write_tx.clone();
        let connected = self.connected.clone();
        let events_tx = self.events_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                // Check for shutdown before attempting connection
                if shutdown_rx.try_recv().is_ok() {
                    info!("Shutdown signal received, stopping reconnection");
                    break;
                }

                info!(url = %server_url, "Connecting to ColdStart live channel");

                match connect_async(&server_url).await {
                    Ok((ws_stream, _)) => {
                        let (mut ws_write, mut ws_read) = ws_stream.split();

                        let join = Signal::Join {
                            user_id: user_id.clone(),
                            token: token.clone(),
                        };
                        let sent = match serde_json::to_string(&join) {
                            Ok(json) => ws_write.send(Message::Text(json)).await.is_ok(),
                            Err(e) => {
                                error!(error = %e, "Failed to serialize join");
                                false
                            }
                        };
                        if !sent {
                            error!("Failed to send join");
                            tokio::time::sleep(reconnect_delay).await;
                            continue;
                        }

                        info!(user = %user_id, "Joined live channel");
                        *connected.lock().await = true;

                        // Create channel for outgoing messages
                        let (tx, mut rx) = mpsc::unbounded_channel::<WriteMessage>();
                        if let Ok(mut guard) = write_tx.lock() {
                            *guard = Some(tx);
                        }

                        // Message loop
                        let mut should_reconnect = true;
                        loop {
                            tokio::select! {
                                _ = shutdown_rx.recv() => {
                                    info!("Shutdown signal received, closing connection gracefully");
                                    if let Err(e) = ws_write.send(Message::Close(None)).await {
                                        warn!(error = %e, "Failed to send close frame");
                                    }
                                    should_reconnect = false;
                                    break;
                                }
                                Some(msg) = rx.recv() => {
                                    match msg {
                                        WriteMessage::Data(data) => {
                                            if ws_write.send(Message::Text(data)).await.is_err() {
                                                error!("Failed to send message to server");
                                                break;
                                            }
                                        }
                                        WriteMessage::Close => {
                                            info!("Close requested, sending close frame");
                                            if let Err(e) = ws_write.send(Message::Close(None)).await {
                                                warn!(error = %e, "Failed to send close frame");
                                            }
                                            should_reconnect = false;
                                            break;
                                        }
                                    }
                                }
                                msg = ws_read.next() => {
                                    match msg {
                                        Some(Ok(Message::Text(text))) => {
                                            match serde_json::from_str::<Signal>(&text) {
                                                Ok(Signal::Error { message }) => {
                                                    warn!(%message, "Server reported an error");
                                                }
                                                Ok(signal) => {
                                                    // No subscribers is fine
                                                    let _ = events_tx.send(signal);
                                                }
                                                Err(e) => {
                                                    debug!(error = %e, "Ignoring unknown frame");
                                                }
                                            }
                                        }
                                        Some(Ok(Message::Close(_))) | None => {
                                            info!("Server closed connection");
                                            break;
                                        }
                                        Some(Err(e)) => {
                                            error!(error = %e, "WebSocket error");
                                            break;
                                        }
                                        _ => {}
                                    }
                                }
                            }
                        }

                        // Cleanup
                        if let Ok(mut guard) = write_tx.lock() {
                            *guard = None;
                        }
                        *connected.lock().await = false;
                        info!("Disconnected from live channel");

                        if !should_reconnect {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, url = %server_url, "Failed to connect to live channel");
                    }
                }

                debug!(delay = ?reconnect_delay, "Reconnecting");
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Shutdown signal received, stopping reconnection");
                        break;
                    }
                    _ = tokio::time::sleep(reconnect_delay) => {}
                }
            }
        });
    }

    /// Gracefully disconnect and stop reconnecting
    pub fn disconnect(&self) {
        info!("Initiating graceful disconnect");
        let _ = self.shutdown_tx.send(());
        if let Ok(guard) = self.write_tx.lock() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(WriteMessage::Close);
            }
        }
    }

    /// Queue a signal for the server. Fails fast while disconnected.
    pub fn send(&self, signal: &Signal) -> Result<(), ClientError> {
        let json = serde_json::to_string(signal)
            .map_err(|e| ClientError::Validation(e.to_string()))?;
        let preview: String = json.chars().take(100).collect();
        debug!(%preview, "Sending signal to server");

        let guard = self.write_tx.lock().map_err(|_| ClientError::NotConnected)?;
        match guard.as_ref() {
            Some(tx) => tx
                .send(WriteMessage::Data(json))
                .map_err(|_| ClientError::NotConnected),
            None => {
                warn!("Cannot send signal: not connected to server");
                Err(ClientError::NotConnected)
            }
        }
    }
}

impl Drop for LiveClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}
