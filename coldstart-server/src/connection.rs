use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::ChatError;
use crate::messages::Signal;
use crate::model::UserId;
use crate::presence::ConnectionHandle;
use crate::state::{Delivery, ServerState};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

enum JoinOutcome {
    Joined(UserId),
    Rejected(ChatError),
    Gone,
}

/// Accept WebSocket clients on `listener` until the task is dropped.
pub async fn serve_live(listener: TcpListener, state: Arc<ServerState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!("New connection from {}", peer_addr);

                let state = state.clone();
                tokio::spawn(async move {
                    match accept_async(stream).await {
                        Ok(ws_stream) => handle_connection(ws_stream, state).await,
                        Err(e) => error!("WebSocket handshake failed for {}: {}", peer_addr, e),
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Drive one live connection from handshake to close.
pub async fn handle_connection(ws_stream: WebSocketStream<TcpStream>, state: Arc<ServerState>) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let user_id = match wait_for_join(&mut ws_receiver, &state).await {
        JoinOutcome::Joined(id) => id,
        JoinOutcome::Rejected(e) => {
            warn!("Join rejected: {}", e);
            reject(&mut ws_sender, e).await;
            return;
        }
        JoinOutcome::Gone => {
            warn!("Connection closed before join");
            return;
        }
    };

    // Outbound frames for this client, fed by presence broadcasts and deliveries
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let handle = ConnectionHandle::new(tx);
    let connection = handle.id();

    info!(user = %user_id, connection = %connection, "User joined");
    state.join(user_id.clone(), handle);

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            res = ws_receiver.next() => {
                match res {
                    Some(Ok(Message::Text(text))) => {
                        handle_signal(&text, &user_id, &state);
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("User {} sent close frame", user_id);
                        break;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error for user {}: {}", user_id, e);
                        break;
                    }
                    None => {
                        info!("WebSocket stream ended for user {}", user_id);
                        break;
                    }
                    _ => {}
                }
            }
            _ = &mut send_task => {
                info!("Send task finished for user {} (likely connection lost)", user_id);
                break;
            }
        }
    }

    // In-flight REST persistence is unaffected; only presence is torn down
    send_task.abort();
    state.leave(connection);
    info!(user = %user_id, connection = %connection, "Connection closed");
}

/// Wait for the `join` signal that binds this connection to a user.
async fn wait_for_join(receiver: &mut WsSource, state: &ServerState) -> JoinOutcome {
    let wait = async {
        while let Some(result) = receiver.next().await {
            let text = match result {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) | Err(_) => return JoinOutcome::Gone,
                Ok(_) => continue,
            };
            match serde_json::from_str::<Signal>(&text) {
                Ok(Signal::Join { user_id, token }) => {
                    return match state.authorize_join(&user_id, token.as_deref()) {
                        Ok(user) => JoinOutcome::Joined(user),
                        Err(e) => JoinOutcome::Rejected(e),
                    };
                }
                Ok(other) => debug!("Ignoring {:?} before join", other),
                Err(e) => warn!("Failed to parse signal before join: {}", e),
            }
        }
        JoinOutcome::Gone
    };

    match tokio::time::timeout(state.join_timeout(), wait).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!("Join timeout");
            JoinOutcome::Gone
        }
    }
}

async fn reject(sender: &mut WsSink, reason: ChatError) {
    let frame = Signal::Error {
        message: reason.to_string(),
    }
    .to_frame();
    if let Ok(frame) = frame {
        let _ = sender.send(Message::Text(frame)).await;
    }
    let _ = sender.send(Message::Close(None)).await;
}

/// Handle one frame from a joined connection.
///
/// Returns the delivery outcome for `send` signals and `None` for anything
/// that was ignored.
pub fn handle_signal(text: &str, sender: &UserId, state: &ServerState) -> Option<Delivery> {
    let signal: Signal = match serde_json::from_str(text) {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to parse signal from {}: {}", sender, e);
            return None;
        }
    };

    match signal {
        Signal::Send {
            sender_id,
            receiver_id,
            content,
        } => {
            // The joined identity always wins over what the client claims
            if sender_id.trim() != sender.as_str() {
                warn!(claimed = %sender_id, actual = %sender, "Overriding spoofed sender id");
            }
            let receiver = match UserId::parse(&receiver_id) {
                Ok(r) => r,
                Err(e) => {
                    warn!("Dropping send from {}: {}", sender, e);
                    return None;
                }
            };
            if content.trim().is_empty() {
                warn!("Dropping blank send from {}", sender);
                return None;
            }
            Some(state.deliver_live(sender, &receiver, &content))
        }
        Signal::Join { .. } => {
            debug!("User {} is already joined, ignoring join", sender);
            None
        }
        Signal::OnlineUsers { .. } | Signal::Receive { .. } | Signal::Error { .. } => {
            // Server-only signals, ignore from client
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    fn joined(state: &ServerState, user: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.join(uid(user), ConnectionHandle::new(tx));
        while rx.try_recv().is_ok() {}
        rx
    }

    #[test]
    fn test_send_routes_to_receiver() {
        let state = ServerState::new();
        let mut rx = joined(&state, "bob");

        let frame = r#"{"type":"send","senderId":"alice","receiverId":"bob","content":"hi"}"#;
        assert_eq!(
            handle_signal(frame, &uid("alice"), &state),
            Some(Delivery::Delivered)
        );

        let received: Signal = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert!(matches!(received, Signal::Receive { ref content, .. } if content == "hi"));
    }

    #[test]
    fn test_send_overrides_spoofed_sender() {
        let state = ServerState::new();
        let mut rx = joined(&state, "victim");

        let frame = r#"{"type":"send","senderId":"admin","receiverId":"victim","content":"Click this link"}"#;
        handle_signal(frame, &uid("attacker"), &state);

        match serde_json::from_str::<Signal>(&rx.try_recv().unwrap()).unwrap() {
            Signal::Receive { sender_id, .. } => assert_eq!(sender_id, "attacker"),
            other => panic!("Expected Receive, got {:?}", other),
        }
    }

    #[test]
    fn test_send_to_offline_receiver_is_silent() {
        let state = ServerState::new();
        let mut alice_rx = joined(&state, "alice");

        let frame = r#"{"type":"send","senderId":"alice","receiverId":"carol","content":"hi"}"#;
        assert_eq!(
            handle_signal(frame, &uid("alice"), &state),
            Some(Delivery::Missed)
        );
        // Nothing echoed back, no error frame either
        assert!(alice_rx.try_recv().is_err());
    }

    #[test]
    fn test_invalid_sends_are_dropped() {
        let state = ServerState::new();
        let mut rx = joined(&state, "bob");

        let blank = r#"{"type":"send","senderId":"alice","receiverId":"bob","content":"   "}"#;
        let bad_receiver = r#"{"type":"send","senderId":"alice","receiverId":"","content":"hi"}"#;
        assert_eq!(handle_signal(blank, &uid("alice"), &state), None);
        assert_eq!(handle_signal(bad_receiver, &uid("alice"), &state), None);
        assert_eq!(handle_signal("not json", &uid("alice"), &state), None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_server_only_signals_are_ignored() {
        let state = ServerState::new();
        let mut rx = joined(&state, "bob");

        let frames = [
            r#"{"type":"onlineUsers","users":["x"]}"#,
            r#"{"type":"receive","senderId":"x","content":"c","createdAt":"2024-01-01T00:00:00Z"}"#,
            r#"{"type":"error","message":"nope"}"#,
            r#"{"type":"join","userId":"mallory"}"#,
        ];
        for frame in frames {
            assert_eq!(handle_signal(frame, &uid("alice"), &state), None);
        }
        assert!(rx.try_recv().is_err());
        assert!(state.presence().lookup(&uid("mallory")).is_none());
    }
}
