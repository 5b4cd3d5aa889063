//! End-to-end tests: the real server (REST and live channel) in-process,
//! driven through `ChatSession`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use coldstart_client::{ChatSession, ClientConfig, ClientError, SendOutcome};
use coldstart_server::api::{self, ApiState};
use coldstart_server::auth::AuthKey;
use coldstart_server::model::UserId;
use coldstart_server::store::MessageStore;
use coldstart_server::{serve_live, ServerState};
use tokio::net::TcpListener;

const SECRET: &str = "end-to-end-secret";

/// Live channel on its own runtime so that stopping it drops every socket.
struct LiveServer {
    runtime: Option<tokio::runtime::Runtime>,
}

impl LiveServer {
    fn start(addr: SocketAddr, key: AuthKey) -> (Self, SocketAddr) {
        let listener = std::net::TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        runtime.spawn(async move {
            let listener = TcpListener::from_std(listener).unwrap();
            serve_live(listener, Arc::new(ServerState::new().with_auth(key))).await;
        });

        (
            Self {
                runtime: Some(runtime),
            },
            addr,
        )
    }

    /// Returns once every task, and with it every socket, is gone.
    async fn stop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            tokio::task::spawn_blocking(move || runtime.shutdown_timeout(Duration::from_secs(5)))
                .await
                .unwrap();
        }
    }
}

impl Drop for LiveServer {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

struct TestServer {
    api_url: String,
    ws_url: String,
    ws_addr: SocketAddr,
    key: AuthKey,
    live: LiveServer,
    http_task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Self {
        let key = AuthKey::new(SECRET);

        let http = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let api_url = format!("http://{}", http.local_addr().unwrap());

        let app = api::router(ApiState {
            store: MessageStore::open_in_memory().unwrap(),
            auth: key.clone(),
        });
        let http_task = tokio::spawn(async move {
            axum::serve(http, app).await.unwrap();
        });

        let (live, ws_addr) = LiveServer::start("127.0.0.1:0".parse().unwrap(), key.clone());

        Self {
            api_url,
            ws_url: format!("ws://{}", ws_addr),
            ws_addr,
            key,
            live,
            http_task,
        }
    }

    /// Kill the live channel, dropping all connections, and bring it back
    /// on the same port with empty presence.
    async fn restart_live(&mut self) {
        self.live.stop().await;
        let (live, _) = LiveServer::start(self.ws_addr, self.key.clone());
        self.live = live;
    }

    fn config(&self) -> ClientConfig {
        ClientConfig::new(&self.api_url, &self.ws_url)
    }

    async fn session(&self, user: &str) -> ChatSession {
        self.session_with(self.config(), user).await
    }

    async fn session_with(&self, config: ClientConfig, user: &str) -> ChatSession {
        let token = self.key.issue(&UserId::parse(user).unwrap());
        ChatSession::connect(config, user, &token).await.unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.http_task.abort();
    }
}

/// Poll `check` until it holds or five seconds pass.
async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("Timed out waiting for {}", what);
}

fn contents(session: &ChatSession) -> Vec<String> {
    session.view().into_iter().map(|e| e.content).collect()
}

#[tokio::test]
async fn test_message_reaches_online_peer_and_history() {
    let server = TestServer::start().await;
    let alice = server.session("alice").await;
    let bob = server.session("bob").await;

    alice.open("bob").await.unwrap();
    bob.open("alice").await.unwrap();

    let outcome = alice.send("hello bob").await.unwrap();
    let saved = match outcome {
        SendOutcome::Saved(message) => message,
        SendOutcome::DeliveredNotSaved(e) => panic!("Save failed: {}", e),
    };
    assert_eq!(saved.sender, "alice");
    assert_eq!(saved.conversation_key, "alice_bob");

    eventually("live delivery to bob", || contents(&bob) == vec!["hello bob"]).await;
    let entry = &bob.view()[0];
    assert_eq!(entry.sender_id, "alice");

    // Reopening replaces the live copy with the stored one
    bob.open("alice").await.unwrap();
    let history = bob.view();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].created_at, saved.created_at);
}

#[tokio::test]
async fn test_offline_receiver_gets_message_from_history() {
    let server = TestServer::start().await;
    let alice = server.session("alice").await;

    alice.open("carol").await.unwrap();
    assert!(!alice.is_online("carol"));
    assert!(matches!(
        alice.send("are you there?").await.unwrap(),
        SendOutcome::Saved(_)
    ));

    let carol = server.session("carol").await;
    carol.open("alice").await.unwrap();
    assert_eq!(contents(&carol), vec!["are you there?"]);
}

#[tokio::test]
async fn test_sender_sees_optimistic_echo_exactly_once() {
    let server = TestServer::start().await;
    let alice = server.session("alice").await;
    let _bob = server.session("bob").await;

    alice.open("bob").await.unwrap();
    alice.send("first").await.unwrap();
    alice.send("second").await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(contents(&alice), vec!["first", "second"]);
    assert!(alice.view().iter().all(|e| e.sender_id == "alice"));
}

#[tokio::test]
async fn test_failed_save_still_delivers_live() {
    let server = TestServer::start().await;

    // A port nobody listens on
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_url = format!("http://{}", dead.local_addr().unwrap());
    drop(dead);

    let broken = ClientConfig::new(dead_url, &server.ws_url);
    let alice = server.session_with(broken, "alice").await;
    let bob = server.session("bob").await;
    bob.open("alice").await.unwrap();

    // History is unreachable but the conversation is still open
    assert!(matches!(
        alice.open("bob").await,
        Err(ClientError::Transport(_))
    ));
    assert_eq!(alice.peer().as_deref(), Some("bob"));

    let outcome = alice.send("live only").await.unwrap();
    assert!(matches!(outcome, SendOutcome::DeliveredNotSaved(_)));
    assert_eq!(contents(&alice), vec!["live only"]);

    eventually("live delivery to bob", || contents(&bob) == vec!["live only"]).await;

    // Nothing was persisted
    bob.open("alice").await.unwrap();
    assert!(bob.view().is_empty());
}

#[tokio::test]
async fn test_view_ignores_other_conversations() {
    let server = TestServer::start().await;
    let bob = server.session("bob").await;
    let alice = server.session("alice").await;
    let carol = server.session("carol").await;

    bob.open("alice").await.unwrap();
    carol.open("bob").await.unwrap();
    alice.open("bob").await.unwrap();

    carol.send("psst").await.unwrap();
    alice.send("hi bob").await.unwrap();

    eventually("alice's message", || contents(&bob) == vec!["hi bob"]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(contents(&bob), vec!["hi bob"]);

    // Switching peers re-scopes the listener and loads carol's history
    bob.open("carol").await.unwrap();
    assert_eq!(contents(&bob), vec!["psst"]);

    alice.send("still there?").await.unwrap();
    carol.send("over here").await.unwrap();
    eventually("carol's message", || contents(&bob) == vec!["psst", "over here"]).await;
}

#[tokio::test]
async fn test_online_users_follow_presence() {
    let server = TestServer::start().await;
    let alice = server.session("alice").await;
    assert!(alice.is_online("alice"));

    let bob = server.session("bob").await;
    eventually("bob online", || alice.is_online("bob")).await;
    assert_eq!(
        alice.online_users().into_iter().collect::<Vec<_>>(),
        vec!["alice", "bob"]
    );

    drop(bob);
    eventually("bob offline", || !alice.is_online("bob")).await;
}

#[tokio::test]
async fn test_opening_marks_peer_messages_read() {
    let server = TestServer::start().await;
    let alice = server.session("alice").await;
    alice.open("bob").await.unwrap();
    alice.send("unread").await.unwrap();

    let bob = server.session("bob").await;
    bob.open("alice").await.unwrap();

    // Seen from alice's side after bob opened the conversation
    let api = coldstart_client::rest::ChatApi::new(
        &server.api_url,
        &server.key.issue(&UserId::parse("alice").unwrap()),
    )
    .unwrap();
    let history = api.history("bob").await.unwrap();
    assert!(history.iter().all(|m| m.read));
}

#[tokio::test]
async fn test_send_requires_open_conversation() {
    let server = TestServer::start().await;
    let alice = server.session("alice").await;

    assert!(matches!(
        alice.send("nowhere").await,
        Err(ClientError::NoConversation)
    ));
    alice.open("bob").await.unwrap();
    assert!(matches!(
        alice.send("   ").await,
        Err(ClientError::Validation(_))
    ));
    assert!(alice.view().is_empty());
}

#[tokio::test]
async fn test_join_with_wrong_token_fails() {
    let server = TestServer::start().await;
    let forged = AuthKey::new("not-the-secret").issue(&UserId::parse("alice").unwrap());

    let mut config = server.config();
    config.join_timeout = Duration::from_millis(500);
    let result = ChatSession::connect(config, "alice", &forged).await;
    assert!(matches!(result, Err(ClientError::NotConnected)));
}

#[tokio::test]
async fn test_session_rejoins_after_live_channel_restart() {
    let mut server = TestServer::start().await;
    let fast = || server.config().with_reconnect_delay(Duration::from_millis(100));

    let alice = server.session_with(fast(), "alice").await;
    let bob = server.session_with(fast(), "bob").await;
    alice.open("bob").await.unwrap();
    bob.open("alice").await.unwrap();

    server.restart_live().await;

    // Fresh presence on the new listener only knows users that re-joined
    let carol = server.session("carol").await;
    eventually("alice and bob to re-join", || {
        carol.is_online("alice") && carol.is_online("bob")
    })
    .await;
    eventually("alice to see carol", || alice.is_online("carol")).await;
    assert!(alice.is_online("alice"));
    assert!(alice.is_connected().await);

    bob.send("back again").await.unwrap();
    eventually("live delivery after reconnect", || {
        contents(&alice) == vec!["back again"]
    })
    .await;
}

#[tokio::test]
async fn test_ids_are_sent_as_single_path_segments() {
    let server = TestServer::start().await;
    let alice = server.session("alice").await;

    // Reaches the history route with an id the server refuses
    match alice.open("bob/../read?x").await {
        Err(ClientError::Status { status, .. }) => assert_eq!(status, 400),
        other => panic!("Expected a 400, got {:?}", other),
    }
}
