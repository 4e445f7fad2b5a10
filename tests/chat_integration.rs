//! Integration tests for the chat session against an in-memory server.

use async_trait::async_trait;
use mockall::mock;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use securechat_lib::crypto::{ConversationKeyStore, MessageCipher};
use securechat_lib::error::{ChatError, Result};
use securechat_lib::services::chat_types::*;
use securechat_lib::services::lock_gate::UnlockRequest;
use securechat_lib::services::{
    ChatApi, ChatSession, ChatSettings, FaceVerifier, LockState, PushConnection, PushEvent,
    PushTransport, SendRequest, SessionCommand, SessionDeps,
};

mock! {
    pub Verifier {}

    #[async_trait]
    impl FaceVerifier for Verifier {
        async fn verify(&self, face_image: Option<String>) -> Result<bool>;
    }
}

// ── In-memory chat server ─────────────────────────────────────

#[derive(Default)]
struct ServerState {
    messages: Vec<ServerMessage>,
    next_id: i64,
    fail_sends: bool,
    /// Return the stored message in the HTTP send response.
    echo_in_response: bool,
}

/// Stores messages for one logged-in user. Like the real server, `new_message`
/// is only pushed to the recipient, never echoed to the sender's socket.
struct FakeServer {
    user_id: String,
    state: Mutex<ServerState>,
    push: Mutex<Option<mpsc::UnboundedSender<PushEvent>>>,
}

impl FakeServer {
    fn new(user_id: &str, first_id: i64) -> Arc<Self> {
        Arc::new(Self {
            user_id: user_id.to_string(),
            state: Mutex::new(ServerState {
                next_id: first_id,
                ..Default::default()
            }),
            push: Mutex::new(None),
        })
    }

    fn store(
        &self,
        sender: &str,
        recipient: &str,
        content: &str,
        locked: bool,
        encrypted: bool,
    ) -> ServerMessage {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        let message: ServerMessage = serde_json::from_value(serde_json::json!({
            "id": id,
            "user_id": sender,
            "recipient_id": recipient,
            "content": content,
            "timestamp": "2024-03-01 10:00:00",
            "is_face_locked": locked,
            "is_encrypted": encrypted,
            "author": {"id": sender, "username": sender}
        }))
        .unwrap();
        state.messages.push(message.clone());
        message
    }

    fn broadcast(&self, message: &ServerMessage) {
        if let Some(tx) = self.push.lock().unwrap().as_ref() {
            let _ = tx.send(PushEvent::Event {
                name: "new_message".into(),
                payload: serde_json::to_value(message).unwrap(),
            });
        }
    }

    fn connect_push(self: &Arc<Self>) -> (PushConnection, mpsc::UnboundedSender<PushEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.push.lock().unwrap() = Some(tx.clone());
        let transport = Arc::new(FakePush {
            server: self.clone(),
        });
        (PushConnection::new(transport, rx), tx)
    }

    fn set(&self, f: impl FnOnce(&mut ServerState)) {
        f(&mut self.state.lock().unwrap());
    }

    fn sent_count(&self) -> usize {
        self.state.lock().unwrap().messages.len()
    }
}

#[async_trait]
impl ChatApi for FakeServer {
    async fn send_message(&self, message: &OutgoingMessage) -> Result<SendResponse> {
        let (fail, echo) = {
            let s = self.state.lock().unwrap();
            (s.fail_sends, s.echo_in_response)
        };
        if fail {
            return Err(ChatError::DeliveryFailure("server unavailable".into()));
        }
        let stored = self.store(
            &self.user_id,
            &message.recipient_id,
            &message.content,
            message.is_face_locked,
            message.is_encrypted,
        );
        Ok(SendResponse {
            success: true,
            message: Some(if echo {
                serde_json::to_value(&stored).unwrap()
            } else {
                serde_json::json!("Message sent")
            }),
        })
    }

    async fn fetch_messages(&self, _recipient_id: &str) -> Result<Vec<ServerMessage>> {
        Ok(self.state.lock().unwrap().messages.clone())
    }
}

struct FakePush {
    server: Arc<FakeServer>,
}

#[async_trait]
impl PushTransport for FakePush {
    async fn emit(&self, _event: &str, payload: serde_json::Value) -> Result<()> {
        let content = payload["content"].as_str().unwrap_or_default().to_string();
        let recipient = payload["recipient_id"].as_str().unwrap_or_default().to_string();
        self.server.store(
            &self.server.user_id,
            &recipient,
            &content,
            payload["is_face_locked"].as_bool().unwrap_or(false),
            payload["is_encrypted"].as_bool().unwrap_or(false),
        );
        Ok(())
    }

    async fn close(&self) {}
}

// ── Helpers ───────────────────────────────────────────────────

fn settings(user: &str, other: &str) -> ChatSettings {
    ChatSettings {
        user_id: user.into(),
        recipient_id: other.into(),
        ..Default::default()
    }
}

async fn start(
    user: &str,
    other: &str,
    server: &Arc<FakeServer>,
    push: Option<PushConnection>,
    verifier: MockVerifier,
) -> (ChatSession, mpsc::UnboundedReceiver<ViewUpdate>) {
    ChatSession::start(
        &settings(user, other),
        SessionDeps {
            api: server.clone(),
            push,
            verifier: Arc::new(verifier),
        },
    )
    .await
    .unwrap()
}

async fn drive_until(session: &mut ChatSession, done: impl Fn(&ChatSession) -> bool) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while !done(session) {
            assert!(session.process_next().await, "session stream ended");
        }
    })
    .await
    .expect("condition not reached");
}

fn drain(view: &mut mpsc::UnboundedReceiver<ViewUpdate>) -> Vec<ViewUpdate> {
    let mut updates = Vec::new();
    while let Ok(update) = view.try_recv() {
        updates.push(update);
    }
    updates
}

fn text(body: &str) -> SendRequest {
    SendRequest {
        text: body.into(),
        face_locked: false,
        encrypted: true,
        attachment: None,
    }
}

fn encrypt_for(a: &str, b: &str, plaintext: &str) -> String {
    let key = ConversationKeyStore::default().key_for(a, b).unwrap();
    MessageCipher::new().encrypt_to_wire(plaintext, &key).unwrap()
}

// ── Tests ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_alice_hello_confirmed_in_place() {
    let server = FakeServer::new("alice", 7);
    let (push, push_tx) = server.connect_push();
    let (mut session, mut view) =
        start("alice", "bob", &server, Some(push), MockVerifier::new()).await;

    push_tx.send(PushEvent::Connected).unwrap();
    assert!(session.process_next().await);
    assert!(session.channel().is_connected().await);

    let temp_id = session.send_message(text("hello")).unwrap();
    let local = &session.messages()[0];
    assert_eq!(local.temp_id(), Some(&temp_id));
    assert_eq!(local.sender_label, "You");
    assert_eq!(local.status, DeliveryStatus::Unconfirmed);

    drive_until(&mut session, |s| s.messages()[0].id().is_some()).await;

    assert_eq!(session.messages().len(), 1);
    let record = &session.messages()[0];
    assert_eq!(record.id(), Some(&MessageId::from(7)));
    assert_eq!(record.body.display(), "hello");
    assert_eq!(record.sender_label, "You");
    assert_eq!(record.status, DeliveryStatus::Confirmed);

    // Ciphertext went over the wire
    let stored = server.state.lock().unwrap().messages[0].clone();
    assert_ne!(stored.content, "hello");
    assert!(stored.content.contains(':'));

    let updates = drain(&mut view);
    assert!(updates
        .iter()
        .any(|u| matches!(u, ViewUpdate::Inserted { index: 0, message } if message.temp_id().is_some())));
    assert!(updates
        .iter()
        .any(|u| matches!(u, ViewUpdate::Promoted { index: 0, message } if message.id() == Some(&MessageId::from(7)))));

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_poll_then_push_delivers_one_record() {
    let server = FakeServer::new("alice", 40);
    let (push, push_tx) = server.connect_push();
    let (mut session, _view) =
        start("alice", "bob", &server, Some(push), MockVerifier::new()).await;

    // Push not connected: HTTP send, confirmation comes from the next poll
    session.send_message(text("are you there?")).unwrap();
    drive_until(&mut session, |s| s.messages()[0].id().is_some()).await;
    assert_eq!(server.sent_count(), 1);
    assert!(session.channel().state().await.polling);

    // Push reconnects and stops polling
    push_tx.send(PushEvent::Connected).unwrap();
    while !session.channel().is_connected().await {
        assert!(session.process_next().await);
    }
    assert!(!session.channel().state().await.polling);

    // The same message arrives again over push
    let stored = server.state.lock().unwrap().messages[0].clone();
    server.broadcast(&stored);
    while let Ok(true) = tokio::time::timeout(Duration::from_secs(1), session.process_next()).await {}

    assert_eq!(session.messages().len(), 1);
    assert_eq!(session.messages()[0].id(), Some(&MessageId::from(40)));
    assert_eq!(session.messages()[0].status, DeliveryStatus::Confirmed);
    assert!(!session.channel().state().await.polling);
    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_push_send_confirmed_without_sender_echo() {
    let server = FakeServer::new("alice", 21);
    let (push, push_tx) = server.connect_push();
    let (mut session, _view) =
        start("alice", "bob", &server, Some(push), MockVerifier::new()).await;
    push_tx.send(PushEvent::Connected).unwrap();
    assert!(session.process_next().await);
    assert!(!session.channel().state().await.polling);

    session.send_message(text("did it land?")).unwrap();
    drive_until(&mut session, |s| s.messages()[0].id().is_some()).await;

    assert_eq!(server.sent_count(), 1);
    assert_eq!(session.messages().len(), 1);
    let record = &session.messages()[0];
    assert_eq!(record.id(), Some(&MessageId::from(21)));
    assert_eq!(record.body.display(), "did it land?");
    assert_eq!(record.status, DeliveryStatus::Confirmed);
    assert!(!session.channel().state().await.polling);
    session.shutdown().await;
}

#[tokio::test]
async fn test_bob_reads_encrypted_history() {
    let server = FakeServer::new("bob", 1);
    server.store(
        "alice",
        "bob",
        &encrypt_for("alice", "bob", "hello bob"),
        false,
        true,
    );
    let (mut session, _view) = start("bob", "alice", &server, None, MockVerifier::new()).await;

    session.load_history();
    drive_until(&mut session, |s| !s.messages().is_empty()).await;

    let record = &session.messages()[0];
    assert_eq!(record.body.display(), "hello bob");
    assert_eq!(record.sender_label, "alice");
    assert!(!record.is_outgoing);
    assert_eq!(record.status, DeliveryStatus::Confirmed);
    session.shutdown().await;
}

#[tokio::test]
async fn test_wrong_key_renders_placeholder() {
    let server = FakeServer::new("bob", 1);
    server.store(
        "alice",
        "bob",
        &encrypt_for("alice", "mallory", "not for you"),
        false,
        true,
    );
    let (mut session, _view) = start("bob", "alice", &server, None, MockVerifier::new()).await;

    session.load_history();
    drive_until(&mut session, |s| !s.messages().is_empty()).await;
    assert_eq!(
        session.messages()[0].body.display(),
        "Error: Could not decrypt message"
    );
    session.shutdown().await;
}

#[tokio::test]
async fn test_face_locked_message_unlocks_after_retry() {
    let server = FakeServer::new("bob", 20);
    server.store(
        "alice",
        "bob",
        &encrypt_for("alice", "bob", "for your eyes only"),
        true,
        true,
    );

    let mut verifier = MockVerifier::new();
    let mut calls = 0;
    verifier.expect_verify().times(2).returning(move |_| {
        calls += 1;
        Ok(calls > 1)
    });
    let (mut session, mut view) = start("bob", "alice", &server, None, verifier).await;

    session.load_history();
    drive_until(&mut session, |s| !s.messages().is_empty()).await;
    let id = MessageId::from(20);
    assert_eq!(session.messages()[0].body, RenderedBody::Locked);
    assert_eq!(session.messages()[0].body.display(), LOCKED_PLACEHOLDER);
    assert_eq!(session.lock_state(&id), Some(LockState::Locked));

    assert_eq!(session.request_unlock(&id, None), UnlockRequest::Started);
    assert_eq!(session.request_unlock(&id, None), UnlockRequest::AlreadyVerifying);
    drive_until(&mut session, |s| s.lock_state(&id) == Some(LockState::Failed)).await;
    assert_eq!(session.messages()[0].body, RenderedBody::Locked);

    assert_eq!(
        session.request_unlock(&id, Some("data:image/jpeg;base64,AA==".into())),
        UnlockRequest::Started
    );
    drive_until(&mut session, |s| s.lock_state(&id) == Some(LockState::Unlocked)).await;
    assert_eq!(session.messages()[0].body.display(), "for your eyes only");
    assert_eq!(session.request_unlock(&id, None), UnlockRequest::AlreadyUnlocked);

    let updates = drain(&mut view);
    assert!(updates
        .iter()
        .any(|u| matches!(u, ViewUpdate::UnlockFailed { id: failed, .. } if failed == &id)));
    let revealed: Vec<_> = updates
        .iter()
        .filter(|u| matches!(u, ViewUpdate::Revealed { .. }))
        .collect();
    assert_eq!(revealed.len(), 1);
    session.shutdown().await;
}

#[tokio::test]
async fn test_own_locked_message_keeps_plaintext_after_confirmation() {
    let server = FakeServer::new("alice", 5);
    server.set(|s| s.echo_in_response = true);
    let (mut session, _view) = start("alice", "bob", &server, None, MockVerifier::new()).await;

    let mut request = text("only with a face");
    request.face_locked = true;
    session.send_message(request).unwrap();
    drive_until(&mut session, |s| s.messages()[0].id().is_some()).await;

    assert_eq!(session.messages().len(), 1);
    assert_eq!(session.messages()[0].body.display(), "only with a face");
    assert!(session.lock_state(&MessageId::from(5)).is_none());
    session.shutdown().await;
}

#[tokio::test]
async fn test_failed_delivery_can_be_retried() {
    let server = FakeServer::new("alice", 100);
    server.set(|s| s.fail_sends = true);
    let (mut session, mut view) =
        start("alice", "bob", &server, None, MockVerifier::new()).await;

    let temp_id = session.send_message(text("lost?")).unwrap();
    drive_until(&mut session, |s| {
        s.messages()[0].status == DeliveryStatus::Failed
    })
    .await;
    assert!(drain(&mut view)
        .iter()
        .any(|u| matches!(u, ViewUpdate::DeliveryFailed { temp_id: t, .. } if t == &temp_id)));
    assert_eq!(session.messages().len(), 1);

    server.set(|s| {
        s.fail_sends = false;
        s.echo_in_response = true;
    });
    session.retry(&temp_id).unwrap();
    assert_eq!(session.messages()[0].status, DeliveryStatus::Unconfirmed);
    drive_until(&mut session, |s| s.messages()[0].id().is_some()).await;

    let record = &session.messages()[0];
    assert_eq!(record.id(), Some(&MessageId::from(100)));
    assert_eq!(record.status, DeliveryStatus::Confirmed);
    assert!(matches!(
        session.retry(&temp_id),
        Err(ChatError::InvalidInput(_))
    ));
    session.shutdown().await;
}

#[tokio::test]
async fn test_rejects_empty_and_oversized_messages() {
    let server = FakeServer::new("alice", 1);
    let (mut session, _view) = start("alice", "bob", &server, None, MockVerifier::new()).await;

    assert!(matches!(
        session.send_message(text("   ")),
        Err(ChatError::InvalidInput(_))
    ));
    assert!(matches!(
        session.send_message(text(&"x".repeat(1001))),
        Err(ChatError::InvalidInput(_))
    ));
    assert!(session.send_message(text(&"x".repeat(1000))).is_ok());
    assert_eq!(session.messages().len(), 1);
    session.shutdown().await;
}

#[tokio::test]
async fn test_other_conversations_are_not_admitted() {
    let server = FakeServer::new("alice", 1);
    server.store("carol", "alice", "psst", false, false);
    server.store("bob", "alice", "hi alice", false, false);
    let (mut session, _view) = start("alice", "bob", &server, None, MockVerifier::new()).await;

    session.load_history();
    drive_until(&mut session, |s| !s.messages().is_empty()).await;

    assert_eq!(session.messages().len(), 1);
    assert_eq!(session.messages()[0].body.display(), "hi alice");
    session.shutdown().await;
}

#[tokio::test]
async fn test_run_loop_handles_commands_until_shutdown() {
    let server = FakeServer::new("alice", 1);
    server.set(|s| s.echo_in_response = true);
    let (session, mut view) = start("alice", "bob", &server, None, MockVerifier::new()).await;
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(session.run(rx));

    tx.send(SessionCommand::Send(text("via the loop"))).unwrap();
    let first = tokio::time::timeout(Duration::from_secs(5), view.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, ViewUpdate::Inserted { index: 0, .. }));
    let second = tokio::time::timeout(Duration::from_secs(5), view.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(second, ViewUpdate::Promoted { index: 0, .. }));

    tx.send(SessionCommand::Shutdown).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(server.sent_count(), 1);
}
