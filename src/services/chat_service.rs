//! Chat session: ties together keys, cipher, reconciler, lock gate, and delivery.
//!
//! One task owns all session state. Sends, polls, and verification calls run
//! as spawned futures whose results are fed back into [`ChatSession::run`].

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::chat_api::ChatApi;
use super::chat_delivery::{ChannelEvent, DeliveryChannel, SendOutcome};
use super::chat_reconciler::{MessageReconciler, RenderDirective};
use super::chat_types::*;
use super::config::ChatSettings;
use super::face_verifier::FaceVerifier;
use super::lock_gate::{LockGate, LockState, UnlockRequest, VerificationOutcome};
use super::push::PushConnection;
use crate::crypto::{ConversationKeyStore, EncryptedBody, MessageCipher};
use crate::error::{ChatError, Result};

/// A message the user wants to send.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub text: String,
    pub face_locked: bool,
    pub encrypted: bool,
    pub attachment: Option<Attachment>,
}

/// Instructions accepted by a running session.
#[derive(Debug)]
pub enum SessionCommand {
    Send(SendRequest),
    Unlock {
        id: MessageId,
        face_image: Option<String>,
    },
    Retry(TempId),
    History,
    Shutdown,
}

/// External collaborators of a session.
pub struct SessionDeps {
    pub api: Arc<dyn ChatApi>,
    pub push: Option<PushConnection>,
    pub verifier: Arc<dyn FaceVerifier>,
}

type SendResult = (TempId, Result<SendOutcome>);
type VerifyResult = (MessageId, Result<bool>);

pub struct ChatSession {
    self_id: String,
    max_message_length: usize,
    keys: ConversationKeyStore,
    cipher: MessageCipher,
    reconciler: MessageReconciler,
    gate: LockGate,
    channel: DeliveryChannel,
    channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    verifier: Arc<dyn FaceVerifier>,
    view: mpsc::UnboundedSender<ViewUpdate>,
    sends: JoinSet<SendResult>,
    verifications: JoinSet<VerifyResult>,
    history: JoinSet<Result<usize>>,
    /// Outgoing payloads kept for a manual retry until the send succeeds.
    unsent: HashMap<TempId, OutgoingMessage>,
}

impl ChatSession {
    /// Build a session for the conversation named in `settings` and start
    /// its delivery channel. Returns the receiving end of the view stream.
    pub async fn start(
        settings: &ChatSettings,
        deps: SessionDeps,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ViewUpdate>)> {
        let reconciler = MessageReconciler::new(&settings.user_id, &settings.recipient_id)?;
        let (channel, channel_events) = DeliveryChannel::start(
            deps.api,
            deps.push,
            &settings.recipient_id,
            settings.poll_interval(),
        )
        .await;
        let (view_tx, view_rx) = mpsc::unbounded_channel();

        log::info!(
            "Chat session {} started for user {}",
            reconciler.pair().canonical(),
            settings.user_id
        );

        let session = Self {
            self_id: settings.user_id.clone(),
            max_message_length: settings.max_message_length,
            keys: ConversationKeyStore::new(settings.key_derivation()),
            cipher: MessageCipher::new(),
            reconciler,
            gate: LockGate::new(),
            channel,
            channel_events,
            verifier: deps.verifier,
            view: view_tx,
            sends: JoinSet::new(),
            verifications: JoinSet::new(),
            history: JoinSet::new(),
            unsent: HashMap::new(),
        };
        Ok((session, view_rx))
    }

    fn publish(&self, update: ViewUpdate) {
        let _ = self.view.send(update);
    }

    // ── Outbound ──────────────────────────────────────────────

    /// Encrypt, render optimistically, and hand the message to the channel.
    pub fn send_message(&mut self, request: SendRequest) -> Result<TempId> {
        let text = request.text.trim().to_string();
        if text.is_empty() && request.attachment.is_none() {
            return Err(ChatError::InvalidInput("message is empty".to_string()));
        }
        let length = text.chars().count();
        if length > self.max_message_length {
            return Err(ChatError::InvalidInput(format!(
                "message is {} characters, the limit is {}",
                length, self.max_message_length
            )));
        }

        let wire_body = if request.encrypted {
            let key = self.keys.key_for_pair(self.reconciler.pair());
            self.cipher.encrypt_to_wire(&text, &key)?
        } else {
            text.clone()
        };
        let recipient_id = self.other_id().to_string();

        let outgoing = OutgoingMessage {
            content: wire_body.clone(),
            recipient_id,
            is_face_locked: request.face_locked,
            is_encrypted: request.encrypted,
            attachment: request.attachment,
        };
        let temp_id = self.reconciler.admit_local(LocalDraft {
            body: text,
            wire_body,
            is_face_locked: request.face_locked,
            is_encrypted: request.encrypted,
            attachment_ref: outgoing.attachment.as_ref().map(|a| a.filename.clone()),
        });
        self.publish_record(&RecordKey::Temp(temp_id.clone()), false);

        self.spawn_send(temp_id.clone(), outgoing.clone());
        self.unsent.insert(temp_id.clone(), outgoing);
        Ok(temp_id)
    }

    /// Send a failed record again, reusing its optimistic entry.
    pub fn retry(&mut self, temp_id: &TempId) -> Result<()> {
        let status = self
            .reconciler
            .get_by_temp_id(temp_id)
            .map(|record| record.status)
            .ok_or_else(|| {
                ChatError::InvalidInput(format!("no pending message {}", temp_id))
            })?;
        if status != DeliveryStatus::Failed {
            return Err(ChatError::InvalidInput(format!(
                "message {} has not failed",
                temp_id
            )));
        }
        let outgoing = self.unsent.get(temp_id).cloned().ok_or_else(|| {
            ChatError::InvalidInput(format!("message {} can no longer be retried", temp_id))
        })?;

        self.reconciler.mark_retrying(temp_id);
        log::info!("Retrying delivery of {}", temp_id);
        self.spawn_send(temp_id.clone(), outgoing);
        Ok(())
    }

    fn spawn_send(&mut self, temp_id: TempId, outgoing: OutgoingMessage) {
        let channel = self.channel.clone();
        self.sends.spawn(async move {
            let result = channel.send(&outgoing).await;
            (temp_id, result)
        });
    }

    fn handle_send_result(&mut self, temp_id: TempId, result: Result<SendOutcome>) {
        match result {
            Ok(outcome) => {
                log::debug!("Message {} handed off via {:?}", temp_id, outcome.path);
                self.unsent.remove(&temp_id);
            }
            Err(e) => {
                log::warn!("Delivery of {} failed: {}", temp_id, e);
                if self.reconciler.mark_failed(&temp_id) {
                    self.publish(ViewUpdate::DeliveryFailed {
                        temp_id,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    // ── Inbound ───────────────────────────────────────────────

    pub fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::RemoteMessage { source, message } => {
                log::debug!("Message {:?} arrived via {:?}", message.id, source);
                self.admit_server_message(message);
            }
            ChannelEvent::Connected => {
                self.publish(ViewUpdate::ConnectionChanged { connected: true })
            }
            ChannelEvent::Disconnected { reason } => {
                log::info!("Push disconnected ({}), falling back to polling", reason);
                self.publish(ViewUpdate::ConnectionChanged { connected: false });
            }
        }
    }

    fn admit_server_message(&mut self, message: ServerMessage) {
        let pair = self.reconciler.pair();
        if !pair.contains(message.sender_id()) || !pair.contains(&message.recipient_id) {
            log::debug!(
                "Ignoring message for another conversation ({} -> {})",
                message.sender_id(),
                message.recipient_id
            );
            return;
        }
        if message.id.as_ref().is_some_and(|id| self.reconciler.contains_id(id)) {
            return;
        }

        let remote = self.decode(message);
        let is_locked = remote.body == RenderedBody::Locked;
        match self.reconciler.admit_remote(remote) {
            Ok(RenderDirective::Inserted { index }) => {
                let record = &self.reconciler.records()[index];
                let key = record.key.clone();
                if is_locked {
                    if let Some(id) = record.id().cloned() {
                        self.gate.track(id);
                    }
                }
                self.publish_record(&key, false);
            }
            Ok(RenderDirective::Promoted { id, .. }) => {
                let reconciler = &self.reconciler;
                self.unsent
                    .retain(|temp_id, _| reconciler.get_by_temp_id(temp_id).is_some());
                self.publish_record(&RecordKey::Confirmed(id), true);
            }
            Ok(RenderDirective::Duplicate) => {}
            Err(e) => log::warn!("Message not admitted: {}", e),
        }
    }

    /// Turn a wire message into a view-ready one. Flagged messages stay
    /// locked; others are decrypted now.
    fn decode(&mut self, message: ServerMessage) -> RemoteMessage {
        let is_encrypted = message
            .is_encrypted
            .unwrap_or_else(|| EncryptedBody::looks_encrypted(&message.content));
        let body = if message.is_face_locked {
            RenderedBody::Locked
        } else {
            self.render_plaintext(&message.content, is_encrypted, message.id.as_ref())
        };
        let sender_label = message
            .author
            .as_ref()
            .map(|a| a.username.clone())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| message.sender_id().to_string());
        let timestamp = message.parsed_timestamp().unwrap_or_else(chrono::Utc::now);

        RemoteMessage {
            id: message.id,
            sender_id: message.user_id,
            recipient_id: message.recipient_id,
            sender_label,
            wire_body: message.content,
            body,
            timestamp,
            is_face_locked: message.is_face_locked,
            is_encrypted,
            attachment_ref: message.file_path,
        }
    }

    fn render_plaintext(
        &mut self,
        wire: &str,
        is_encrypted: bool,
        id: Option<&MessageId>,
    ) -> RenderedBody {
        if !is_encrypted {
            return RenderedBody::Text(wire.to_string());
        }
        let key = self.keys.key_for_pair(self.reconciler.pair());
        match self.cipher.decrypt(wire, &key) {
            Ok(text) => RenderedBody::Text(text),
            Err(e) => {
                log::warn!("Could not decrypt message {:?}: {}", id, e);
                RenderedBody::Undecryptable
            }
        }
    }

    fn publish_record(&self, key: &RecordKey, promoted: bool) {
        let Some(index) = self.reconciler.records().iter().position(|r| &r.key == key) else {
            return;
        };
        let message = self.reconciler.records()[index].clone();
        self.publish(if promoted {
            ViewUpdate::Promoted { index, message }
        } else {
            ViewUpdate::Inserted { index, message }
        });
    }

    // ── Face lock ─────────────────────────────────────────────

    /// Ask to reveal a face-locked message. Starts at most one verification
    /// call per message at a time.
    pub fn request_unlock(&mut self, id: &MessageId, face_image: Option<String>) -> UnlockRequest {
        let request = self.gate.request(id);
        if request == UnlockRequest::Started {
            let verifier = self.verifier.clone();
            let id = id.clone();
            self.verifications.spawn(async move {
                let result = verifier.verify(face_image).await;
                (id, result)
            });
        }
        request
    }

    fn handle_verification(&mut self, id: MessageId, result: Result<bool>) {
        let (verified, reason) = match result {
            Ok(true) => (true, None),
            Ok(false) => (false, Some("Face verification failed".to_string())),
            Err(e) => (false, Some(e.to_string())),
        };

        match self.gate.complete(&id, verified) {
            VerificationOutcome::Unlocked => self.reveal(&id),
            VerificationOutcome::Failed => self.publish(ViewUpdate::UnlockFailed {
                id,
                reason: reason.unwrap_or_default(),
            }),
            VerificationOutcome::Ignored => {
                log::debug!("Discarding verification result for {}", id)
            }
        }
    }

    fn reveal(&mut self, id: &MessageId) {
        let Some(record) = self.reconciler.get_by_id(id) else {
            return;
        };
        let wire = record.wire_body.clone();
        let is_encrypted = record.is_encrypted;
        let body = self.render_plaintext(&wire, is_encrypted, Some(id));
        let text = body.display().to_string();
        if self.reconciler.reveal(id, body) {
            self.publish(ViewUpdate::Revealed {
                id: id.clone(),
                body: text,
            });
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Load the conversation history once, independently of push state.
    pub fn load_history(&mut self) {
        let channel = self.channel.clone();
        self.history.spawn(async move { channel.fetch_history().await });
    }

    pub fn handle_command(&mut self, command: SessionCommand) -> Result<()> {
        match command {
            SessionCommand::Send(request) => self.send_message(request).map(|_| ()),
            SessionCommand::Unlock { id, face_image } => {
                match self.request_unlock(&id, face_image) {
                    UnlockRequest::NotLocked => Err(ChatError::InvalidInput(format!(
                        "message {} is not face-locked",
                        id
                    ))),
                    _ => Ok(()),
                }
            }
            SessionCommand::Retry(temp_id) => self.retry(&temp_id),
            SessionCommand::History => {
                self.load_history();
                Ok(())
            }
            SessionCommand::Shutdown => Ok(()),
        }
    }

    /// Wait for the next internal completion (channel event, send, verification,
    /// history fetch) and apply it. Returns false once nothing can arrive anymore.
    pub async fn process_next(&mut self) -> bool {
        tokio::select! {
            event = self.channel_events.recv() => match event {
                Some(event) => {
                    self.handle_channel_event(event);
                    true
                }
                None => false,
            },
            Some(joined) = self.sends.join_next(), if !self.sends.is_empty() => {
                match joined {
                    Ok((temp_id, result)) => self.handle_send_result(temp_id, result),
                    Err(e) => log::error!("Send task failed: {}", e),
                }
                true
            }
            Some(joined) = self.verifications.join_next(), if !self.verifications.is_empty() => {
                match joined {
                    Ok((id, result)) => self.handle_verification(id, result),
                    Err(e) => log::error!("Verification task failed: {}", e),
                }
                true
            }
            Some(joined) = self.history.join_next(), if !self.history.is_empty() => {
                match joined {
                    Ok(Ok(count)) => log::info!("Loaded {} messages of history", count),
                    Ok(Err(e)) => log::warn!("Could not load message history: {}", e),
                    Err(e) => log::error!("History task failed: {}", e),
                }
                true
            }
        }
    }

    /// Drive the session until a `Shutdown` command or the command stream ends.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        self.load_history();
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => {
                        if let Err(e) = self.handle_command(command) {
                            log::warn!("Command rejected: {}", e);
                        }
                    }
                },
                alive = self.process_next() => {
                    if !alive {
                        break;
                    }
                }
            }
        }
        self.shutdown().await;
    }

    /// Stop the channel and drop in-flight work; late results are discarded.
    pub async fn shutdown(&mut self) {
        self.sends.abort_all();
        self.verifications.abort_all();
        self.history.abort_all();
        self.channel.shutdown().await;
        log::info!("Chat session {} closed", self.reconciler.pair().canonical());
    }

    // ── Accessors ─────────────────────────────────────────────

    pub fn messages(&self) -> &[ChatMessage] {
        self.reconciler.records()
    }

    pub fn lock_state(&self, id: &MessageId) -> Option<LockState> {
        self.gate.state(id)
    }

    pub fn channel(&self) -> &DeliveryChannel {
        &self.channel
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    fn other_id(&self) -> &str {
        self.reconciler
            .pair()
            .other(&self.self_id)
            .unwrap_or(&self.self_id)
    }
}
