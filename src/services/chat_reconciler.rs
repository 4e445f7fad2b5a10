use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;

use super::chat_types::{
    ChatMessage, DeliveryStatus, LocalDraft, MessageId, RecordKey, RemoteMessage, RenderedBody,
    TempId, SELF_LABEL,
};
use crate::crypto::ParticipantPair;
use crate::error::{ChatError, Result};

const TEMP_SUFFIX_LEN: usize = 9;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Outcome of admitting a server message into the view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderDirective {
    /// Already rendered under this id (push and poll both delivered it).
    Duplicate,
    /// An optimistic record at `index` now carries the server id.
    Promoted { index: usize, id: MessageId },
    /// A new record was appended at `index`.
    Inserted { index: usize },
}

/// Ordered, deduplicated view of one conversation.
///
/// Records are keyed by server id once confirmed and by temp id before that.
/// Positions never change: remote records are appended in arrival order and a
/// promoted optimistic record stays where the user first saw it.
pub struct MessageReconciler {
    self_id: String,
    pair: ParticipantPair,
    records: Vec<ChatMessage>,
    index: HashMap<RecordKey, usize>,
}

impl MessageReconciler {
    pub fn new(self_id: &str, other_id: &str) -> Result<Self> {
        Ok(Self {
            self_id: self_id.to_string(),
            pair: ParticipantPair::new(self_id, other_id)?,
            records: Vec::new(),
            index: HashMap::new(),
        })
    }

    pub fn pair(&self) -> &ParticipantPair {
        &self.pair
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Render a locally originated message immediately, before the server has it.
    pub fn admit_local(&mut self, draft: LocalDraft) -> TempId {
        let temp_id = self.next_temp_id();
        let recipient_id = self
            .pair
            .other(&self.self_id)
            .unwrap_or(&self.self_id)
            .to_string();
        let record = ChatMessage {
            key: RecordKey::Temp(temp_id.clone()),
            pair: self.pair.clone(),
            sender_id: self.self_id.clone(),
            recipient_id,
            sender_label: SELF_LABEL.to_string(),
            wire_body: draft.wire_body,
            body: RenderedBody::Text(draft.body),
            timestamp: Utc::now(),
            is_face_locked: draft.is_face_locked,
            is_encrypted: draft.is_encrypted,
            attachment_ref: draft.attachment_ref,
            status: DeliveryStatus::Unconfirmed,
            is_outgoing: true,
        };
        self.push_record(record);
        log::debug!("Admitted local message {}", temp_id);
        temp_id
    }

    /// Merge a server-confirmed message into the view.
    ///
    /// Re-delivery of a known id is ignored. A self-authored message whose
    /// content matches a pending optimistic record promotes that record in
    /// place; anything else is appended.
    pub fn admit_remote(&mut self, msg: RemoteMessage) -> Result<RenderDirective> {
        let Some(id) = msg.id.clone() else {
            log::warn!(
                "Rejected server message without id from {} to {}",
                msg.sender_id,
                msg.recipient_id
            );
            return Err(ChatError::MalformedMessage("message has no id".to_string()));
        };

        if !self.pair.contains(&msg.sender_id) || !self.pair.contains(&msg.recipient_id) {
            log::warn!(
                "Rejected message {} outside conversation {}",
                id,
                self.pair.canonical()
            );
            return Err(ChatError::MalformedMessage(format!(
                "message {} does not belong to this conversation",
                id
            )));
        }

        let confirmed_key = RecordKey::Confirmed(id.clone());
        if self.index.contains_key(&confirmed_key) {
            log::debug!("Ignoring duplicate delivery of message {}", id);
            return Ok(RenderDirective::Duplicate);
        }

        if let Some(index) = self.find_promotable(&msg) {
            let record = &mut self.records[index];
            let old_key = std::mem::replace(&mut record.key, confirmed_key.clone());
            record.status = DeliveryStatus::Confirmed;
            record.timestamp = msg.timestamp;
            if msg.attachment_ref.is_some() {
                record.attachment_ref = msg.attachment_ref;
            }
            self.index.remove(&old_key);
            self.index.insert(confirmed_key, index);
            log::debug!("Promoted local message to {} at position {}", id, index);
            return Ok(RenderDirective::Promoted { index, id });
        }

        let is_outgoing = msg.sender_id == self.self_id;
        let record = ChatMessage {
            key: confirmed_key,
            pair: self.pair.clone(),
            sender_label: if is_outgoing {
                SELF_LABEL.to_string()
            } else {
                msg.sender_label
            },
            sender_id: msg.sender_id,
            recipient_id: msg.recipient_id,
            wire_body: msg.wire_body,
            body: msg.body,
            timestamp: msg.timestamp,
            is_face_locked: msg.is_face_locked,
            is_encrypted: msg.is_encrypted,
            attachment_ref: msg.attachment_ref,
            status: DeliveryStatus::Confirmed,
            is_outgoing,
        };
        let index = self.push_record(record);
        Ok(RenderDirective::Inserted { index })
    }

    /// Oldest pending self-authored record with the same content and lock flag.
    ///
    /// Content is the only correlation signal the server gives back, so two
    /// identical messages sent back to back may promote in either order.
    fn find_promotable(&self, msg: &RemoteMessage) -> Option<usize> {
        if msg.sender_id != self.self_id {
            return None;
        }
        self.records.iter().position(|record| {
            record.temp_id().is_some()
                && record.is_outgoing
                && record.is_face_locked == msg.is_face_locked
                && (record.wire_body == msg.wire_body
                    || matches!((&record.body, &msg.body),
                        (RenderedBody::Text(local), RenderedBody::Text(remote)) if local == remote))
        })
    }

    pub fn contains_id(&self, id: &MessageId) -> bool {
        self.index.contains_key(&RecordKey::Confirmed(id.clone()))
    }

    pub fn get(&self, key: &RecordKey) -> Option<&ChatMessage> {
        self.index.get(key).map(|&i| &self.records[i])
    }

    pub fn get_by_id(&self, id: &MessageId) -> Option<&ChatMessage> {
        self.get(&RecordKey::Confirmed(id.clone()))
    }

    pub fn get_by_temp_id(&self, temp_id: &TempId) -> Option<&ChatMessage> {
        self.get(&RecordKey::Temp(temp_id.clone()))
    }

    /// Mark a pending record as failed. It stays in the view, unconfirmed.
    pub fn mark_failed(&mut self, temp_id: &TempId) -> bool {
        self.set_pending_status(temp_id, DeliveryStatus::Failed)
    }

    /// Put a failed record back to pending for a manual retry.
    pub fn mark_retrying(&mut self, temp_id: &TempId) -> bool {
        self.set_pending_status(temp_id, DeliveryStatus::Unconfirmed)
    }

    fn set_pending_status(&mut self, temp_id: &TempId, status: DeliveryStatus) -> bool {
        match self.index.get(&RecordKey::Temp(temp_id.clone())) {
            Some(&i) => {
                self.records[i].status = status;
                true
            }
            None => false,
        }
    }

    /// Replace a locked placeholder with revealed text. Returns false if the
    /// record is unknown or not locked, so a body is revealed at most once.
    pub fn reveal(&mut self, id: &MessageId, body: RenderedBody) -> bool {
        let Some(&i) = self.index.get(&RecordKey::Confirmed(id.clone())) else {
            return false;
        };
        let record = &mut self.records[i];
        if record.body != RenderedBody::Locked {
            return false;
        }
        record.body = body;
        true
    }

    pub fn records(&self) -> &[ChatMessage] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.records.iter().filter(|r| r.temp_id().is_some()).count()
    }

    fn push_record(&mut self, record: ChatMessage) -> usize {
        let index = self.records.len();
        self.index.insert(record.key.clone(), index);
        self.records.push(record);
        index
    }

    /// `<unix millis>-<9 base36 chars>`, regenerated on the unlikely collision.
    fn next_temp_id(&self) -> TempId {
        let mut rng = rand::thread_rng();
        loop {
            let suffix: String = (0..TEMP_SUFFIX_LEN)
                .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
                .collect();
            let candidate = TempId::new(format!("{}-{}", Utc::now().timestamp_millis(), suffix));
            if !self.index.contains_key(&RecordKey::Temp(candidate.clone())) {
                return candidate;
            }
        }
    }
}
