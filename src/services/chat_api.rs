//! HTTP side of the chat server: multipart send and history fetch.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use std::time::Duration;

use super::chat_types::{FetchResponse, OutgoingMessage, SendResponse, ServerMessage};
use crate::error::{ChatError, Result};

/// The two HTTP endpoints the delivery channel depends on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// `POST /send_message` as multipart form data.
    async fn send_message(&self, message: &OutgoingMessage) -> Result<SendResponse>;

    /// `GET /get_messages?recipient_id=<id>`, the full conversation history.
    async fn fetch_messages(&self, recipient_id: &str) -> Result<Vec<ServerMessage>>;
}

/// `reqwest`-backed implementation talking to the chat server.
pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: url::Url,
    session_cookie: Option<String>,
}

impl HttpChatApi {
    pub fn new(base_url: &str, timeout: Duration, session_cookie: Option<String>) -> Result<Self> {
        let base_url = parse_base_url(base_url)?;
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .build()
            .map_err(|e| ChatError::TransportError(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url,
            session_cookie,
        })
    }

    fn endpoint(&self, path: &str) -> Result<url::Url> {
        self.base_url
            .join(path)
            .map_err(|e| ChatError::ConfigError(format!("Build URL for {}: {}", path, e)))
    }

    fn with_session(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.session_cookie {
            Some(cookie) => request.header(reqwest::header::COOKIE, cookie),
            None => request,
        }
    }

    fn build_form(message: &OutgoingMessage) -> Result<Form> {
        let mut form = Form::new()
            .text("content", message.content.clone())
            .text("recipient_id", message.recipient_id.clone())
            .text("is_face_locked", message.is_face_locked.to_string())
            .text("is_encrypted", message.is_encrypted.to_string());

        if let Some(attachment) = &message.attachment {
            let part = Part::bytes(attachment.bytes.clone())
                .file_name(attachment.filename.clone())
                .mime_str(&attachment.mime_type)
                .map_err(|e| {
                    ChatError::InvalidInput(format!(
                        "Attachment MIME type {}: {}",
                        attachment.mime_type, e
                    ))
                })?;
            form = form.part("file", part);
        }
        Ok(form)
    }
}

/// Parse the server URL so that relative endpoint paths join below it.
pub fn parse_base_url(raw: &str) -> Result<url::Url> {
    let mut url = url::Url::parse(raw)
        .map_err(|e| ChatError::ConfigError(format!("Invalid server URL {}: {}", raw, e)))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn send_message(&self, message: &OutgoingMessage) -> Result<SendResponse> {
        let url = self.endpoint("send_message")?;
        let form = Self::build_form(message)?;

        let resp = self
            .with_session(self.client.post(url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ChatError::DeliveryFailure(format!("POST /send_message: {}", e)))?;

        let status = resp.status();
        // Error responses still carry {success: false, message}
        let body: SendResponse = resp.json().await.map_err(|e| {
            ChatError::DeliveryFailure(format!("POST /send_message: HTTP {} ({})", status, e))
        })?;

        if !status.is_success() || !body.success {
            let reason = body
                .status_text()
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {}", status));
            return Err(ChatError::DeliveryFailure(reason));
        }
        Ok(body)
    }

    async fn fetch_messages(&self, recipient_id: &str) -> Result<Vec<ServerMessage>> {
        let mut url = self.endpoint("get_messages")?;
        url.query_pairs_mut().append_pair("recipient_id", recipient_id);
        let resp = self
            .with_session(self.client.get(url))
            .send()
            .await
            .map_err(|e| ChatError::TransportError(format!("GET /get_messages: {}", e)))?;

        if !resp.status().is_success() {
            return Err(ChatError::TransportError(format!(
                "GET /get_messages: HTTP {}",
                resp.status()
            )));
        }

        let body: FetchResponse = resp
            .json()
            .await
            .map_err(|e| ChatError::TransportError(format!("Parse message history: {}", e)))?;

        let mut messages = Vec::with_capacity(body.messages.len());
        for raw in body.messages {
            match serde_json::from_value::<ServerMessage>(raw) {
                Ok(msg) => messages.push(msg),
                Err(e) => log::warn!("Skipping malformed message in history: {}", e),
            }
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::chat_types::Attachment;

    #[test]
    fn test_rejects_invalid_base_url() {
        let err = HttpChatApi::new("not a url", Duration::from_secs(1), None)
            .err()
            .unwrap();
        assert!(matches!(err, ChatError::ConfigError(_)));
    }

    #[test]
    fn test_endpoint_joins_base() {
        let api = HttpChatApi::new("http://chat.local:5000/", Duration::from_secs(1), None).unwrap();
        assert_eq!(
            api.endpoint("get_messages").unwrap().as_str(),
            "http://chat.local:5000/get_messages"
        );
    }

    #[test]
    fn test_base_url_without_trailing_slash_keeps_prefix() {
        let api = HttpChatApi::new("https://example.org/chat", Duration::from_secs(1), None).unwrap();
        assert_eq!(
            api.endpoint("send_message").unwrap().as_str(),
            "https://example.org/chat/send_message"
        );
    }

    #[test]
    fn test_bad_attachment_mime_rejected() {
        let msg = OutgoingMessage {
            content: "x".into(),
            recipient_id: "2".into(),
            is_face_locked: false,
            is_encrypted: false,
            attachment: Some(Attachment {
                filename: "a.bin".into(),
                mime_type: "not a mime".into(),
                bytes: vec![1, 2, 3],
            }),
        };
        assert!(matches!(
            HttpChatApi::build_form(&msg),
            Err(ChatError::InvalidInput(_))
        ));
    }
}
