//! Face verification seam. The recognition pipeline is opaque: one call, one verdict.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use std::path::Path;
use std::time::Duration;

use super::chat_api::parse_base_url;
use super::chat_types::{VerifyRequest, VerifyResponse};
use crate::error::{ChatError, Result};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FaceVerifier: Send + Sync {
    /// Verify the current user. `face_image` is a `data:` URL when the caller
    /// captured a frame, otherwise the server uses its own capture.
    async fn verify(&self, face_image: Option<String>) -> Result<bool>;
}

/// Encode an image file as a `data:<mime>;base64,...` URL.
pub fn image_data_url(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    Ok(format!("data:{};base64,{}", mime, STANDARD.encode(bytes)))
}

/// Calls `POST /verify_face` on the chat server.
pub struct HttpFaceVerifier {
    client: reqwest::Client,
    endpoint: url::Url,
    username: String,
    session_cookie: Option<String>,
}

impl HttpFaceVerifier {
    pub fn new(
        base_url: &str,
        username: &str,
        timeout: Duration,
        session_cookie: Option<String>,
    ) -> Result<Self> {
        let endpoint = parse_base_url(base_url)?
            .join("verify_face")
            .map_err(|e| ChatError::ConfigError(format!("Verify URL: {}", e)))?;
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .build()
            .map_err(|e| ChatError::TransportError(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint,
            username: username.to_string(),
            session_cookie,
        })
    }
}

#[async_trait]
impl FaceVerifier for HttpFaceVerifier {
    async fn verify(&self, face_image: Option<String>) -> Result<bool> {
        let body = VerifyRequest {
            face_image,
            username: self.username.clone(),
        };
        let mut request = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(cookie) = &self.session_cookie {
            request = request.header(reqwest::header::COOKIE, cookie);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| ChatError::VerificationFailure(format!("POST /verify_face: {}", e)))?;
        let status = resp.status();
        // 401 with {success: false} is an ordinary "no match"
        let verdict: VerifyResponse = resp.json().await.map_err(|e| {
            ChatError::VerificationFailure(format!("POST /verify_face: HTTP {} ({})", status, e))
        })?;

        if let Some(message) = &verdict.message {
            log::debug!("Face verification response: {}", message);
        }
        Ok(verdict.is_verified())
    }
}
