use thiserror::Error;

/// Errors surfaced by the chat client core.
///
/// Cryptographic and parsing failures are recovered close to where they happen
/// and degrade to a placeholder in the view. Delivery and verification failures
/// are reported to the user for a manual retry. None of them stop the session.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Could not decrypt message: {0}")]
    DecryptionFailure(String),

    #[error("Message delivery failed: {0}")]
    DeliveryFailure(String),

    #[error("Face verification failed: {0}")]
    VerificationFailure(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Crypto error: {0}")]
    CryptoError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ChatError>;
