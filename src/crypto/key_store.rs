use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use zeroize::Zeroizing;

use crate::error::{ChatError, Result};

/// Joins the two sorted identifiers of a pair.
pub const PAIR_SEPARATOR: &str = "_";

const KEY_LEN: usize = 32;

/// Identifier strings that leak out of an unset field instead of a real id.
const PLACEHOLDER_IDS: [&str; 2] = ["undefined", "null"];

/// Default PBKDF2 salt. Fixed and public: the pair itself is the only secret input.
pub const DEFAULT_PBKDF2_SALT: &[u8] = b"securechat-conversation-key";
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 100_000;

/// 256-bit symmetric key shared by both participants of a conversation.
#[derive(Clone)]
pub struct ConversationKey(Zeroizing<[u8; KEY_LEN]>);

impl ConversationKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl PartialEq for ConversationKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_ref() == other.0.as_ref()
    }
}

impl Eq for ConversationKey {}

impl fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConversationKey(..)")
    }
}

/// Unordered pair of participant identifiers, stored sorted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ParticipantPair {
    first: String,
    second: String,
}

impl ParticipantPair {
    pub fn new(a: &str, b: &str) -> Result<Self> {
        validate_identifier(a)?;
        validate_identifier(b)?;
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Ok(Self {
            first: first.to_string(),
            second: second.to_string(),
        })
    }

    /// `first_second`, the cache key and derivation input.
    pub fn canonical(&self) -> String {
        format!("{}{}{}", self.first, PAIR_SEPARATOR, self.second)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.first == id || self.second == id
    }

    /// The participant that is not `id`.
    pub fn other(&self, id: &str) -> Option<&str> {
        if self.first == id {
            Some(&self.second)
        } else if self.second == id {
            Some(&self.first)
        } else {
            None
        }
    }
}

fn validate_identifier(id: &str) -> Result<()> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err(ChatError::InvalidIdentifier(
            "participant identifier is empty".to_string(),
        ));
    }
    if PLACEHOLDER_IDS.contains(&trimmed) {
        return Err(ChatError::InvalidIdentifier(format!(
            "participant identifier is unset ({})",
            trimmed
        )));
    }
    Ok(())
}

/// How the pair string becomes key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyDerivation {
    /// SHA-256 of the canonical pair string.
    Sha256,
    /// PBKDF2-HMAC-SHA256 over the canonical pair string.
    Pbkdf2 { iterations: u32, salt: Vec<u8> },
}

impl Default for KeyDerivation {
    fn default() -> Self {
        Self::Sha256
    }
}

impl KeyDerivation {
    pub fn pbkdf2(iterations: u32) -> Self {
        Self::Pbkdf2 {
            iterations,
            salt: DEFAULT_PBKDF2_SALT.to_vec(),
        }
    }

    fn derive(&self, canonical: &str) -> ConversationKey {
        let mut key = [0u8; KEY_LEN];
        match self {
            Self::Sha256 => {
                let digest = Sha256::digest(canonical.as_bytes());
                key.copy_from_slice(&digest);
            }
            Self::Pbkdf2 { iterations, salt } => {
                pbkdf2::pbkdf2_hmac::<Sha256>(canonical.as_bytes(), salt, *iterations, &mut key);
            }
        }
        let derived = ConversationKey::from_bytes(key);
        zeroize::Zeroize::zeroize(&mut key);
        derived
    }
}

/// Derives and caches one key per conversation pair for the session lifetime.
///
/// The derivation has no secret input beyond the two identifiers, so anyone who
/// knows both ids can reproduce the key. It deters casual reading of stored
/// content; it does not protect against the server.
// TODO: replace pair-derived keys with an authenticated key exchange between the two clients.
pub struct ConversationKeyStore {
    derivation: KeyDerivation,
    keys: HashMap<String, ConversationKey>,
}

impl Default for ConversationKeyStore {
    fn default() -> Self {
        Self::new(KeyDerivation::default())
    }
}

impl ConversationKeyStore {
    pub fn new(derivation: KeyDerivation) -> Self {
        Self {
            derivation,
            keys: HashMap::new(),
        }
    }

    /// Key for the conversation between `self_id` and `other_id`.
    ///
    /// Argument order does not matter: `key_for(a, b) == key_for(b, a)`.
    pub fn key_for(&mut self, self_id: &str, other_id: &str) -> Result<ConversationKey> {
        let pair = ParticipantPair::new(self_id, other_id)?;
        Ok(self.key_for_pair(&pair))
    }

    pub fn key_for_pair(&mut self, pair: &ParticipantPair) -> ConversationKey {
        let canonical = pair.canonical();
        if let Some(key) = self.keys.get(&canonical) {
            return key.clone();
        }
        let key = self.derivation.derive(&canonical);
        log::debug!("Derived conversation key for pair {}", canonical);
        self.keys.insert(canonical, key.clone());
        key
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
