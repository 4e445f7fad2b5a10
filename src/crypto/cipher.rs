use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

use super::key_store::ConversationKey;
use crate::error::{ChatError, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Separates the IV from the ciphertext in the wire form.
pub const WIRE_SEPARATOR: char = ':';

/// Shown in place of a body that failed to decrypt.
pub const DECRYPT_FAILED_PLACEHOLDER: &str = "Error: Could not decrypt message";

const IV_LEN: usize = 16;

/// An encrypted body: `base64(iv):base64(ciphertext)` on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBody {
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
}

impl EncryptedBody {
    pub fn to_wire(&self) -> String {
        format!(
            "{}{}{}",
            BASE64.encode(self.iv),
            WIRE_SEPARATOR,
            BASE64.encode(&self.ciphertext)
        )
    }

    /// Parse the wire form.
    ///
    /// `Ok(None)` means there is no separator: the body is legacy plaintext.
    pub fn parse(wire: &str) -> Result<Option<Self>> {
        let Some((iv_b64, ct_b64)) = wire.split_once(WIRE_SEPARATOR) else {
            return Ok(None);
        };
        let iv_bytes = BASE64
            .decode(iv_b64.trim())
            .map_err(|e| ChatError::DecryptionFailure(format!("IV is not base64: {}", e)))?;
        let iv: [u8; IV_LEN] = iv_bytes.as_slice().try_into().map_err(|_| {
            ChatError::DecryptionFailure(format!("IV must be {} bytes, got {}", IV_LEN, iv_bytes.len()))
        })?;
        let ciphertext = BASE64
            .decode(ct_b64.trim())
            .map_err(|e| ChatError::DecryptionFailure(format!("Ciphertext is not base64: {}", e)))?;
        if ciphertext.is_empty() || ciphertext.len() % IV_LEN != 0 {
            return Err(ChatError::DecryptionFailure(format!(
                "Ciphertext length {} is not a whole number of blocks",
                ciphertext.len()
            )));
        }
        Ok(Some(Self { iv, ciphertext }))
    }

    /// Whether `wire` parses as an encrypted body.
    pub fn looks_encrypted(wire: &str) -> bool {
        matches!(Self::parse(wire), Ok(Some(_)))
    }
}

/// AES-256-CBC with PKCS7 padding and a fresh random IV per message.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCipher;

impl MessageCipher {
    pub fn new() -> Self {
        Self
    }

    pub fn encrypt(&self, plaintext: &str, key: &ConversationKey) -> Result<EncryptedBody> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let encryptor = Aes256CbcEnc::new_from_slices(key.as_bytes(), &iv)
            .map_err(|e| ChatError::CryptoError(format!("AES init: {}", e)))?;
        let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        Ok(EncryptedBody { iv, ciphertext })
    }

    /// Encrypt straight to the wire form.
    pub fn encrypt_to_wire(&self, plaintext: &str, key: &ConversationKey) -> Result<String> {
        Ok(self.encrypt(plaintext, key)?.to_wire())
    }

    pub fn decrypt_body(&self, body: &EncryptedBody, key: &ConversationKey) -> Result<String> {
        let decryptor = Aes256CbcDec::new_from_slices(key.as_bytes(), &body.iv)
            .map_err(|e| ChatError::CryptoError(format!("AES init: {}", e)))?;
        let plaintext = decryptor
            .decrypt_padded_vec_mut::<Pkcs7>(&body.ciphertext)
            .map_err(|_| ChatError::DecryptionFailure("bad padding (wrong key?)".to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|_| ChatError::DecryptionFailure("plaintext is not UTF-8".to_string()))
    }

    /// Decrypt a wire string.
    ///
    /// A string without the separator is returned unchanged (unencrypted
    /// message). Anything that looks encrypted but cannot be decrypted is a
    /// `DecryptionFailure`.
    pub fn decrypt(&self, wire: &str, key: &ConversationKey) -> Result<String> {
        match EncryptedBody::parse(wire)? {
            Some(body) => self.decrypt_body(&body, key),
            None => Ok(wire.to_string()),
        }
    }
}
