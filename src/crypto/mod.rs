pub mod cipher;
pub mod key_store;

pub use cipher::{EncryptedBody, MessageCipher, DECRYPT_FAILED_PLACEHOLDER};
pub use key_store::{ConversationKey, ConversationKeyStore, KeyDerivation, ParticipantPair};
