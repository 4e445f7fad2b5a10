// Service layer - trait seams at the network boundaries, plain structs inside

pub mod chat_api;
pub mod chat_delivery;
pub mod chat_reconciler;
pub mod chat_service;
pub mod chat_types;
pub mod config;
pub mod face_verifier;
pub mod lock_gate;
pub mod push;
pub mod socket_push;

pub use chat_api::{ChatApi, HttpChatApi};
pub use chat_delivery::{ChannelEvent, DeliveryChannel, DeliveryState, MessageSource};
pub use chat_reconciler::{MessageReconciler, RenderDirective};
pub use chat_service::{ChatSession, SendRequest, SessionCommand, SessionDeps};
pub use config::ChatSettings;
pub use face_verifier::{FaceVerifier, HttpFaceVerifier};
pub use lock_gate::{LockGate, LockState};
pub use push::{PushConnection, PushEvent, PushTransport};
pub use socket_push::SocketIoTransport;
