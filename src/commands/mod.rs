// Line command handlers for the terminal client

pub mod chat;

pub use chat::*;
