//! Webhook server: verification handshake and event delivery.

pub mod handlers;
pub mod signature;

pub use handlers::{router, AppState};
