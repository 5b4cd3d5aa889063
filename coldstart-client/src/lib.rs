//! Conversation client for the ColdStart messaging core.
//!
//! [`ChatSession`] joins the live channel, loads history over REST and
//! merges live deliveries into the open conversation.

pub mod config;
pub mod error;
pub mod model;
pub mod rest;
pub mod session;
pub mod view;
pub mod websocket;

pub use config::ClientConfig;
pub use error::ClientError;
pub use model::{ChatEntry, StoredMessage};
pub use session::{ChatSession, SendOutcome};
pub use view::ConversationView;
