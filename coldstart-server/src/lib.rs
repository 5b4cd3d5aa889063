//! ColdStart messaging core: chat history store, presence registry and
//! live delivery relay.
//!
//! The REST side ([`api`]) persists messages; the live side
//! ([`serve_live`]) routes them to whoever is online right now. The two
//! never call each other.

pub mod api;
pub mod auth;
pub mod config;
mod connection;
pub mod error;
pub mod input;
mod messages;
pub mod model;
pub mod presence;
mod state;
pub mod store;

pub use connection::{handle_connection, handle_signal, serve_live};
pub use messages::Signal;
pub use state::{Delivery, ServerState};
