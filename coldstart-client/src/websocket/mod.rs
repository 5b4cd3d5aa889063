mod client;
mod messages;

pub use client::LiveClient;
pub use messages::Signal;
