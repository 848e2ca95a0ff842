//! Live-chat handover between an automated assistant and human agents, with
//! real-time sync of chat state to visitor widgets and agent dashboards.
//!
//! The server side keeps one authoritative [`store::ChatStateStore`] and
//! fans committed changes out through [`broadcast::EventBroadcaster`]. The
//! [`client`] module is what a surface runs to converge on that state.

pub mod app;
pub mod assignment;
pub mod auth;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod error;
pub mod escalation;
pub mod events;
pub mod lifecycle;
pub mod notices;
pub mod notifier;
pub mod persist;
pub mod service;
pub mod store;
pub mod types;

pub use app::{router, run, AppState};
pub use error::ChatError;
