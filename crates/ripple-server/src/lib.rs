//! # ripple-server
//!
//! The Ripple realtime hub server: configuration, the hub message
//! switch, WebSocket handlers, frame dispatch, the batch gateway,
//! webhook emission, and the HTTP surface.
//!
//! The `ripple` binary wraps [`handlers::run_server`]; embedders and
//! integration tests use [`hub::Hub`] with [`handlers::spawn_server`].

pub mod auth;
pub mod batch;
pub mod config;
pub mod dispatch;
pub mod handlers;
pub mod hub;
pub mod metrics;
pub mod webhook;

pub use config::Config;
pub use handlers::{run_server, spawn_server, ServerHandle};
pub use hub::{ClientEventOutcome, Hub, SubscribeRefusal};
pub use webhook::WebhookEmitter;
