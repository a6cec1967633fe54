//! # ripple-core
//!
//! Core channel, connection, and authorization state for the Ripple
//! realtime hub.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **ChannelRegistry** - channel and subscription state, lifecycle
//!   emission, presence member tracking
//! - **ConnectionTable** - socket-id to write-handle map with
//!   backpressure accounting
//! - **Authorizer** - pattern-matched subscription authorization
//! - **HeartbeatTracker** - presence liveness with sweep eviction
//! - **HookBus** - channel lifecycle hooks
//! - **MessageHistory** - bounded recent-message windows
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐     ┌─────────────────┐     ┌───────────┐
//! │ ConnectionTable│────▶│ ChannelRegistry │────▶│  Channel  │
//! └────────────────┘     └─────────────────┘     └───────────┘
//!                               │
//!                    ┌──────────┴──────────┐
//!                    ▼                     ▼
//!             ┌────────────┐        ┌───────────┐
//!             │ Authorizer │        │  HookBus  │
//!             └────────────┘        └───────────┘
//! ```

pub mod auth;
pub mod channel;
pub mod connection;
pub mod history;
pub mod hooks;
pub mod pattern;
pub mod presence;
pub mod registry;

pub use auth::{AuthContext, AuthDecision, AuthError, AuthHandler, Authorizer};
pub use channel::{Channel, ChannelType, PRESENCE_PREFIX, PRIVATE_PREFIX};
pub use connection::{ConnectionHandle, ConnectionTable, DeliveryStatus, Outbound};
pub use history::{HistoryConfig, MessageHistory, StoredMessage};
pub use hooks::{ChannelEvent, HookBus, HookKind};
pub use pattern::{ChannelPattern, PatternError};
pub use presence::{Eviction, HeartbeatTracker};
pub use registry::{ChannelRegistry, RegistryError, SubscribeOutcome, UnsubscribeOutcome};
