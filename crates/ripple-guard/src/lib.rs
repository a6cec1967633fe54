//! # ripple-guard
//!
//! Admission control and delivery-reliability overlays for the Ripple
//! realtime hub:
//!
//! - **RateLimiter** - fixed-window message counting per socket/user
//! - **LoadManager** - connection/subscription admission and shedding
//! - **AckManager** - outstanding-message tracking with retry deadlines
//! - **Deduplicator** - content-hash seen-set with TTL and size bound
//! - **CircuitBreaker** - three-state gate around external calls
//!
//! Each overlay owns its own lock; the orchestrator never holds two at
//! once, so no cross-component lock ordering is required.

pub mod ack;
pub mod breaker;
pub mod dedup;
pub mod load;
pub mod rate_limit;

pub use ack::{AckConfig, AckError, AckHandle, AckManager, AckRetry};
pub use breaker::{BreakerConfig, BreakerError, BreakerManager, BreakerState, CircuitBreaker};
pub use dedup::{dedup_key, DedupConfig, Deduplicator};
pub use load::{LoadConfig, LoadError, LoadManager};
pub use rate_limit::{RateDecision, RateLimitConfig, RateLimiter};
