//! RedTeamingAI inline security proxy library interface.
//!
//! Re-exports the interceptor, forwarder, broadcaster, and configuration
//! so integration tests and embedders can construct a proxy router
//! programmatically.

pub mod alerts;
pub mod auth;
pub mod broadcast;
pub mod config;
pub mod forward;
pub mod pricing;
pub mod proxy;
pub mod streaming;

pub use alerts::{AlertSignal, AlertSink};
pub use broadcast::Broadcaster;
pub use proxy::{build_app_state, build_router, AppState};
