//! CodeAtlas resilience layer
//!
//! Provides:
//! - Circuit breaker with sliding failure window and per-call timeouts
//! - Retry engine with exponential backoff + jitter
//! - Error classification driving log severity and fallback decisions
//! - `ResilientOperation` for wrapping every operation of a protected
//!   resource in one shared failure domain

pub mod circuit_breaker;
pub mod classify;
pub mod config;
pub mod presets;
pub mod resilient;
pub mod retry;

pub use circuit_breaker::*;
pub use classify::*;
pub use config::*;
pub use presets::*;
pub use resilient::*;
pub use retry::*;
