//! Portable, exact ALiBi attention.
//!
//! The kernel favours clarity over speed and runs on every candle backend.

pub mod exact;

pub use exact::AlibiAttention;
