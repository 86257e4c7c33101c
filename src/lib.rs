//! rotationfx — continuous rotation decision core for an automated strategy.
//!
//! Every cycle the engine scores a universe of symbols from heterogeneous
//! signal layers, runs each challenger through a fixed gate pipeline, and —
//! when capacity is saturated — decides whether the weakest incumbent should
//! be displaced by a stronger candidate. Each decision produces a full audit
//! trace, and shadow variants replay the same stream under alternate
//! configurations without ever touching live state.

pub mod aggregate;
pub mod config;
pub mod displace;
pub mod engine;
pub mod events;
pub mod features;
pub mod gates;
pub mod logging;
pub mod positions;
pub mod shadow;
pub mod storage;
pub mod trace;
