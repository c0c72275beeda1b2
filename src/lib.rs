//! proxypool: a subscription-fed ss/vmess proxy pool.
//!
//! Subscription feeds are fetched, parsed and deduplicated into glider
//! `forward=` lines, probed through short-lived glider instances, scored by
//! observed reliability and latency, and republished as a live glider
//! configuration that is only restarted when the active set changes.

pub mod config;
pub mod pool;

pub use config::Config;
