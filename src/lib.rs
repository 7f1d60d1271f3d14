//! Flow Guard - Distributed Sliding-Window Admission Control
//!
//! Decides, per request path, whether a request may proceed so that the whole fleet of
//! service instances stays within a shared request budget. Counters live in Redis as
//! sorted sets and are updated by one atomic script per check; store failures admit
//! the request rather than take the service down with it.

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;
pub mod ratelimit;
pub mod store;
