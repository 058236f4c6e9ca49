//! dynlimits - Request Admission Control
//!
//! This crate implements an HTTP admission gateway that answers every request
//! with `200` or `429`. Decisions come from token buckets keyed per API key
//! (optionally per endpoint) or per shared endpoint group, so one quota can
//! span several endpoints and listener ports.

pub mod config;
pub mod error;
pub mod gateway;
pub mod ratelimit;
