//! HTTP layer for gopin.
//!
//! Requests that are not proxied on the raw connection end up here: discovery
//! documents for pinned import paths, the full cache listing, static content,
//! health and metrics.

pub mod handler;
