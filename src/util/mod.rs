//! Utility modules: backoff schedule, deadline helpers.

pub mod backoff;
pub mod timeout;
