//! Integration tests for the CRM router
//!
//! These drive the integration manager and the operator router against a
//! mock CRM server: tier backends, token refresh, failover and the
//! health/metrics/admin endpoints.

mod backends;
mod failover;
mod operator;
mod tokens;
