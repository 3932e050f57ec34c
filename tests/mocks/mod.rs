//! Mock infrastructure for testing external services
//!
//! A single wiremock server plays the MCP JSON-RPC endpoint, the v2 records
//! API and the OAuth accounts server, so one test can watch traffic move
//! between tiers.


pub use crm::*;
