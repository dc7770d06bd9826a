//! SelfHeal server
//!
//! HTTP front for the healing engine: test runners report outcomes and get
//! repaired selectors back in the ack, reviewers resolve ambiguous events,
//! and dashboards read run summaries and fragility reports.

pub mod config;
pub mod server;

pub use config::ServerConfig;
pub use server::{serve, AppState};
