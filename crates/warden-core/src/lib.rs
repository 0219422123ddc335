//! Warden Core - policy types, configuration and pure decision helpers.
//!
//! This crate holds everything the proxy decides with that does not need I/O:
//! security levels, decision records and reason codes, host and network
//! parsing, flex domain membership, CSP rewriting and activity records.

pub mod activity;
pub mod config;
pub mod csp;
pub mod decision;
pub mod error;
pub mod flex;
pub mod host;
pub mod network;
pub mod security;

pub use activity::{
    ActivityEvent, ActivityLog, FanoutActivityLog, MemoryActivityLog, Stage, TracingActivityLog,
};
pub use config::{ClientPolicy, WardenConfig};
pub use decision::{
    CheckVerdict, ConnDecision, DecisionRecord, FilterDecision, FlexRouter, MatcherRule,
    MatchersResponse, Reason,
};
pub use error::ConfigError;
pub use network::{LocalNetwork, NetworkPrefix};
pub use security::SecurityLevel;
