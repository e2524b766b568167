//! Core functionality for the gateway.
//!
//! This module contains the fundamental components used throughout the
//! application:
//! - Runtime configuration (services, credentials, principals)
//! - Database access
//! - Error handling
//! - Usage accounting

pub mod config;
pub mod database;
pub mod error;
pub mod usage;

// Re-export commonly used types
pub use config::{
    ConfigSnapshot, Credential, GatewayConfig, Principal, Protocol, Role, Service, ServiceType,
};
pub use database::{Database, DatabaseConfig};
pub use error::{GatewayError, Result};
pub use usage::{
    init_usage_recorder, record_usage, shutdown_usage_recorder, AccountingGuard, UsageCounters,
    UsageRecord, UsageRecorder,
};
