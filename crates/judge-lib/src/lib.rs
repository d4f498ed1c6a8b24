//! Alert judge library
//!
//! This crate provides the core functionality for:
//! - Sample conversion and remote-write shipping
//! - PUSH rule evaluation over an in-memory series cache
//! - PULL rule evaluation sharded over a hash ring
//! - Event deduplication and the alert/recovery state machine
//! - Health checks and observability

pub mod classpath;
pub mod cluster;
pub mod datasource;
pub mod error;
pub mod health;
pub mod judge;
pub mod models;
pub mod observability;
pub mod rules;

pub use error::{JudgeError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{JudgeMetrics, StructuredLogger};
