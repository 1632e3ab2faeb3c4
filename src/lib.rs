//! Phased multi-worker delivery orchestrator.
//!
//! A run moves through ordered phases (planning, implementation, qa). Each
//! phase's tasks are dispatched to role-based workers in dependency order,
//! every state change is checkpointed, and a quality gate approves, revises
//! or rejects the phase before the next one starts.

pub mod cancel;
pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod errors;
pub mod gates;
pub mod graph;
pub mod model;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod telemetry;

pub use errors::{GraphError, RunError, StoreError, ValidationError};
pub use service::{Conductor, ConductorOptions, RunStatusView};
