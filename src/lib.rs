//! Normalization, validation, quality scoring and cross-device reconciliation of
//! e-book library records gathered from several reading platforms.

pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod observability;
pub mod pipeline;

// Layered boundaries for application and infrastructure
pub mod app;
pub mod infra;

pub use error::{ReconcileError, Result};
