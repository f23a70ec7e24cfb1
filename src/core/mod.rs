//! Core runtime infrastructure.
//!
//! This module contains the essential components for running Tessera:
//! - [`config`] - Configuration parsing and validation
//! - [`runtime`] - In-process cluster orchestration
//! - [`lifecycle`] - Component status and lifecycle hooks
//! - [`error`] - Error types and failure classification

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod runtime;
