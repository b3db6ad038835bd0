//! Provides API for the operator and related tooling.
#![warn(missing_docs)]

/// Backends creating and inspecting the resources of each load test type.
#[cfg(feature = "controller")]
pub mod backends;
/// Controller configuration.
#[cfg(feature = "controller")]
pub mod config;
/// Watches and reconciler of LoadTest resources.
#[cfg(feature = "controller")]
pub mod controller;
/// Labels module for managing resource labels.
#[cfg(feature = "controller")]
pub(crate) mod labels;
/// LoadTest custom resource.
pub mod loadtest;
/// Controller metrics.
#[cfg(feature = "controller")]
pub mod metrics;
/// Utils module for shared utility functions.
#[cfg(feature = "controller")]
pub mod utils;

/// Name of the controller, used as the value of the managed-by label.
pub const CONTROLLER_NAME: &str = "kangal";
