//! Scaling control loop for Buildkite agent Auto Scaling groups.
//!
//! Each tick polls the Buildkite agent-metrics endpoint, computes a target
//! instance count for the configured Auto Scaling group, and drives the
//! group toward it while honoring cooldowns, scaling factors, and the
//! Elastic CI safety checks (stale-metric refusal, graceful termination,
//! dangling-instance reaping).

pub mod asg;
pub mod buildkite;
pub mod calculator;
pub mod cloudwatch;
pub mod error;
pub mod scaler;
pub mod secrets;

pub use crate::error::ScalerError;
pub use crate::scaler::{ScalePolicy, Scaler, ScalerParams};
