//! tfworker: orchestrates Terraform definitions that depend on each other.
//!
//! Remote-state references become graph edges. Each definition is rendered
//! into its own workspace and driven through init, plan and apply/destroy,
//! with lifecycle hooks around every step.

pub mod cli;
pub mod core;
pub mod transport;
