//! Infrastructure layer: job stores, job execution, coordinator, config.

pub mod config;
pub mod jobs;

mod integration_tests;
