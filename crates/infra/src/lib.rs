//! Infrastructure layer: task engine, record persistence, config, provider adapters.

pub mod config;
pub mod records;
pub mod tasks;

/// External service clients/adapters.
pub mod external;

mod integration_tests;
