// Core types and execution engine for the testflow test-management service

pub mod actions;
pub mod broadcast;
pub mod definition;
pub mod error;
pub mod logging;
pub mod storage;
pub mod store;
pub mod types;
pub mod vars;
pub mod workflow;

pub use types::*;
