//! Dream orchestration on top of the worker supervisor.
//!
//! [`DreamManager`] validates dream options, drives each dream through its
//! lifecycle by folding worker responses ([`fold`]), commits finished
//! dreams ([`persist`]), and owns the worker settings.

pub mod config;
pub mod error;
pub mod fold;
pub mod manager;
pub mod persist;

pub use config::EngineConfig;
pub use error::EngineError;
pub use manager::{DreamManager, DreamStream, ManagerDeps};
