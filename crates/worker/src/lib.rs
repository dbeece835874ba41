//! Worker process supervision.
//!
//! - [`WorkerSupervisor`] owns the single worker OS process: it spawns it,
//!   feeds it requests, republishes its responses on the hub, restarts it
//!   on settings changes, and fails in-flight requests when it dies.
//! - [`WorkerClient`] is the seam the dream manager drives.
//! - [`stub`] is a deterministic inference engine speaking the same
//!   protocol, shipped as the `fusion-stub-engine` binary.

pub mod client;
pub mod config;
pub mod devices;
pub mod error;
mod process;
pub mod stub;
pub mod supervisor;

pub use client::{ResponseStream, WorkerClient};
pub use config::WorkerConfig;
pub use error::WorkerError;
pub use supervisor::WorkerSupervisor;
