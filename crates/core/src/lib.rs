//! Domain types shared by every fusion crate.
//!
//! Nothing in here performs I/O beyond reading the data directory during
//! settings validation. Process management lives in `fusion-worker`,
//! orchestration in `fusion-engine`.

pub mod channels;
pub mod config;
pub mod dream;
pub mod error;
pub mod imaging;
pub mod naming;
pub mod options;
pub mod protocol;
pub mod registry;
pub mod settings;
pub mod types;
