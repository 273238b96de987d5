//! # Infrastructure — I/O layer
//!
//! Concrete implementations of the seams defined in `core`: the SQLite
//! store and its repositories, the Bakta HTTP client, the model-bridge
//! client and the retention sweep.

pub mod archiver;
pub mod bakta_client;
pub mod bakta_repository;
pub mod job_repository;
pub mod model_bridge;
pub mod store;

#[cfg(test)]
mod archiver_tests;
#[cfg(test)]
mod bakta_repository_tests;
#[cfg(test)]
mod job_repository_tests;
