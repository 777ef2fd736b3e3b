//! Chain-of-custody and approval workflow core for laboratory samples.

pub mod allocator;
pub mod audit;
pub mod classify;
pub mod config;
pub mod custody;
pub mod error;
pub mod guard;
pub mod letter;
pub mod quality;
pub mod sample;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod utils;

pub use error::{LimsError, Result};
pub use service::{DocumentGenerator, LabService, Outcome, ValidatedCover};
pub use types::{Actor, Role};
