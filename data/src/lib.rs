//! inctune data - labelled datasets handed to candidates
//!
//! This crate provides:
//! - `Dataset` - dense feature rows with class labels
//! - `synthetic::blobs` - seeded class blobs for demos and tests
//! - `order` - seeded visiting orders

pub mod dataset;
pub mod order;
pub mod synthetic;

pub use dataset::{Dataset, DatasetError};
pub use order::{seeded_permutation, seeded_shuffle};
pub use synthetic::blobs;
