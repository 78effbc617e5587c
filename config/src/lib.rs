//! Configuration types shared between inctune crates.

mod tune;
mod types;

pub use tune::*;
pub use types::*;
