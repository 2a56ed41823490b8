//! Shared fixtures for the unit tests.

mod helpers;

pub use factories::*;
pub use helpers::*;
