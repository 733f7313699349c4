//! Register manager - Common Types and Utilities
//!
//! This crate contains the handles, storage types and error definitions
//! shared by the target description, the register manager and the driver.

pub mod error;
pub mod types;

pub use error::{guard, CompilerError, ICE_PREFIX};
pub use types::*;
