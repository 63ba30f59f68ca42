// Core modules
pub mod criu;
pub mod error;
pub mod proto;

pub use error::{CrError, Result};
