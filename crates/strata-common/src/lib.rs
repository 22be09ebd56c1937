pub mod error;
pub mod sql;

pub use error::{Error, MigrationError, Result};
