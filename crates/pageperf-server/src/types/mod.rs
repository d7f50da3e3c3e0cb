//! Server types.

pub mod error;

pub use error::{ServerError, ServerResult};
