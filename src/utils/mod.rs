//! The `utils` module provides the pieces shared by every other module of
//! the core: the error taxonomy and logging initialisation.

pub mod error;
pub mod logging;

pub use error::{BrokerError, StoreError};

#[cfg(test)]
mod tests;
