//! The `utils` module provides definitions shared across `relayhub`: the error
//! types of every layer and the logging setup.

pub mod error;
pub mod logging;

#[cfg(test)]
pub(crate) mod testing;
