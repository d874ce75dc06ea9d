//! Shared types

pub mod error;

pub use error::{ReadFailure, Result, SessionError};
