//! Shared building blocks for the dashboard request pipeline
//!
//! `Secret` keeps credential material out of logs; `Error` covers loading and
//! validating configuration files.

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
