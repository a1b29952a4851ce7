//! Secret handling utilities.
//!
//! Re-exports the secrecy types used for the database URL and provider
//! credentials.

pub use secrecy::{ExposeSecret, SecretString};
