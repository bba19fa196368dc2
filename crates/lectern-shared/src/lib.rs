//! # lectern-shared
//!
//! Types and primitives shared by the Lectern store and server: typed ids,
//! enums persisted as text, tunable defaults, and the symmetric crypto used
//! for key wrapping and artifact protection.

pub mod artifact;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod types;

pub use error::{CryptoError, ParseError};
