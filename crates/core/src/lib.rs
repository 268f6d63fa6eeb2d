//! `greenify-core` — shared identifiers and the domain error model.
//!
//! No IO and no async here; everything above builds on these primitives.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::UserId;
