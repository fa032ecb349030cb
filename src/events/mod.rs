//! Event Model
//!
//! The fixed vocabulary of lifecycle facts (create / delete) and the
//! annotation keys that encode them on the backend claim.

pub mod keys;
pub mod record;

pub use keys::*;
pub use record::*;
