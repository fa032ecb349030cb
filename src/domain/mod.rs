//! Domain layer - Resource model and port definitions
//!
//! This module defines the storage resources the exporter reasons about and
//! the traits (ports) that adapters implement, following hexagonal
//! architecture principles.

pub mod model;
pub mod ports;

pub use model::*;
pub use ports::*;
