//! Resource Observer Module
//!
//! Correlates front-end NFS volumes with their backend claims and delivers a
//! stream of correlation events whenever either side changes.

pub mod correlation;
pub mod watch;

pub use correlation::*;
pub use watch::*;
