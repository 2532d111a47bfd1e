//! Tracing setup shared by the vigil binaries.

pub mod logging;
