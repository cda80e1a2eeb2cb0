//! Shared constants, paths and file helpers.

pub mod fs;
pub mod paths;
