//! Shared helpers for the converter.

pub mod fs;
pub mod http;
pub mod process;
