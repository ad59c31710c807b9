//! Tools and utilities
//!
//! This is a collection of small and useful tools.

pub mod fs;
pub mod http;
pub mod parallel_handler;
pub mod runtime;
pub mod time;

pub use parallel_handler::ParallelHandler;
