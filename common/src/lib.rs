//! Shared leaf types and utilities used across all satchel crates.

/// Exponential backoff iterators.
pub mod backoff;
/// Node configuration: every recognized option and its default.
pub mod config;
/// Protocol-wide constants.
pub mod constants;
/// Randomly generated identifiers.
pub mod id;
/// `TimestampMs`.
pub mod time;

/// Test utilities shared across crate boundaries.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
