//! Integration tests for ocimod.
//!
//! This crate doesn't contain any actual functionality.
//! It's a container for tests that drive the `ocimod` binary end to end.

#[doc(hidden)]
pub fn _dummy() {}
