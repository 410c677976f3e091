//! Shared test utilities for the lodestar crates.
//!
//! - [`assert_eventually`] / [`assert_eventually_async`] - Poll a condition until it holds or a
//!   timeout expires
//! - [`assert_never`] - Check that a condition stays false for a window
//! - [`Recorder`] - Collect values pushed from callbacks and wait for them
//! - [`strategies`] - Proptest generators for service ids, zones, hosts and URIs

#![deny(unsafe_code)]
#![cfg_attr(test, allow(clippy::disallowed_methods))]

mod assertions;
pub use assertions::{assert_eventually, assert_eventually_async, assert_never};

mod recorder;
pub use recorder::Recorder;

pub mod strategies;
