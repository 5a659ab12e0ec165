//! End-to-end test suite for Trove.
//!
//! The integration tests under `tests/` drive accounts and devices across
//! crates against the scripted backend, transport and interaction doubles
//! in [`helpers`].

pub mod helpers;
