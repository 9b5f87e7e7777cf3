//! Style Enforcement Tests
//!
//! Checks patterns clippy does not catch on its own.
//!
//! # Test Organization
//!
//! - `production_code` - No panicking unwraps and no dead code allowances
//!   outside tests
//!
//! These tests scan every `lockstep-*` crate of the workspace.

#[path = "style/production_code.rs"]
mod production_code;
