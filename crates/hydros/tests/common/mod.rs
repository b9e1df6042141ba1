//! Shared test utilities for hydros integration tests.
//!
//! This module provides:
//! - `GitFixture`: bare remotes under a temp dir, addressed through the URL template
//! - Fakes for the registry, the templating tool and the hosting platform

pub mod fakes;
pub mod harness;

pub use fakes::*;
pub use harness::GitFixture;
